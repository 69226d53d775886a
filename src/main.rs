use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bouncer::config::{BouncerConfig, LogFormat, StoreBackend};
use bouncer::http::{AppState, HttpServer};
use bouncer::mesh::Cluster;
use bouncer::ratelimit::{
    CounterStore, EndpointClassifier, MemoryCounterStore, MeshCounterStore, RateLimiter,
    RulesConfig,
};

/// Rate limit decision service.
#[derive(Debug, Parser)]
#[command(name = "bouncer", version, about)]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Rate limit rules file
    #[arg(long)]
    rules: Option<String>,

    /// Counter store backend
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BouncerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(rules) = cli.rules {
        config.limiter.rules_path = Some(rules);
    }
    if let Some(store) = cli.store {
        config.store.backend = store;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Bouncer rate limit service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        store = ?config.store.backend,
        "Configuration loaded"
    );

    let classifier = load_classifier(config.limiter.rules_path.as_deref(), &config.limiter.check_class)?;
    info!(routes = classifier.routes().len(), "Rate limit rules loaded");

    // Keep the cluster handle so it can be shut down cleanly
    let mut cluster: Option<Arc<Cluster>> = None;
    let mut memory_store: Option<Arc<MemoryCounterStore>> = None;
    let mut mesh_store: Option<Arc<MeshCounterStore>> = None;

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            memory_store = Some(store.clone());
            store
        }
        StoreBackend::Mesh => {
            let started = Arc::new(Cluster::start(config.store.mesh.to_cluster_config()).await?);
            info!(node_id = %started.node_id(), "Joined counter mesh");
            cluster = Some(started.clone());
            let store = Arc::new(MeshCounterStore::new(started));
            mesh_store = Some(store.clone());
            store
        }
        StoreBackend::Redis => redis_store(&config.store.redis_url).await?,
    };

    let rate_limiter = Arc::new(
        RateLimiter::new(store, classifier).with_store_timeout(config.limiter.store_timeout()),
    );
    info!(timeout = ?config.limiter.store_timeout(), "Rate limiter initialized");

    let mut background = Vec::new();

    if let Some(path) = config.limiter.rules_path.clone() {
        if config.limiter.rules_reload_interval_secs > 0 {
            background.push(tokio::spawn(reload_rules(
                rate_limiter.clone(),
                path,
                config.limiter.check_class.clone(),
                Duration::from_secs(config.limiter.rules_reload_interval_secs),
            )));
        }
    }

    if config.limiter.purge_interval_secs > 0 {
        let every = Duration::from_secs(config.limiter.purge_interval_secs);
        if let Some(store) = memory_store.take() {
            background.push(tokio::spawn(purge_expired(store, every)));
        }
        if let Some(store) = mesh_store.take() {
            background.push(tokio::spawn(purge_mesh_windows(store, every)));
        }
    }

    let state = AppState::new(rate_limiter, &config.limiter.check_class);
    let server = HttpServer::new(config.server.listen_addr, state);

    server.serve_with_shutdown(shutdown_signal()).await?;

    // Background tasks hold limiter and store references; stop them before the mesh
    for task in background {
        task.abort();
        let _ = task.await;
    }
    drop(mesh_store);

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still in use, skipping graceful mesh shutdown"),
        }
    }

    info!("Bouncer rate limit service stopped");
    Ok(())
}

fn init_tracing(config: &BouncerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }
}

/// Load the rule set and make sure the check endpoint's class exists.
fn load_classifier(path: Option<&str>, check_class: &str) -> anyhow::Result<EndpointClassifier> {
    let rules = match path {
        Some(path) => RulesConfig::from_file(path)?,
        None => RulesConfig::default(),
    };

    if rules.class(check_class).is_none() {
        anyhow::bail!("check class '{}' is not declared in the rules", check_class);
    }

    Ok(rules.into_classifier()?)
}

#[cfg(feature = "redis-store")]
async fn redis_store(url: &str) -> anyhow::Result<Arc<dyn CounterStore>> {
    let store = bouncer::ratelimit::RedisCounterStore::connect(url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn redis_store(_url: &str) -> anyhow::Result<Arc<dyn CounterStore>> {
    anyhow::bail!("the redis store requires building with the `redis-store` feature")
}

/// Periodically re-read the rules file. A bad file keeps the current rules.
async fn reload_rules(limiter: Arc<RateLimiter>, path: String, check_class: String, every: Duration) {
    let mut ticks = IntervalStream::new(tokio::time::interval(every)).skip(1);

    while ticks.next().await.is_some() {
        match load_classifier(Some(&path), &check_class) {
            Ok(classifier) => {
                limiter.set_classifier(classifier);
                info!(path = %path, "Rate limit rules reloaded");
            }
            Err(e) => error!(path = %path, error = %e, "Failed to reload rules, keeping current rules"),
        }
    }
}

/// Periodically drop expired in-memory counters.
async fn purge_expired(store: Arc<MemoryCounterStore>, every: Duration) {
    let mut ticks = IntervalStream::new(tokio::time::interval(every));

    while ticks.next().await.is_some() {
        let removed = store.purge_expired();
        if removed > 0 {
            info!(removed = removed, remaining = store.len(), "Purged expired counters");
        }
    }
}

/// Periodically delete this node's closed counter windows from the mesh.
async fn purge_mesh_windows(store: Arc<MeshCounterStore>, every: Duration) {
    let mut ticks = IntervalStream::new(tokio::time::interval(every));

    while ticks.next().await.is_some() {
        let removed = store.purge_expired().await;
        if removed > 0 {
            let remaining = store.window_count().await;
            info!(
                removed = removed,
                remaining = remaining,
                "Pruned closed mesh counter windows"
            );
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
