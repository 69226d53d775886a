//! Gossip cluster holding each node's share of the windowed counters.
//!
//! Every node writes only its own contributions, one chitchat key per
//! counter window, and reads the others' as last gossiped. A window's key
//! carries the time the window ends so any node can drop it once it has
//! passed; deletions travel to peers as chitchat tombstones.

use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use thiserror::Error;
use tracing::{debug, info};

/// Prefix of every counter key in the gossip state.
const COUNTER_PREFIX: &str = "counter|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// How long dead nodes and deleted keys linger before being collected.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "bouncer".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// A counter key scoped to one epoch-aligned window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The store-level counter key (e.g. `ratelimit:login:ip:1.2.3.4`).
    pub key: String,
    /// Epoch second at which the window closes.
    pub expires_at: u64,
}

impl WindowKey {
    pub fn new(key: &str, expires_at: u64) -> Self {
        Self {
            key: key.to_string(),
            expires_at,
        }
    }

    /// Gossip key, `counter|{key}|{expires_at}`.
    pub fn to_chitchat_key(&self) -> String {
        format!("{}{}|{}", COUNTER_PREFIX, self.key, self.expires_at)
    }

    pub fn from_chitchat_key(raw: &str) -> Option<Self> {
        // Split from the right, counter keys may contain the delimiter
        let (key, expires_at) = raw.strip_prefix(COUNTER_PREFIX)?.rsplit_once('|')?;
        if key.is_empty() {
            return None;
        }

        Some(Self {
            key: key.to_string(),
            expires_at: expires_at.parse().ok()?,
        })
    }

    fn has_ended(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// The cluster handle for distributed counter state.
pub struct Cluster {
    node_id: String,
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Join (or found) the mesh described by `config`.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId {
                node_id: config.node_id.clone(),
                generation_id: 0,
                gossip_advertise_addr: config.advertise_addr,
            },
            cluster_id: config.cluster_id,
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes,
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        Ok(Self {
            node_id: config.node_id,
            handle,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add `amount` to this node's share of `window` and return the
    /// mesh-wide total.
    ///
    /// Any earlier window this node still holds for the same counter is
    /// deleted in the same critical section.
    pub async fn increment_counter(&self, window: &WindowKey, amount: u64) -> u64 {
        let chitchat_key = window.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let superseded = Self::own_windows(&mut chitchat, |held| {
            held.key == window.key && held.expires_at < window.expires_at
        });
        for stale in &superseded {
            chitchat.self_node_state().delete(stale);
        }

        let local = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            .saturating_add(amount);
        chitchat.self_node_state().set(&chitchat_key, local);

        debug!(
            key = %chitchat_key,
            local_value = local,
            superseded = superseded.len(),
            "Incremented local counter"
        );

        Self::sum_counter(&chitchat, &chitchat_key)
    }

    /// Mesh-wide total for `window`, without incrementing it.
    pub async fn get_count(&self, window: &WindowKey) -> u64 {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Self::sum_counter(&chitchat, &window.to_chitchat_key())
    }

    /// Delete this node's windows that closed at or before `now`.
    /// Returns how many were removed.
    pub async fn prune_expired(&self, now: u64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let expired = Self::own_windows(&mut chitchat, |held| held.has_ended(now));
        for key in &expired {
            chitchat.self_node_state().delete(key);
        }
        expired.len()
    }

    /// Number of counter windows this node currently publishes.
    pub async fn local_window_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        Self::own_windows(&mut chitchat, |_| true).len()
    }

    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Raw gossip keys of this node's windows that match `select`.
    fn own_windows(chitchat: &mut Chitchat, select: impl Fn(&WindowKey) -> bool) -> Vec<String> {
        chitchat
            .self_node_state()
            .iter_prefix(COUNTER_PREFIX)
            .filter(|(raw, _)| WindowKey::from_chitchat_key(raw).is_some_and(|held| select(&held)))
            .map(|(raw, _)| raw.to_string())
            .collect()
    }

    fn sum_counter(chitchat: &Chitchat, key: &str) -> u64 {
        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|state| state.get(key))
            .filter_map(|value| value.parse::<u64>().ok())
            .fold(0u64, u64::saturating_add)
    }

    /// Leave the mesh and stop gossiping.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBJECT: &str = "ratelimit:login:ip:1.2.3.4";

    fn node_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("bouncer-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "bouncer-test".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_window_key_format() {
        let window = WindowKey::new(SUBJECT, 1_704_067_500);
        let raw = window.to_chitchat_key();
        assert_eq!(raw, "counter|ratelimit:login:ip:1.2.3.4|1704067500");
        assert_eq!(WindowKey::from_chitchat_key(&raw), Some(window));
    }

    #[test]
    fn test_window_key_keeps_inner_delimiters() {
        let parsed = WindowKey::from_chitchat_key("counter|ratelimit:a|b:user:x|60").unwrap();
        assert_eq!(parsed.key, "ratelimit:a|b:user:x");
        assert_eq!(parsed.expires_at, 60);
    }

    #[test]
    fn test_window_key_rejects_foreign_keys() {
        assert!(WindowKey::from_chitchat_key("invalid").is_none());
        assert!(WindowKey::from_chitchat_key("counter|nowindow").is_none());
        assert!(WindowKey::from_chitchat_key("counter||123").is_none());
        assert!(WindowKey::from_chitchat_key("counter|a|soon").is_none());
        assert!(WindowKey::from_chitchat_key("notcounter|a|123").is_none());
    }

    #[test]
    fn test_window_has_ended() {
        let window = WindowKey::new(SUBJECT, 1_060);
        assert!(!window.has_ended(1_059));
        assert!(window.has_ended(1_060));
    }

    #[tokio::test]
    async fn test_counter_accumulates_within_window() {
        let cluster = Cluster::start(node_config(17946)).await.unwrap();
        let window = WindowKey::new(SUBJECT, 1_060);

        assert_eq!(cluster.live_node_count().await, 1);
        assert_eq!(cluster.increment_counter(&window, 5).await, 5);
        assert_eq!(cluster.increment_counter(&window, 3).await, 8);
        assert_eq!(cluster.get_count(&window).await, 8);
        assert_eq!(cluster.local_window_count().await, 1);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_next_window_replaces_previous() {
        let cluster = Cluster::start(node_config(17947)).await.unwrap();
        let other = WindowKey::new("ratelimit:login:ip:9.9.9.9", 1_060);
        let first = WindowKey::new(SUBJECT, 1_060);
        let second = WindowKey::new(SUBJECT, 1_120);

        cluster.increment_counter(&other, 1).await;
        cluster.increment_counter(&first, 1).await;
        cluster.increment_counter(&first, 1).await;
        assert_eq!(cluster.increment_counter(&second, 1).await, 1);

        assert_eq!(cluster.get_count(&first).await, 0);
        assert_eq!(cluster.get_count(&other).await, 1);
        assert_eq!(cluster.local_window_count().await, 2);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_expired_windows() {
        let cluster = Cluster::start(node_config(17948)).await.unwrap();
        let short = WindowKey::new(SUBJECT, 1_060);
        let long = WindowKey::new("ratelimit:email:email:a@example.com", 4_600);

        cluster.increment_counter(&short, 2).await;
        cluster.increment_counter(&long, 1).await;

        assert_eq!(cluster.prune_expired(1_059).await, 0);
        assert_eq!(cluster.prune_expired(1_060).await, 1);
        assert_eq!(cluster.get_count(&short).await, 0);
        assert_eq!(cluster.get_count(&long).await, 1);
        assert_eq!(cluster.prune_expired(1_060).await, 0);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pruned_window_disappears_from_peers() {
        let first = Cluster::start(node_config(17949)).await.unwrap();
        let mut config = node_config(17950);
        config.seed_nodes = vec!["127.0.0.1:17949".to_string()];
        let second = Cluster::start(config).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(first.live_node_count().await, 2);

        let window = WindowKey::new(SUBJECT, 1_060);
        first.increment_counter(&window, 10).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(second.increment_counter(&window, 5).await, 15);

        first.prune_expired(2_000).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(second.get_count(&window).await, 5);

        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
    }
}
