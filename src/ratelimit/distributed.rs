//! Counter store backed by the gossip mesh.
//!
//! Lets several Bouncer instances share counters without a central cache.
//! Windows are aligned to the epoch, so every node agrees on the window a
//! request falls into. The window's end is part of the gossiped key: a new
//! window starts from zero, and closed windows are deleted either when the
//! same counter moves on or by [`MeshCounterStore::purge_expired`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use super::key::CounterKey;
use super::store::{Clock, CounterStore, Increment, StoreError, SystemClock};
use crate::mesh::{Cluster, WindowKey};

/// A [`CounterStore`] over a chitchat [`Cluster`].
pub struct MeshCounterStore {
    /// The cluster for distributed state.
    cluster: Arc<Cluster>,
    clock: Arc<dyn Clock>,
}

impl MeshCounterStore {
    /// Create a new mesh store on the system clock.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self::with_clock(cluster, Arc::new(SystemClock))
    }

    /// Create a new mesh store on a custom clock.
    pub fn with_clock(cluster: Arc<Cluster>, clock: Arc<dyn Clock>) -> Self {
        Self { cluster, clock }
    }

    /// Drop this node's counter windows that have closed.
    pub async fn purge_expired(&self) -> usize {
        self.cluster.prune_expired(self.clock.now_secs()).await
    }

    /// Number of counter windows this node currently gossips.
    pub async fn window_count(&self) -> usize {
        self.cluster.local_window_count().await
    }

    /// Start of the window containing `now`.
    fn window_start(now: u64, window_seconds: u64) -> u64 {
        (now / window_seconds) * window_seconds
    }
}

#[async_trait]
impl CounterStore for MeshCounterStore {
    async fn increment(&self, key: &CounterKey, window_seconds: u64) -> Result<Increment, StoreError> {
        if window_seconds == 0 {
            return Err(StoreError::Unavailable("window must be non-zero".to_string()));
        }

        let now = self.clock.now_secs();
        let window_start = Self::window_start(now, window_seconds);
        let window_end = window_start.saturating_add(window_seconds);
        let window_key = WindowKey::new(key.as_str(), window_end);

        let count = self.cluster.increment_counter(&window_key, 1).await;
        let ttl = window_end.saturating_sub(now);

        trace!(
            key = %key,
            window = window_start,
            count = count,
            "Incremented mesh counter"
        );

        Ok(Increment {
            count,
            ttl_seconds: Some(ttl),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;
    use crate::ratelimit::key::Subject;
    use crate::ratelimit::store::ManualClock;
    use std::time::Duration;

    fn test_cluster_config(port: u16) -> ClusterConfig {
        let addr: std::net::SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_window_start_alignment() {
        assert_eq!(MeshCounterStore::window_start(1_000, 300), 900);
        assert_eq!(MeshCounterStore::window_start(1_200, 300), 1_200);
        assert_eq!(MeshCounterStore::window_start(59, 60), 0);
    }

    #[tokio::test]
    async fn test_mesh_store_counts_and_rolls_over() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18946)).await.unwrap());
        let clock = Arc::new(ManualClock::new(1_000));

        {
            let store = MeshCounterStore::with_clock(cluster.clone(), clock.clone());
            let key = CounterKey::new("login", &Subject::ip("1.2.3.4").unwrap());

            let first = store.increment(&key, 300).await.unwrap();
            assert_eq!(first.count, 1);
            assert_eq!(first.ttl_seconds, Some(200));

            let second = store.increment(&key, 300).await.unwrap();
            assert_eq!(second.count, 2);

            clock.advance(Duration::from_secs(200));
            let rolled = store.increment(&key, 300).await.unwrap();
            assert_eq!(rolled.count, 1);
            assert_eq!(rolled.ttl_seconds, Some(300));
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_holds_one_window_per_counter() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18948)).await.unwrap());
        let clock = Arc::new(ManualClock::new(1_000));

        {
            let store = MeshCounterStore::with_clock(cluster.clone(), clock.clone());
            let key = CounterKey::new("default", &Subject::ip("1.2.3.4").unwrap());

            for _ in 0..1000 {
                assert_eq!(store.increment(&key, 60).await.unwrap().count, 1);
                clock.advance(Duration::from_secs(60));
            }
            assert_eq!(store.window_count().await, 1);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_purges_closed_windows() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18949)).await.unwrap());
        let clock = Arc::new(ManualClock::new(1_000));

        {
            let store = MeshCounterStore::with_clock(cluster.clone(), clock.clone());
            for i in 0..10 {
                let key = CounterKey::new("login", &Subject::ip(&format!("10.0.0.{}", i)).unwrap());
                store.increment(&key, 300).await.unwrap();
            }
            let email = CounterKey::new("email", &Subject::email("a@example.com").unwrap());
            store.increment(&email, 3600).await.unwrap();

            assert_eq!(store.purge_expired().await, 0);
            clock.advance(Duration::from_secs(200));
            assert_eq!(store.purge_expired().await, 10);
            assert_eq!(store.window_count().await, 1);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_rejects_zero_window() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18947)).await.unwrap());

        {
            let store = MeshCounterStore::new(cluster.clone());
            let key = CounterKey::new("login", &Subject::ip("1.2.3.4").unwrap());
            assert!(store.increment(&key, 0).await.is_err());
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
