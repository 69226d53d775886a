//! Peer mesh for sharing counters between Bouncer instances.
//!
//! Uses the chitchat library for gossip-based cluster membership and
//! dissemination of each node's counter contributions.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError, WindowKey};
