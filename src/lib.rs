//! Bouncer - Rate Limit Decision Service
//!
//! This crate decides whether a request may proceed. A request path is mapped
//! to a rate limit class, per-subject counters (IP, email, account) are
//! incremented in a pluggable counter store, and the counts are compared with
//! the class threshold. The counter store can be in-process, a gossip mesh of
//! Bouncer instances, or Redis.

pub mod config;
pub mod error;
pub mod http;
pub mod mesh;
pub mod ratelimit;
