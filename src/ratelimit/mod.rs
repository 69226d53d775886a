//! Rate limiting logic: classification, subjects, counter stores and decisions.

mod class;
mod classifier;
mod distributed;
mod key;
mod limiter;
mod memory;
#[cfg(feature = "redis-store")]
mod redis;
mod rules;
mod store;

pub use class::RateLimitClass;
pub use classifier::{EndpointClassifier, RouteClass};
pub use distributed::MeshCounterStore;
pub use key::{CounterKey, Subject, SubjectKind};
pub use limiter::{Decision, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use memory::MemoryCounterStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisCounterStore;
pub use rules::{RouteRule, RulesConfig};
pub use store::{Clock, CounterStore, Increment, ManualClock, StoreError, SystemClock};
