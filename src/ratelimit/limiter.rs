//! Core rate limiter implementation.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::class::RateLimitClass;
use super::classifier::EndpointClassifier;
use super::key::{CounterKey, Subject};
use super::store::{CounterStore, Increment, StoreError};
use crate::error::{BouncerError, Result};

/// Default bound on a single counter store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// The outcome of a rate limit check. Computed per call, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Highest counter value observed across the checked subjects
    pub attempts: u64,
    /// Smallest remaining quota across the checked subjects
    pub remaining: u64,
    /// Seconds until the blocking counter expires, set only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl Decision {
    /// The decision returned when the counter store failed.
    fn fail_open(remaining: u64) -> Self {
        Self {
            allowed: true,
            attempts: 0,
            remaining,
            retry_after_seconds: None,
        }
    }
}

/// Decides whether subjects may proceed, with counts held in a [`CounterStore`].
///
/// The limiter keeps no counter state itself and needs no locking on the
/// request path beyond a brief read of the current classifier.
pub struct RateLimiter {
    /// Where counters live
    store: Arc<dyn CounterStore>,
    /// Path classification rules, swappable at runtime
    classifier: RwLock<Arc<EndpointClassifier>>,
    /// Upper bound on each store call
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(store: Arc<dyn CounterStore>, classifier: EndpointClassifier) -> Self {
        Self {
            store,
            classifier: RwLock::new(Arc::new(classifier)),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Set the bound on each store call. A call that takes longer counts as a
    /// store failure.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Get the current classifier.
    pub fn classifier(&self) -> Arc<EndpointClassifier> {
        self.classifier.read().clone()
    }

    /// Replace the classifier, e.g. after the rules file changed.
    pub fn set_classifier(&self, classifier: EndpointClassifier) {
        *self.classifier.write() = Arc::new(classifier);
    }

    /// Check every `(subject, class)` pair; all must pass for the request to
    /// be allowed.
    ///
    /// Counters are incremented before comparing, so a denied call still
    /// counts against its subjects. If the store fails or times out for any
    /// pair the request is allowed.
    pub async fn check(&self, checks: &[(Subject, RateLimitClass)]) -> Result<Decision> {
        if checks.is_empty() {
            return Err(BouncerError::InvalidSubject(
                "at least one subject is required".to_string(),
            ));
        }

        let results = join_all(
            checks
                .iter()
                .map(|(subject, class)| self.increment(subject, class)),
        )
        .await;

        let mut increments = Vec::with_capacity(results.len());
        for ((_, class), result) in checks.iter().zip(results) {
            match result {
                Ok(inc) => increments.push((class, inc)),
                Err(e) => {
                    warn!(
                        class = %class.name,
                        error = %e,
                        "Counter store failed, allowing request"
                    );
                    let remaining = checks.iter().map(|(_, c)| c.max_requests).min().unwrap_or(0);
                    return Ok(Decision::fail_open(remaining));
                }
            }
        }

        Ok(Self::decide(&increments))
    }

    /// Classify `path` and check every subject under the matched class.
    pub async fn check_path(
        &self,
        path: &str,
        subjects: Vec<Subject>,
    ) -> Result<(RateLimitClass, Decision)> {
        let class = self.classifier().classify(path).clone();
        trace!(path = %path, class = %class.name, "Classified request path");

        let checks: Vec<_> = subjects.into_iter().map(|s| (s, class.clone())).collect();
        let decision = self.check(&checks).await?;
        Ok((class, decision))
    }

    /// One bounded store call.
    async fn increment(
        &self,
        subject: &Subject,
        class: &RateLimitClass,
    ) -> std::result::Result<Increment, StoreError> {
        let key = CounterKey::new(&class.name, subject);

        match tokio::time::timeout(
            self.store_timeout,
            self.store.increment(&key, class.window_seconds),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    /// Fold per-subject counts into one decision.
    fn decide(increments: &[(&RateLimitClass, Increment)]) -> Decision {
        let mut allowed = true;
        let mut attempts = 0;
        let mut remaining = u64::MAX;
        let mut retry_after: Option<u64> = None;

        for (class, inc) in increments {
            attempts = attempts.max(inc.count);
            remaining = remaining.min(class.max_requests.saturating_sub(inc.count));

            if inc.count > class.max_requests {
                allowed = false;
                let wait = inc
                    .ttl_seconds
                    .filter(|ttl| *ttl > 0)
                    .unwrap_or(class.window_seconds);
                retry_after = Some(retry_after.map_or(wait, |r| r.max(wait)));

                debug!(
                    class = %class.name,
                    count = inc.count,
                    limit = class.max_requests,
                    "Rate limit exceeded"
                );
            }
        }

        Decision {
            allowed,
            attempts,
            remaining,
            retry_after_seconds: retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::classifier::RouteClass;
    use crate::ratelimit::memory::MemoryCounterStore;
    use crate::ratelimit::store::ManualClock;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    fn login() -> RateLimitClass {
        RateLimitClass::new("login", 12, 300)
    }

    fn classifier() -> EndpointClassifier {
        EndpointClassifier::new(
            RateLimitClass::new("default", 100, 60),
            vec![RouteClass {
                prefix: "/api/v1/links".to_string(),
                class: RateLimitClass::new("links", 2, 60),
            }],
            vec!["/api/v1/".to_string()],
        )
    }

    fn limiter_with_clock(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounterStore::with_clock(clock)), classifier())
    }

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn increment(&self, _: &CounterKey, _: u64) -> std::result::Result<Increment, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn increment(&self, _: &CounterKey, _: u64) -> std::result::Result<Increment, StoreError> {
            std::future::pending().await
        }
    }

    /// Always reports the same count and no TTL.
    struct FixedStore(u64);

    #[async_trait]
    impl CounterStore for FixedStore {
        async fn increment(&self, _: &CounterKey, _: u64) -> std::result::Result<Increment, StoreError> {
            Ok(Increment {
                count: self.0,
                ttl_seconds: None,
            })
        }
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let limiter = limiter_with_clock(clock);
        let checks = vec![(Subject::ip("1.2.3.4").unwrap(), login())];

        let mut last_remaining = u64::MAX;
        for i in 1..=12 {
            let decision = limiter.check(&checks).await.unwrap();
            assert!(decision.allowed, "call {} should be allowed", i);
            assert_eq!(decision.attempts, i);
            assert!(decision.remaining < last_remaining);
            assert_eq!(decision.retry_after_seconds, None);
            last_remaining = decision.remaining;
        }
        assert_eq!(last_remaining, 0);

        let decision = limiter.check(&checks).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.attempts, 13);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_seconds, Some(300));
    }

    #[tokio::test]
    async fn test_denied_calls_still_count() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = limiter_with_clock(clock);
        let checks = vec![(Subject::ip("1.2.3.4").unwrap(), RateLimitClass::new("x", 1, 60))];

        limiter.check(&checks).await.unwrap();
        assert_eq!(limiter.check(&checks).await.unwrap().attempts, 2);
        assert_eq!(limiter.check(&checks).await.unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_window_expiry_resets_count() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = limiter_with_clock(clock.clone());
        let checks = vec![(Subject::ip("1.2.3.4").unwrap(), login())];

        for _ in 0..13 {
            limiter.check(&checks).await.unwrap();
        }
        clock.advance(Duration::from_secs(300));

        let decision = limiter.check(&checks).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.attempts, 1);
        assert_eq!(decision.remaining, 11);
    }

    #[tokio::test]
    async fn test_retry_after_shrinks_with_time() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = limiter_with_clock(clock.clone());
        let checks = vec![(Subject::ip("1.2.3.4").unwrap(), RateLimitClass::new("x", 1, 300))];

        limiter.check(&checks).await.unwrap();
        clock.advance(Duration::from_secs(120));

        let decision = limiter.check(&checks).await.unwrap();
        assert_eq!(decision.retry_after_seconds, Some(180));
    }

    #[tokio::test]
    async fn test_both_subjects_must_pass() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = limiter_with_clock(clock);
        let class = RateLimitClass::new("login", 3, 300);
        let email = Subject::email("victim@example.com").unwrap();

        // Spread attempts on one email across several IPs
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let checks = vec![(Subject::ip(ip).unwrap(), class.clone()), (email.clone(), class.clone())];
            assert!(limiter.check(&checks).await.unwrap().allowed);
        }

        let checks = vec![(Subject::ip("10.0.0.4").unwrap(), class.clone()), (email, class)];
        let decision = limiter.check(&checks).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.attempts, 4);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_fail_open_on_store_error() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), classifier());
        let checks = vec![(Subject::ip("1.2.3.4").unwrap(), login())];

        for _ in 0..20 {
            let decision = limiter.check(&checks).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.retry_after_seconds, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_open_on_store_timeout() {
        let limiter = RateLimiter::new(Arc::new(HangingStore), classifier())
            .with_store_timeout(Duration::from_millis(50));
        let checks = vec![(Subject::ip("1.2.3.4").unwrap(), login())];

        let decision = assert_ok!(limiter.check(&checks).await);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 12);
    }

    #[tokio::test]
    async fn test_missing_ttl_falls_back_to_window() {
        let limiter = RateLimiter::new(Arc::new(FixedStore(50)), classifier());
        let checks = vec![(Subject::account("42").unwrap(), login())];

        let decision = limiter.check(&checks).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_seconds, Some(300));
    }

    #[tokio::test]
    async fn test_empty_checks_rejected() {
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), classifier());
        let err = assert_err!(limiter.check(&[]).await);
        assert!(matches!(err, BouncerError::InvalidSubject(_)));
    }

    #[tokio::test]
    async fn test_check_path_uses_route_class() {
        let clock = Arc::new(ManualClock::new(1_000));
        let limiter = limiter_with_clock(clock);
        let ip = Subject::ip("1.2.3.4").unwrap();

        let (class, first) = limiter
            .check_path("/api/v1/bob/links/abc123", vec![ip.clone()])
            .await
            .unwrap();
        assert_eq!(class.name, "links");
        assert!(first.allowed);

        limiter.check_path("/api/v1/alice/links?x=1", vec![ip.clone()]).await.unwrap();
        let (_, third) = limiter.check_path("/api/v1/links", vec![ip]).await.unwrap();
        assert!(!third.allowed);
    }

    #[tokio::test]
    async fn test_set_classifier_swaps_rules() {
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), classifier());
        assert_eq!(limiter.classifier().classify("/upload").name, "default");

        limiter.set_classifier(EndpointClassifier::new(
            RateLimitClass::new("default", 100, 60),
            vec![RouteClass {
                prefix: "/upload".to_string(),
                class: RateLimitClass::new("upload", 5, 60),
            }],
            Vec::new(),
        ));
        assert_eq!(limiter.classifier().classify("/upload").name, "upload");
    }
}
