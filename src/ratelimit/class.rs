//! Rate limit classes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BouncerError, Result};

/// Longest window a class may declare: one year.
pub const MAX_WINDOW_SECONDS: u64 = 365 * 24 * 60 * 60;

/// A named rate limit rule: at most `max_requests` within `window_seconds`.
///
/// Classes are immutable once loaded. Exactly one class governs a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitClass {
    /// Class name, also used as part of the counter key
    pub name: String,
    /// Maximum number of requests allowed in one window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl RateLimitClass {
    /// Create a new class.
    pub fn new(name: impl Into<String>, max_requests: u64, window_seconds: u64) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window_seconds,
        }
    }

    /// Get the window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    /// Reject classes that could never allow a request or never expire.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BouncerError::Config("rate limit class name is empty".to_string()));
        }
        if self.max_requests == 0 {
            return Err(BouncerError::Config(format!(
                "class '{}': max_requests must be greater than zero",
                self.name
            )));
        }
        if self.window_seconds == 0 {
            return Err(BouncerError::Config(format!(
                "class '{}': window_seconds must be greater than zero",
                self.name
            )));
        }
        if self.window_seconds > MAX_WINDOW_SECONDS {
            return Err(BouncerError::Config(format!(
                "class '{}': window_seconds must be at most {}",
                self.name, MAX_WINDOW_SECONDS
            )));
        }
        Ok(())
    }
}
