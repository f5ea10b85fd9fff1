//! Per call site rate limit rules.
//!
//! A [`RateLimitConfig`] is built in code where a client is constructed and
//! passed to every limiter operation for that identifier.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RateLimitError, Result};

/// Rate limit rule for a single identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Key partitioning window, queue and circuit state
    pub identifier: String,
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Hard ceiling above `max_requests` inside the same window
    #[serde(default)]
    pub burst_limit: Option<u32>,
    /// Maximum pending entries; unset or zero disables queueing
    #[serde(default)]
    pub queue_size: Option<usize>,
    /// Queue priority, higher is served first
    #[serde(default)]
    pub priority: Option<i32>,
}

impl RateLimitConfig {
    pub fn new(identifier: impl Into<String>, max_requests: u32, window_ms: u64) -> Self {
        Self {
            identifier: identifier.into(),
            max_requests,
            window_ms,
            burst_limit: None,
            queue_size: None,
            priority: None,
        }
    }

    pub fn with_burst_limit(mut self, burst_limit: u32) -> Self {
        self.burst_limit = Some(burst_limit);
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Reject rules that can never admit anything.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(RateLimitError::Config("identifier is required".to_string()));
        }
        if self.max_requests == 0 {
            return Err(RateLimitError::Config(format!(
                "{}: max_requests must be positive",
                self.identifier
            )));
        }
        if self.window_ms == 0 {
            return Err(RateLimitError::Config(format!(
                "{}: window_ms must be positive",
                self.identifier
            )));
        }
        Ok(())
    }

    /// Number of admissions allowed inside one window, burst included.
    pub fn ceiling(&self) -> u32 {
        match self.burst_limit {
            Some(burst) => burst.max(self.max_requests),
            None => self.max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Queue capacity, zero when queueing is disabled.
    pub fn queue_capacity(&self) -> usize {
        self.queue_size.unwrap_or(0)
    }

    pub fn queue_priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_without_burst() {
        let config = RateLimitConfig::new("api", 5, 60_000);
        assert_eq!(config.ceiling(), 5);
    }

    #[test]
    fn test_burst_raises_ceiling() {
        let config = RateLimitConfig::new("api", 5, 60_000).with_burst_limit(8);
        assert_eq!(config.ceiling(), 8);
    }

    #[test]
    fn test_burst_below_max_is_ignored() {
        let config = RateLimitConfig::new("api", 5, 60_000).with_burst_limit(2);
        assert_eq!(config.ceiling(), 5);
    }

    #[test]
    fn test_validate() {
        assert!(RateLimitConfig::new("api", 5, 1000).validate().is_ok());
        assert!(RateLimitConfig::new("", 5, 1000).validate().is_err());
        assert!(RateLimitConfig::new("api", 0, 1000).validate().is_err());
        assert!(RateLimitConfig::new("api", 5, 0).validate().is_err());
    }

    #[test]
    fn test_parse_from_json() {
        let json = r#"{"identifier":"polygon","max_requests":5,"window_ms":60000,"queue_size":3}"#;
        let config: RateLimitConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.identifier, "polygon");
        assert_eq!(config.queue_capacity(), 3);
        assert_eq!(config.burst_limit, None);
        assert_eq!(config.queue_priority(), 0);
    }
}
