//! Wall clock anchored to a monotonic instant.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Epoch milliseconds that advance with `tokio::time`, so paused test
/// runtimes move window timestamps too.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch_ms_at_start: u64,
    started: Instant,
}

impl Clock {
    pub fn new() -> Self {
        let epoch_ms_at_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            epoch_ms_at_start,
            started: Instant::now(),
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.epoch_ms_at_start + self.started.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert epoch milliseconds for display and error hints.
pub fn to_datetime(epoch_ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(epoch_ms as i64).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::new();
        let before = clock.now_ms();

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(clock.now_ms() - before, 5000);
    }

    #[test]
    fn test_to_datetime() {
        assert_eq!(to_datetime(1_000).timestamp_millis(), 1_000);
    }
}
