//! In-process sliding window counters.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{StoreError, WindowDecision, WindowSnapshot, WindowStore};
use super::rules::RateLimitConfig;

/// Request timestamps for one identifier.
///
/// A timestamp `t` is inside the window at `now` when `now - window < t <= now`,
/// so `oldest + window` is exactly the instant a slot frees up.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    timestamps: VecDeque<u64>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop timestamps that have left the window.
    fn evict(&mut self, window_ms: u64, now_ms: u64) {
        let Some(horizon) = now_ms.checked_sub(window_ms) else {
            return;
        };
        while let Some(&oldest) = self.timestamps.front() {
            if oldest > horizon {
                break;
            }
            self.timestamps.pop_front();
        }
    }

    /// Admit and record `now_ms` if fewer than the ceiling are in the window.
    pub fn check_and_record(&mut self, config: &RateLimitConfig, now_ms: u64) -> WindowDecision {
        self.evict(config.window_ms, now_ms);

        let ceiling = config.ceiling();
        let current = self.timestamps.len() as u32;
        let allowed = current < ceiling;
        if allowed {
            self.timestamps.push_back(now_ms);
        }

        let count = self.timestamps.len() as u32;
        let reset_at_ms = self
            .timestamps
            .front()
            .map_or(now_ms + config.window_ms, |oldest| oldest + config.window_ms);

        WindowDecision {
            allowed,
            count,
            remaining: ceiling.saturating_sub(count),
            reset_at_ms,
            burst: allowed && count > config.max_requests,
        }
    }

    pub fn snapshot(&mut self, window_ms: u64, now_ms: u64) -> WindowSnapshot {
        self.evict(window_ms, now_ms);
        WindowSnapshot {
            count: self.timestamps.len() as u32,
            oldest_ms: self.timestamps.front().copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Window store kept in process memory.
///
/// The map lock is held for the whole check, which makes admission atomic
/// for callers sharing this instance.
#[derive(Debug, Default)]
pub struct LocalWindowStore {
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl LocalWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of identifiers with window state.
    pub fn window_count(&self) -> usize {
        self.windows.lock().len()
    }
}

#[async_trait]
impl WindowStore for LocalWindowStore {
    async fn check_and_record(
        &self,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> Result<WindowDecision, StoreError> {
        let mut windows = self.windows.lock();
        let window = windows.entry(config.identifier.clone()).or_default();
        Ok(window.check_and_record(config, now_ms))
    }

    async fn snapshot(
        &self,
        identifier: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowSnapshot, StoreError> {
        let mut windows = self.windows.lock();
        Ok(windows
            .get_mut(identifier)
            .map(|w| w.snapshot(window_ms, now_ms))
            .unwrap_or_default())
    }

    async fn clear(&self, identifier: Option<&str>) -> Result<(), StoreError> {
        let mut windows = self.windows.lock();
        match identifier {
            Some(id) => {
                windows.remove(id);
            }
            None => windows.clear(),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_max_then_denies() {
        let config = RateLimitConfig::new("api", 5, 60_000);
        let mut window = SlidingWindow::new();

        for i in 0..5 {
            let decision = window.check_and_record(&config, 1_000 + i);
            assert!(decision.allowed, "call {} should be admitted", i + 1);
        }

        let decision = window.check_and_record(&config, 1_010);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.count, 5);
        assert!(decision.reset_at_ms <= 1_010 + 60_000);
        assert_eq!(decision.reset_at_ms, 61_000);
    }

    #[test]
    fn test_window_slides() {
        let config = RateLimitConfig::new("api", 2, 1_000);
        let mut window = SlidingWindow::new();

        assert!(window.check_and_record(&config, 0).allowed);
        assert!(window.check_and_record(&config, 500).allowed);
        assert!(!window.check_and_record(&config, 999).allowed);

        // The first timestamp leaves exactly one window later.
        assert!(window.check_and_record(&config, 1_000).allowed);
        assert!(!window.check_and_record(&config, 1_001).allowed);
        assert!(window.check_and_record(&config, 1_500).allowed);
    }

    #[test]
    fn test_denied_call_is_not_recorded() {
        let config = RateLimitConfig::new("api", 1, 1_000);
        let mut window = SlidingWindow::new();

        window.check_and_record(&config, 0);
        window.check_and_record(&config, 10);
        window.check_and_record(&config, 20);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_burst_allowance() {
        let config = RateLimitConfig::new("api", 2, 1_000).with_burst_limit(3);
        let mut window = SlidingWindow::new();

        assert!(!window.check_and_record(&config, 0).burst);
        assert!(!window.check_and_record(&config, 1).burst);

        let third = window.check_and_record(&config, 2);
        assert!(third.allowed);
        assert!(third.burst);

        assert!(!window.check_and_record(&config, 3).allowed);
    }

    #[tokio::test]
    async fn test_store_separates_identifiers() {
        let store = LocalWindowStore::new();
        let a = RateLimitConfig::new("a", 1, 1_000);
        let b = RateLimitConfig::new("b", 1, 1_000);

        assert!(store.check_and_record(&a, 0).await.unwrap().allowed);
        assert!(store.check_and_record(&b, 0).await.unwrap().allowed);
        assert!(!store.check_and_record(&a, 1).await.unwrap().allowed);
        assert_eq!(store.window_count(), 2);
    }

    #[tokio::test]
    async fn test_store_clear() {
        let store = LocalWindowStore::new();
        let a = RateLimitConfig::new("a", 1, 1_000);
        let b = RateLimitConfig::new("b", 1, 1_000);
        store.check_and_record(&a, 0).await.unwrap();
        store.check_and_record(&b, 0).await.unwrap();

        store.clear(Some("a")).await.unwrap();
        assert_eq!(store.window_count(), 1);
        assert!(store.check_and_record(&a, 1).await.unwrap().allowed);

        store.clear(None).await.unwrap();
        assert_eq!(store.window_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_does_not_record() {
        let store = LocalWindowStore::new();
        let config = RateLimitConfig::new("a", 3, 1_000);
        store.check_and_record(&config, 100).await.unwrap();

        let snapshot = store.snapshot("a", 1_000, 200).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.oldest_ms, Some(100));

        let snapshot = store.snapshot("a", 1_000, 1_100).await.unwrap();
        assert_eq!(snapshot.count, 0);

        let missing = store.snapshot("missing", 1_000, 0).await.unwrap();
        assert_eq!(missing, WindowSnapshot::default());
    }
}
