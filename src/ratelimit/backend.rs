//! Window store trait for abstracting local and distributed implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::counter::LocalWindowStore;
use super::distributed::RedisWindowStore;
use super::rules::RateLimitConfig;
use crate::config::StoreConfig;

/// Errors raised by a window store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),
    #[error("Store query error: {0}")]
    Query(String),
    #[error("Store timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Query(err.to_string())
        }
    }
}

/// Outcome of a sliding window admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Timestamps in the window after this check
    pub count: u32,
    /// Admissions left before the ceiling
    pub remaining: u32,
    /// Epoch ms when the oldest timestamp leaves the window
    pub reset_at_ms: u64,
    /// Admitted above `max_requests` by the burst allowance
    pub burst: bool,
}

impl WindowDecision {
    /// Fail-open decision used when no store could answer.
    pub fn fail_open(config: &RateLimitConfig, now_ms: u64) -> Self {
        Self {
            allowed: true,
            count: 0,
            remaining: config.ceiling(),
            reset_at_ms: now_ms + config.window_ms,
            burst: false,
        }
    }
}

/// Read-only view of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSnapshot {
    pub count: u32,
    /// Oldest timestamp still inside the window
    pub oldest_ms: Option<u64>,
}

impl WindowSnapshot {
    pub fn reset_at_ms(&self, window_ms: u64, now_ms: u64) -> u64 {
        self.oldest_ms.map_or(now_ms, |oldest| oldest + window_ms)
    }
}

/// Trait for window store implementations.
///
/// Implementations must make `check_and_record` atomic per identifier: two
/// concurrent callers can never both take the last slot.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Admit and record `now_ms` if the window has room.
    async fn check_and_record(
        &self,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> Result<WindowDecision, StoreError>;

    /// Count the timestamps currently inside the window.
    async fn snapshot(
        &self,
        identifier: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowSnapshot, StoreError>;

    /// Drop window state for one identifier, or all when `None`.
    async fn clear(&self, identifier: Option<&str>) -> Result<(), StoreError>;

    /// Backend name for logs and status output.
    fn name(&self) -> &'static str;
}

/// Shared store with an in-process fallback.
///
/// Any primary failure is logged and answered by the local store, so the
/// caller is never failed because the shared store is down.
pub struct FallbackWindowStore<P: WindowStore> {
    primary: P,
    fallback: LocalWindowStore,
}

impl<P: WindowStore> FallbackWindowStore<P> {
    pub fn new(primary: P) -> Self {
        Self {
            primary,
            fallback: LocalWindowStore::new(),
        }
    }
}

#[async_trait]
impl<P: WindowStore> WindowStore for FallbackWindowStore<P> {
    async fn check_and_record(
        &self,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> Result<WindowDecision, StoreError> {
        match self.primary.check_and_record(config, now_ms).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(
                    identifier = %config.identifier,
                    backend = self.primary.name(),
                    error = %e,
                    "Shared store unavailable, using in-process window"
                );
                self.fallback.check_and_record(config, now_ms).await
            }
        }
    }

    async fn snapshot(
        &self,
        identifier: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowSnapshot, StoreError> {
        match self.primary.snapshot(identifier, window_ms, now_ms).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    error = %e,
                    "Shared store unavailable for snapshot"
                );
                self.fallback.snapshot(identifier, window_ms, now_ms).await
            }
        }
    }

    async fn clear(&self, identifier: Option<&str>) -> Result<(), StoreError> {
        self.fallback.clear(identifier).await?;
        self.primary.clear(identifier).await
    }

    fn name(&self) -> &'static str {
        self.primary.name()
    }
}

/// Build the window store selected by configuration.
///
/// No host configured, or a host that cannot be reached at startup, yields
/// the in-process store.
pub async fn build_store(config: &StoreConfig) -> Arc<dyn WindowStore> {
    let Some(host) = config.host.as_deref() else {
        info!("No shared store configured, using in-process windows");
        return Arc::new(LocalWindowStore::new());
    };

    match RedisWindowStore::connect(config).await {
        Ok(store) => {
            info!(host = %host, port = config.port, "Connected to shared window store");
            Arc::new(FallbackWindowStore::new(store))
        }
        Err(e) => {
            warn!(
                host = %host,
                port = config.port,
                error = %e,
                "Shared store unreachable, using in-process windows"
            );
            Arc::new(LocalWindowStore::new())
        }
    }
}
