//! Core rate limiter implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::backend::{build_store, WindowDecision, WindowStore};
use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitSnapshot};
use super::clock::{to_datetime, Clock};
use super::counter::LocalWindowStore;
use super::metrics::{MetricsCollector, MetricsSnapshot};
use super::queue::{PendingQueue, QueueKey};
use super::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};
use super::rules::RateLimitConfig;
use crate::config::StoreConfig;
use crate::error::{CallError, RateLimitError, Result};

/// Default number of calls run together by `batch_execute`.
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// Floor for drain reschedules so clock skew cannot spin the drain loop.
const MIN_DRAIN_DELAY: Duration = Duration::from_millis(1);

/// Why an admission check said no.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RateLimited,
    CircuitOpen,
}

/// Result of a plain admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Wait before trying again, set when denied
    pub retry_after: Option<Duration>,
    pub reason: Option<DenyReason>,
    /// Admitted on the burst allowance
    pub burst: bool,
}

/// Read-only view of one identifier's limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub identifier: String,
    pub current: u32,
    /// Unknown until a rule for the identifier has been used
    pub max_requests: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub queue_length: usize,
    pub circuit: CircuitSnapshot,
    pub backend: &'static str,
}

/// Per-item outcomes of `batch_execute`, in input order.
#[derive(Debug)]
pub struct BatchResults<T> {
    items: Vec<(String, Result<T>)>,
}

impl<T> BatchResults<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Outcome for `id`; the first one if ids repeat.
    pub fn get(&self, id: &str) -> Option<&Result<T>> {
        self.items.iter().find(|(item, _)| item == id).map(|(_, r)| r)
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<T>)> {
        self.items.iter().map(|(id, r)| (id.as_str(), r))
    }

    pub fn into_map(self) -> HashMap<String, Result<T>> {
        self.items.into_iter().collect()
    }
}

struct Inner {
    store: Arc<dyn WindowStore>,
    circuits: CircuitBreaker,
    queues: Mutex<HashMap<String, PendingQueue>>,
    metrics: MetricsCollector,
    /// Latest rule seen per identifier, used by drains and status
    configs: DashMap<String, RateLimitConfig>,
    retry: RetryPolicy,
    clock: Clock,
    next_drain: AtomicU64,
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    store: Option<Arc<dyn WindowStore>>,
    circuit: CircuitBreakerConfig,
    retry: RetryPolicy,
}

impl RateLimiterBuilder {
    pub fn with_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_circuit_config(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> RateLimiter {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(LocalWindowStore::new()));

        RateLimiter {
            inner: Arc::new(Inner {
                store,
                circuits: CircuitBreaker::with_config(self.circuit),
                queues: Mutex::new(HashMap::new()),
                metrics: MetricsCollector::new(),
                configs: DashMap::new(),
                retry: self.retry,
                clock: Clock::new(),
                next_drain: AtomicU64::new(0),
            }),
        }
    }
}

/// The rate limiter facade.
///
/// Cloning is cheap and clones share state; separately built limiters do not.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Create a rate limiter with an in-process store and default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder {
            store: None,
            circuit: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Create a rate limiter on the store selected by `config`.
    pub async fn connect(config: &StoreConfig) -> Self {
        let store = build_store(config).await;
        Self::builder().with_store(store).build()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.circuits
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    pub fn backend(&self) -> &'static str {
        self.inner.store.name()
    }

    /// Check admission for one call, recording it when allowed.
    ///
    /// Never fails: store errors fail open.
    pub async fn check_rate_limit(&self, config: &RateLimitConfig) -> RateLimitResult {
        self.register(config);
        let now_ms = self.inner.clock.now_ms();

        if let Err(retry_after) = self.inner.circuits.check(&config.identifier) {
            debug!(identifier = %config.identifier, "Admission denied by open circuit");
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_at: to_datetime(now_ms + retry_after.as_millis() as u64),
                retry_after: Some(retry_after),
                reason: Some(DenyReason::CircuitOpen),
                burst: false,
            };
        }

        let decision = self.record_window(config).await;
        let retry_after = (!decision.allowed)
            .then(|| Duration::from_millis(decision.reset_at_ms.saturating_sub(now_ms)));

        RateLimitResult {
            allowed: decision.allowed,
            remaining: decision.remaining,
            reset_at: to_datetime(decision.reset_at_ms),
            retry_after,
            reason: (!decision.allowed).then_some(DenyReason::RateLimited),
            burst: decision.burst,
        }
    }

    /// Run `call` under the limit with the default retry budget.
    pub async fn execute_with_rate_limit<T, F, Fut>(
        &self,
        config: &RateLimitConfig,
        call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        self.execute_with_retries(config, call, DEFAULT_MAX_RETRIES)
            .await
    }

    /// Run `call` under the limit.
    ///
    /// Waits in the queue when the rule has one. Local denials and upstream
    /// rate limiting are retried up to `max_retries` times with backoff; any
    /// other failure is returned immediately.
    pub async fn execute_with_retries<T, F, Fut>(
        &self,
        config: &RateLimitConfig,
        mut call: F,
        max_retries: u32,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        config.validate()?;
        self.register(config);
        let identifier = &config.identifier;
        let mut attempt = 0;

        loop {
            self.check_circuit(identifier)?;

            let error = match self.admit(config).await {
                Ok(_) => {
                    // The circuit may have opened while this call waited.
                    let permit = self.acquire_circuit(identifier)?;
                    match self.run_admitted(config, permit, call()).await {
                        Ok(value) => return Ok(value),
                        Err(source @ CallError::RateLimited { .. }) => RateLimitError::Upstream {
                            identifier: identifier.clone(),
                            source,
                        },
                        Err(source) => {
                            return Err(RateLimitError::Upstream {
                                identifier: identifier.clone(),
                                source,
                            })
                        }
                    }
                }
                Err(err @ RateLimitError::RateLimitExceeded { .. }) => err,
                Err(err) => return Err(err),
            };

            if attempt >= max_retries {
                warn!(
                    identifier = %identifier,
                    attempts = attempt + 1,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(error);
            }

            let delay = self.inner.retry.delay(attempt, error.retry_after());
            debug!(
                identifier = %identifier,
                attempt = attempt + 1,
                delay = ?delay,
                "Rate limited, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Queue `call` behind the identifier's pending calls and run it once
    /// admitted. Fails immediately when the queue is full.
    pub async fn enqueue<T, F, Fut>(&self, config: &RateLimitConfig, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        config.validate()?;
        self.register(config);
        let identifier = &config.identifier;

        self.check_circuit(identifier)?;
        self.wait_in_queue(config).await?;
        let permit = self.acquire_circuit(identifier)?;

        self.run_admitted(config, permit, call())
            .await
            .map_err(|source| RateLimitError::Upstream {
                identifier: identifier.clone(),
                source,
            })
    }

    /// Run calls in batches of `batch_size` under one rule.
    ///
    /// Calls within a batch run concurrently. Before the next batch the
    /// limiter waits for the window to reset if it cannot hold the whole
    /// batch. Every item gets an outcome.
    pub async fn batch_execute<T, F, Fut>(
        &self,
        items: Vec<(String, F)>,
        config: &RateLimitConfig,
        batch_size: usize,
    ) -> BatchResults<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let batch_size = batch_size.max(1);
        let mut results = Vec::with_capacity(items.len());
        let mut pending = items.into_iter().peekable();

        while pending.peek().is_some() {
            let (ids, calls): (Vec<String>, Vec<F>) = pending.by_ref().take(batch_size).unzip();

            let outcomes = join_all(
                calls
                    .into_iter()
                    .map(|call| self.execute_with_rate_limit(config, call)),
            )
            .await;
            results.extend(ids.into_iter().zip(outcomes));

            let next_len = pending.len().min(batch_size);
            if next_len > 0 {
                let delay = self.inter_batch_delay(config, next_len as u32).await;
                if !delay.is_zero() {
                    debug!(
                        identifier = %config.identifier,
                        delay = ?delay,
                        next_batch = next_len,
                        "Waiting for window capacity between batches"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        BatchResults { items: results }
    }

    /// Snapshot of the identifier's window, queue and circuit.
    pub async fn get_rate_limit_status(&self, identifier: &str) -> RateLimitStatus {
        let config = self.inner.configs.get(identifier).map(|c| c.clone());
        let now_ms = self.inner.clock.now_ms();

        let mut status = RateLimitStatus {
            identifier: identifier.to_string(),
            current: 0,
            max_requests: None,
            remaining: None,
            reset_at: None,
            queue_length: self.queue_len(identifier),
            circuit: self.inner.circuits.snapshot(identifier),
            backend: self.inner.store.name(),
        };

        if let Some(config) = config {
            status.max_requests = Some(config.max_requests);
            match self
                .inner
                .store
                .snapshot(identifier, config.window_ms, now_ms)
                .await
            {
                Ok(snapshot) => {
                    status.current = snapshot.count;
                    status.remaining = Some(config.ceiling().saturating_sub(snapshot.count));
                    status.reset_at =
                        Some(to_datetime(snapshot.reset_at_ms(config.window_ms, now_ms)));
                }
                Err(e) => {
                    warn!(identifier = %identifier, error = %e, "Could not read window state");
                }
            }
        }

        status
    }

    /// Reset window, circuit and queue state for one identifier, or all.
    ///
    /// Callers still waiting in a cleared queue receive a rate limit error.
    pub async fn clear_rate_limits(&self, identifier: Option<&str>) {
        if let Err(e) = self.inner.store.clear(identifier).await {
            warn!(identifier = ?identifier, error = %e, "Failed to clear window state");
        }
        self.inner.circuits.clear(identifier);

        let mut queues = self.inner.queues.lock();
        match identifier {
            Some(id) => {
                queues.remove(id);
            }
            None => queues.clear(),
        }

        info!(identifier = ?identifier, "Rate limit state cleared");
    }

    pub fn get_metrics(&self) -> HashMap<String, MetricsSnapshot> {
        self.inner.metrics.get_metrics()
    }

    pub fn clear_metrics(&self, identifier: Option<&str>) {
        self.inner.metrics.clear(identifier);
    }

    /// Grant queued calls for `identifier` while the window has room.
    ///
    /// At most one drain runs per identifier; when the window is full the
    /// drain reschedules itself for the reset instant.
    pub async fn drain(&self, identifier: &str) {
        if let Some(token) = self.claim_drain(identifier) {
            self.run_drain(identifier, token).await;
        }
    }

    /// Get the number of calls waiting for `identifier`.
    pub fn queue_len(&self, identifier: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(identifier)
            .map_or(0, |q| q.len())
    }

    /// Make a rule known for status reports and drains without recording a call.
    pub fn register(&self, config: &RateLimitConfig) {
        let known = self
            .inner
            .configs
            .get(&config.identifier)
            .is_some_and(|c| *c == *config);
        if !known {
            self.inner
                .configs
                .insert(config.identifier.clone(), config.clone());
        }
    }

    /// Fail fast without claiming the half-open trial.
    fn check_circuit(&self, identifier: &str) -> Result<()> {
        self.inner
            .circuits
            .check(identifier)
            .map_err(|retry_after| circuit_open(identifier, retry_after))
    }

    fn acquire_circuit(&self, identifier: &str) -> Result<CircuitPermit<'_>> {
        self.inner
            .circuits
            .acquire(identifier)
            .map_err(|retry_after| circuit_open(identifier, retry_after))
    }

    async fn record_window(&self, config: &RateLimitConfig) -> WindowDecision {
        let now_ms = self.inner.clock.now_ms();
        match self.inner.store.check_and_record(config, now_ms).await {
            Ok(decision) => {
                trace!(
                    identifier = %config.identifier,
                    allowed = decision.allowed,
                    count = decision.count,
                    remaining = decision.remaining,
                    "Checked rate limit"
                );
                decision
            }
            Err(e) => {
                warn!(
                    identifier = %config.identifier,
                    error = %e,
                    "Window store failed, allowing call"
                );
                WindowDecision::fail_open(config, now_ms)
            }
        }
    }

    fn exceeded(&self, identifier: &str, reset_at_ms: u64) -> RateLimitError {
        let now_ms = self.inner.clock.now_ms();
        RateLimitError::RateLimitExceeded {
            identifier: identifier.to_string(),
            reset_at: to_datetime(reset_at_ms),
            retry_after: Duration::from_millis(reset_at_ms.saturating_sub(now_ms)),
        }
    }

    /// Take a window slot, waiting in the queue when the rule has one.
    async fn admit(&self, config: &RateLimitConfig) -> Result<WindowDecision> {
        let queueing = config.queue_capacity() > 0;

        // Direct callers never overtake waiting ones.
        if queueing && self.queue_len(&config.identifier) > 0 {
            return self.wait_in_queue(config).await;
        }

        let decision = self.record_window(config).await;
        if decision.allowed {
            return Ok(decision);
        }
        if queueing {
            return self.wait_in_queue(config).await;
        }

        debug!(
            identifier = %config.identifier,
            count = decision.count,
            "Rate limit exceeded"
        );
        Err(self.exceeded(&config.identifier, decision.reset_at_ms))
    }

    async fn wait_in_queue(&self, config: &RateLimitConfig) -> Result<WindowDecision> {
        let identifier = &config.identifier;
        let priority = config.queue_priority();

        let (key, ticket) = {
            let mut queues = self.inner.queues.lock();
            let queue = queues
                .entry(identifier.clone())
                .or_insert_with(|| PendingQueue::new(config.queue_capacity()));
            queue.set_capacity(config.queue_capacity());
            queue
                .push(priority)
                .map_err(|full| RateLimitError::QueueFull {
                    identifier: identifier.clone(),
                    capacity: full.capacity,
                })?
        };

        debug!(identifier = %identifier, priority = priority, "Call queued");
        let _guard = QueueGuard {
            inner: &self.inner,
            identifier,
            key,
        };
        self.schedule_drain(identifier);

        match ticket.await {
            Ok(decision) => Ok(decision),
            Err(_) => {
                let now_ms = self.inner.clock.now_ms();
                Err(self.exceeded(identifier, now_ms))
            }
        }
    }

    async fn run_admitted<T, Fut>(
        &self,
        config: &RateLimitConfig,
        permit: CircuitPermit<'_>,
        call: Fut,
    ) -> std::result::Result<T, CallError>
    where
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let started = Instant::now();
        let outcome = call.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.inner
            .metrics
            .record_request(&config.identifier, outcome.is_ok(), elapsed_ms);

        let trial = permit.is_trial();
        match &outcome {
            Ok(_) => permit.succeed(),
            // Throttling says nothing about upstream health.
            Err(CallError::RateLimited { .. }) => drop(permit),
            Err(CallError::Failed(e)) => {
                debug!(identifier = %config.identifier, trial = trial, error = %e, "Call failed");
                permit.fail();
            }
        }

        outcome
    }

    async fn inter_batch_delay(&self, config: &RateLimitConfig, next_len: u32) -> Duration {
        let now_ms = self.inner.clock.now_ms();
        match self
            .inner
            .store
            .snapshot(&config.identifier, config.window_ms, now_ms)
            .await
        {
            Ok(snapshot) => {
                let remaining = config.ceiling().saturating_sub(snapshot.count);
                if remaining >= next_len {
                    Duration::ZERO
                } else {
                    let reset_at_ms = snapshot.reset_at_ms(config.window_ms, now_ms);
                    Duration::from_millis(reset_at_ms.saturating_sub(now_ms))
                }
            }
            Err(_) => Duration::ZERO,
        }
    }

    /// Mark a drain active for `identifier` and return its token, or `None`
    /// when one already is.
    fn claim_drain(&self, identifier: &str) -> Option<u64> {
        let mut queues = self.inner.queues.lock();
        let queue = queues.get_mut(identifier)?;
        if queue.drain.is_some() {
            return None;
        }
        let token = self.inner.next_drain.fetch_add(1, Ordering::Relaxed);
        queue.drain = Some(token);
        Some(token)
    }

    fn schedule_drain(&self, identifier: &str) {
        if let Some(token) = self.claim_drain(identifier) {
            self.spawn_drain(identifier, token, Duration::ZERO);
        }
    }

    fn spawn_drain(&self, identifier: &str, token: u64, delay: Duration) {
        let limiter = self.clone();
        let identifier = identifier.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            limiter.run_drain(&identifier, token).await;
        });
    }

    /// Drain loop for the holder of `token`.
    async fn run_drain(&self, identifier: &str, token: u64) {
        loop {
            let Some(config) = self.inner.configs.get(identifier).map(|c| c.clone()) else {
                return;
            };

            {
                let mut queues = self.inner.queues.lock();
                let Some(queue) = queues.get_mut(identifier) else {
                    return;
                };
                // A cleared queue is replaced by one with its own drain.
                if queue.drain != Some(token) {
                    return;
                }
                queue.prune_cancelled();
                if queue.is_empty() {
                    queue.drain = None;
                    return;
                }
            }

            let mut decision = self.record_window(&config).await;
            if !decision.allowed {
                let now_ms = self.inner.clock.now_ms();
                let delay = Duration::from_millis(decision.reset_at_ms.saturating_sub(now_ms))
                    .max(MIN_DRAIN_DELAY);
                trace!(identifier = %identifier, delay = ?delay, "Window full, drain rescheduled");
                self.spawn_drain(identifier, token, delay);
                return;
            }

            // Pass the slot down the queue until a live waiter takes it.
            loop {
                let entry = self
                    .inner
                    .queues
                    .lock()
                    .get_mut(identifier)
                    .filter(|q| q.drain == Some(token))
                    .and_then(|q| q.pop_front());

                let Some(entry) = entry else {
                    debug!(identifier = %identifier, "Queue emptied while draining");
                    break;
                };

                let priority = entry.priority;
                let waited = entry.enqueued_at.elapsed();
                match entry.grant(decision) {
                    Ok(()) => {
                        debug!(
                            identifier = %identifier,
                            priority = priority,
                            waited = ?waited,
                            "Queued call admitted"
                        );
                        break;
                    }
                    Err(returned) => {
                        debug!(identifier = %identifier, "Queued caller left before its grant");
                        decision = returned;
                    }
                }
            }
        }
    }
}

fn circuit_open(identifier: &str, retry_after: Duration) -> RateLimitError {
    debug!(identifier = %identifier, retry_after = ?retry_after, "Circuit open, failing fast");
    RateLimitError::CircuitOpen {
        identifier: identifier.to_string(),
        retry_after,
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a waiter's entry if it leaves the queue without being granted.
struct QueueGuard<'a> {
    inner: &'a Inner,
    identifier: &'a str,
    key: QueueKey,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if let Some(queue) = self.inner.queues.lock().get_mut(self.identifier) {
            queue.remove(&self.key);
        }
    }
}
