//! Per-identifier circuit breaker.
//!
//! ```text
//! Closed    -> Open:      consecutive failures reach the threshold
//! Open      -> Half-open: cooldown elapsed, first caller becomes the trial
//! Half-open -> Closed:    trial succeeds
//! Half-open -> Open:      trial fails, cooldown restarts
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failures in a row that open a circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Time an open circuit waits before allowing a trial call.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
/// Retry hint handed to callers turned away while a trial is in flight.
const TRIAL_IN_FLIGHT_RETRY: Duration = Duration::from_secs(1);

/// The state of one identifier's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn remaining_cooldown(&self, cooldown: Duration) -> Duration {
        self.opened_at
            .map(|at| cooldown.saturating_sub(at.elapsed()))
            .unwrap_or_default()
    }

    /// State as seen by an observer, without claiming a trial.
    fn effective_state(&self, cooldown: Duration) -> CircuitState {
        match self.state {
            CircuitState::Open if self.remaining_cooldown(cooldown).is_zero() => {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_in_flight = false;
    }
}

/// Point-in-time view of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time until a call may be attempted, zero when one may be attempted now
    pub retry_after: Duration,
}

/// Circuit breakers for every identifier seen by one limiter.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Claim permission to attempt a call.
    ///
    /// Returns whether the caller holds the half-open trial, or the time to
    /// wait when the circuit rejects the call.
    fn try_acquire(&self, identifier: &str) -> Result<bool, Duration> {
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(identifier) else {
            return Ok(false);
        };

        match circuit.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let remaining = circuit.remaining_cooldown(self.config.cooldown);
                if !remaining.is_zero() {
                    return Err(remaining);
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                debug!(identifier = %identifier, "Circuit half-open, admitting trial call");
                Ok(true)
            }
            CircuitState::HalfOpen if circuit.trial_in_flight => Err(TRIAL_IN_FLIGHT_RETRY),
            CircuitState::HalfOpen => {
                circuit.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    /// Whether a call may be attempted now.
    ///
    /// After the cooldown this admits exactly one caller as the trial; the
    /// caller must report the outcome with `record_success` or `record_failure`.
    pub fn is_available(&self, identifier: &str) -> bool {
        self.try_acquire(identifier).is_ok()
    }

    /// Claim a permit that reports the outcome, or releases an abandoned
    /// trial when dropped.
    pub fn acquire(&self, identifier: &str) -> Result<CircuitPermit<'_>, Duration> {
        let trial = self.try_acquire(identifier)?;
        Ok(CircuitPermit {
            breaker: self,
            identifier: identifier.to_string(),
            trial,
            resolved: false,
        })
    }

    /// Read-only admission check that never claims the trial.
    pub fn check(&self, identifier: &str) -> Result<(), Duration> {
        let circuits = self.circuits.lock();
        let Some(circuit) = circuits.get(identifier) else {
            return Ok(());
        };

        match circuit.effective_state(self.config.cooldown) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(circuit.remaining_cooldown(self.config.cooldown)),
            CircuitState::HalfOpen if circuit.trial_in_flight => Err(TRIAL_IN_FLIGHT_RETRY),
            CircuitState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self, identifier: &str) {
        self.resolve_success(identifier, true);
    }

    pub fn record_failure(&self, identifier: &str) {
        self.resolve_failure(identifier, true);
    }

    /// Only the trial may decide a circuit that is not closed. Outcomes of
    /// calls admitted before the circuit opened are dropped.
    fn is_stale(&self, identifier: &str, circuit: &Circuit, trial: bool) -> bool {
        if trial || circuit.state == CircuitState::Closed {
            return false;
        }
        debug!(
            identifier = %identifier,
            state = %circuit.state,
            "Ignoring outcome of a non-trial call"
        );
        true
    }

    fn resolve_success(&self, identifier: &str, trial: bool) {
        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(identifier) else {
            return;
        };
        if self.is_stale(identifier, circuit, trial) {
            return;
        }

        match circuit.state {
            CircuitState::Closed => circuit.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                *circuit = Circuit::new();
                info!(identifier = %identifier, "Circuit closed after successful trial");
            }
            CircuitState::Open => {
                warn!(identifier = %identifier, "Success recorded while circuit is open");
            }
        }
    }

    fn resolve_failure(&self, identifier: &str, trial: bool) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(identifier.to_string())
            .or_insert_with(Circuit::new);
        if self.is_stale(identifier, circuit, trial) {
            return;
        }
        circuit.consecutive_failures += 1;

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.open();
                    info!(
                        identifier = %identifier,
                        failures = circuit.consecutive_failures,
                        cooldown = ?self.config.cooldown,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.open();
                info!(identifier = %identifier, "Trial call failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Give up a claimed trial without an outcome.
    pub fn release_trial(&self, identifier: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(identifier) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.trial_in_flight = false;
            }
        }
    }

    pub fn state(&self, identifier: &str) -> CircuitState {
        self.snapshot(identifier).state
    }

    pub fn snapshot(&self, identifier: &str) -> CircuitSnapshot {
        let circuits = self.circuits.lock();
        match circuits.get(identifier) {
            Some(circuit) => {
                let state = circuit.effective_state(self.config.cooldown);
                let retry_after = match state {
                    CircuitState::Open => circuit.remaining_cooldown(self.config.cooldown),
                    CircuitState::HalfOpen if circuit.trial_in_flight => TRIAL_IN_FLIGHT_RETRY,
                    _ => Duration::ZERO,
                };
                CircuitSnapshot {
                    state,
                    consecutive_failures: circuit.consecutive_failures,
                    retry_after,
                }
            }
            None => CircuitSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                retry_after: Duration::ZERO,
            },
        }
    }

    pub fn clear(&self, identifier: Option<&str>) {
        let mut circuits = self.circuits.lock();
        match identifier {
            Some(id) => {
                circuits.remove(id);
            }
            None => circuits.clear(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Permission to attempt one call.
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    identifier: String,
    trial: bool,
    resolved: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.resolve_success(&self.identifier, self.trial);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.resolve_failure(&self.identifier, self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.release_trial(&self.identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(breaker: &CircuitBreaker, identifier: &str) {
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            breaker.record_failure(identifier);
        }
    }

    #[test]
    fn test_unknown_identifier_is_closed() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.is_available("x"));
        assert_eq!(breaker.state("x"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_five_failures() {
        let breaker = CircuitBreaker::new();

        for _ in 0..4 {
            breaker.record_failure("X");
        }
        assert!(breaker.is_available("X"));

        breaker.record_failure("X");
        assert!(!breaker.is_available("X"));
        assert_eq!(breaker.state("X"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new();
        for _ in 0..4 {
            breaker.record_failure("X");
        }
        breaker.record_success("X");
        breaker.record_failure("X");

        assert!(breaker.is_available("X"));
        assert_eq!(breaker.snapshot("X").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let breaker = CircuitBreaker::new();
        trip(&breaker, "X");

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!breaker.is_available("X"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state("X"), CircuitState::HalfOpen);
        assert!(breaker.is_available("X"));
        assert!(!breaker.is_available("X"));
        assert!(!breaker.is_available("X"));

        breaker.record_success("X");
        assert_eq!(breaker.state("X"), CircuitState::Closed);
        assert!(breaker.is_available("X"));
        assert_eq!(breaker.snapshot("X").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new();
        trip(&breaker, "X");

        tokio::time::advance(DEFAULT_COOLDOWN).await;
        assert!(breaker.is_available("X"));
        breaker.record_failure("X");

        assert_eq!(breaker.state("X"), CircuitState::Open);
        let snapshot = breaker.snapshot("X");
        assert_eq!(snapshot.retry_after, DEFAULT_COOLDOWN);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.is_available("X"));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.is_available("X"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_is_released() {
        let breaker = CircuitBreaker::new();
        trip(&breaker, "X");
        tokio::time::advance(DEFAULT_COOLDOWN).await;

        {
            let permit = breaker.acquire("X").unwrap();
            assert!(permit.is_trial());
            assert!(breaker.acquire("X").is_err());
        }

        let permit = breaker.acquire("X").unwrap();
        assert!(permit.is_trial());
        permit.succeed();
        assert_eq!(breaker.state("X"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_the_trial_decides_half_open() {
        let breaker = CircuitBreaker::new();
        let before_open = breaker.acquire("X").unwrap();
        let also_before_open = breaker.acquire("X").unwrap();
        assert!(!before_open.is_trial());

        trip(&breaker, "X");
        tokio::time::advance(DEFAULT_COOLDOWN).await;
        let trial = breaker.acquire("X").unwrap();
        assert!(trial.is_trial());

        before_open.succeed();
        assert_eq!(breaker.state("X"), CircuitState::HalfOpen);
        also_before_open.fail();
        assert_eq!(breaker.state("X"), CircuitState::HalfOpen);
        assert!(breaker.acquire("X").is_err());

        trial.succeed();
        assert_eq!(breaker.state("X"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_does_not_extend_open_circuit() {
        let breaker = CircuitBreaker::new();
        let before_open = breaker.acquire("X").unwrap();
        trip(&breaker, "X");

        tokio::time::advance(Duration::from_secs(30)).await;
        before_open.fail();
        assert_eq!(
            breaker.snapshot("X").consecutive_failures,
            DEFAULT_FAILURE_THRESHOLD
        );
        assert_eq!(breaker.snapshot("X").retry_after, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_does_not_claim_trial() {
        let breaker = CircuitBreaker::new();
        trip(&breaker, "X");
        assert!(breaker.check("X").is_err());

        tokio::time::advance(DEFAULT_COOLDOWN).await;
        assert!(breaker.check("X").is_ok());
        assert!(breaker.check("X").is_ok());
        assert!(breaker.is_available("X"));
        assert_eq!(breaker.check("X"), Err(TRIAL_IN_FLIGHT_RETRY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_threshold_and_clear() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(5),
        });
        breaker.record_failure("a");
        breaker.record_failure("a");
        breaker.record_failure("b");
        assert!(!breaker.is_available("a"));

        breaker.clear(Some("a"));
        assert!(breaker.is_available("a"));
        assert_eq!(breaker.snapshot("b").consecutive_failures, 1);

        breaker.clear(None);
        assert_eq!(breaker.snapshot("b").consecutive_failures, 0);
    }
}
