//! Retry policy and circuit breakers for provider calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::providers::Capability;

/// Key for circuit breaker isolation.
///
/// Combines the capability with the provider name so the same backend
/// registered under two capabilities trips independently: a script backend
/// melting down must not block the trend feed it also serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub capability: Capability,
    pub provider: String,
}

impl ProviderKey {
    pub fn new(capability: Capability, provider: impl Into<String>) -> Self {
        Self {
            capability,
            provider: provider.into(),
        }
    }
}

impl std::fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.capability, self.provider)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);

        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        let final_delay = if self.use_jitter {
            // Add up to 25% jitter
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }

    /// Check if another retry should be attempted.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed (normal operation).
    Closed,
    /// Circuit is open (failing, rejecting requests).
    Open,
    /// Circuit is half-open (single probe in flight or available).
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Outcome of asking the breaker for permission to call a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, request may proceed.
    Allowed,
    /// Circuit half-open and this caller claimed the single probe slot.
    Probe,
    /// Circuit open, or the probe slot is already taken.
    Rejected,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed | Self::Probe)
    }
}

/// Circuit breaker for protecting against cascading provider failures.
///
/// Opens after `failure_threshold` consecutive failures. Once the cool-down
/// elapses, the breaker admits exactly one probe request: success closes the
/// circuit and resets the cool-down to its base value; failure reopens it
/// with the cool-down doubled, up to a cap.
pub struct CircuitBreaker {
    /// Current state.
    state: RwLock<CircuitState>,
    /// Consecutive failure count while closed.
    failure_count: AtomicU32,
    /// Failure threshold to open circuit.
    failure_threshold: u32,
    /// Time when circuit was opened.
    opened_at: RwLock<Option<Instant>>,
    /// Cool-down applied the next time the circuit opens.
    current_cooldown: RwLock<Duration>,
    base_cooldown: Duration,
    max_cooldown: Duration,
    /// Whether the half-open probe slot is taken.
    probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with cool-downs in whole seconds.
    pub fn new(failure_threshold: u32, cooldown_secs: u64, max_cooldown_secs: u64) -> Self {
        Self::with_cooldowns(
            failure_threshold,
            Duration::from_secs(cooldown_secs),
            Duration::from_secs(max_cooldown_secs),
        )
    }

    /// Create a new circuit breaker with explicit cool-down durations.
    pub fn with_cooldowns(failure_threshold: u32, base: Duration, max: Duration) -> Self {
        Self {
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            failure_threshold,
            opened_at: RwLock::new(None),
            current_cooldown: RwLock::new(base),
            base_cooldown: base,
            max_cooldown: max.max(base),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.check_state_transition();
        *self.state.read()
    }

    /// Consecutive failures recorded while closed.
    pub fn consecutive_failures(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// The cool-down the breaker is currently operating with.
    pub fn current_cooldown(&self) -> Duration {
        *self.current_cooldown.read()
    }

    /// Remaining time until an open circuit admits its probe.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        if *self.state.read() != CircuitState::Open {
            return None;
        }
        let opened_at = (*self.opened_at.read())?;
        let cooldown = *self.current_cooldown.read();
        Some(cooldown.saturating_sub(opened_at.elapsed()))
    }

    /// Ask for permission to make a call.
    ///
    /// In half-open state only one caller wins the probe slot; everyone else
    /// is rejected until the probe's outcome is recorded.
    pub fn try_acquire(&self) -> Admission {
        match self.state() {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                // Reset failure count on success
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                *self.state.write() = CircuitState::Closed;
                *self.opened_at.write() = None;
                *self.current_cooldown.write() = self.base_cooldown;
                self.failure_count.store(0, Ordering::SeqCst);
                self.probe_in_flight.store(false, Ordering::SeqCst);
                info!("Circuit breaker closed after successful probe");
            }
            CircuitState::Open => {
                // Stale result from before the circuit opened; ignore.
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let state = *self.state.read();

        match state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    *self.state.write() = CircuitState::Open;
                    *self.opened_at.write() = Some(Instant::now());
                    warn!(
                        "Circuit breaker opened after {} consecutive failures (cooldown {:?})",
                        failures,
                        self.current_cooldown()
                    );
                }
            }
            CircuitState::HalfOpen => {
                // The probe failed: reopen with a doubled cool-down.
                let doubled = {
                    let mut cooldown = self.current_cooldown.write();
                    *cooldown = (*cooldown * 2).min(self.max_cooldown);
                    *cooldown
                };
                *self.state.write() = CircuitState::Open;
                *self.opened_at.write() = Some(Instant::now());
                self.probe_in_flight.store(false, Ordering::SeqCst);
                warn!(
                    "Circuit breaker reopened after failed probe, cooldown now {:?}",
                    doubled
                );
            }
            CircuitState::Open => {
                // Already open, nothing to do
            }
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        *self.state.write() = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        *self.opened_at.write() = None;
        *self.current_cooldown.write() = self.base_cooldown;
        self.probe_in_flight.store(false, Ordering::SeqCst);
        debug!("Circuit breaker reset to closed state");
    }

    /// Check if state should transition (open -> half-open after cool-down).
    fn check_state_transition(&self) {
        let state = *self.state.read();

        if state == CircuitState::Open
            && let Some(opened_at) = *self.opened_at.read()
            && opened_at.elapsed() >= *self.current_cooldown.read()
        {
            *self.state.write() = CircuitState::HalfOpen;
            self.probe_in_flight.store(false, Ordering::SeqCst);
            debug!("Circuit breaker transitioned to half-open state");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, 60, 900)
    }
}

/// Point-in-time view of one breaker, for stats reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_secs: u64,
}

/// Manager for circuit breakers per provider key.
///
/// Lazily creates one breaker per `ProviderKey` so each capability/provider
/// pair trips in isolation.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<ProviderKey, Arc<CircuitBreaker>>>,
    failure_threshold: u32,
    cooldown_secs: u64,
    max_cooldown_secs: u64,
}

impl CircuitBreakerManager {
    /// Create a new circuit breaker manager.
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            failure_threshold: config.failure_threshold,
            cooldown_secs: config.cooldown_seconds,
            max_cooldown_secs: config.max_cooldown_seconds,
        }
    }

    /// Get or create a circuit breaker for a provider key.
    pub fn get(&self, key: &ProviderKey) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(key) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.failure_threshold,
                    self.cooldown_secs,
                    self.max_cooldown_secs,
                ))
            })
            .clone()
    }

    /// Ask for permission to call a provider.
    pub fn try_acquire(&self, key: &ProviderKey) -> Admission {
        self.get(key).try_acquire()
    }

    /// Record success for a provider.
    pub fn record_success(&self, key: &ProviderKey) {
        self.get(key).record_success();
    }

    /// Record failure for a provider.
    pub fn record_failure(&self, key: &ProviderKey) {
        self.get(key).record_failure();
    }

    /// Snapshot every breaker the manager has created so far.
    pub fn snapshot(&self) -> Vec<BreakerStatus> {
        let breakers = self.breakers.read();
        let mut statuses: Vec<BreakerStatus> = breakers
            .iter()
            .map(|(key, breaker)| BreakerStatus {
                provider: key.to_string(),
                state: breaker.state(),
                consecutive_failures: breaker.consecutive_failures(),
                cooldown_secs: breaker.current_cooldown().as_secs(),
            })
            .collect();
        statuses.sort_by(|a, b| a.provider.cmp(&b.provider));
        statuses
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(&CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_retry_delay_calculation() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
            use_jitter: false,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(10000)); // Capped at max
    }

    #[test]
    fn test_breaker_opens_on_threshold() {
        let breaker = CircuitBreaker::new(3, 60, 900);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);
        assert!(breaker.time_until_half_open().is_some());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, 60, 900);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let breaker =
            CircuitBreaker::with_cooldowns(1, Duration::from_millis(10), Duration::from_secs(1));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only the first caller wins the probe slot.
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        assert_eq!(breaker.try_acquire(), Admission::Rejected);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn test_failed_probe_doubles_cooldown_to_cap() {
        let breaker = CircuitBreaker::with_cooldowns(
            1,
            Duration::from_millis(10),
            Duration::from_millis(40),
        );

        breaker.record_failure();
        assert_eq!(breaker.current_cooldown(), Duration::from_millis(10));

        for expected_ms in [20u64, 40, 40] {
            std::thread::sleep(breaker.current_cooldown() + Duration::from_millis(10));
            assert_eq!(breaker.try_acquire(), Admission::Probe);
            breaker.record_failure();
            assert_eq!(
                breaker.current_cooldown(),
                Duration::from_millis(expected_ms)
            );
            assert_eq!(breaker.state(), CircuitState::Open);
        }
    }

    #[test]
    fn test_successful_probe_resets_cooldown() {
        let breaker = CircuitBreaker::with_cooldowns(
            1,
            Duration::from_millis(10),
            Duration::from_millis(80),
        );

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        breaker.record_failure();
        assert_eq!(breaker.current_cooldown(), Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.current_cooldown(), Duration::from_millis(10));
    }

    #[test]
    fn test_manager_keys_are_isolated() {
        let manager = CircuitBreakerManager::new(&CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown_seconds: 60,
            max_cooldown_seconds: 900,
        });

        let script_primary = ProviderKey::new(Capability::Script, "primary");
        let script_backup = ProviderKey::new(Capability::Script, "backup");
        let trend_primary = ProviderKey::new(Capability::Trend, "primary");

        manager.record_failure(&script_primary);
        manager.record_failure(&script_primary);

        assert_eq!(manager.try_acquire(&script_primary), Admission::Rejected);
        // Same backend name under another capability is unaffected.
        assert_eq!(manager.try_acquire(&trend_primary), Admission::Allowed);
        assert_eq!(manager.try_acquire(&script_backup), Admission::Allowed);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 3);
        let open = snapshot
            .iter()
            .find(|s| s.provider == "script:primary")
            .unwrap();
        assert_eq!(open.state, CircuitState::Open);
    }
}
