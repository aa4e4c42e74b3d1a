//! Circuit Breaker Pattern
//!
//! Prevents cascading failures by fast-failing calls to a protected
//! operation after repeated failures.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a probe call is let through
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    #[default]
    Closed,
    /// Circuit tripped - calls rejected without being attempted
    Open,
    /// A single probe call is in flight
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            CLOSED => CircuitState::Closed,
            OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error returned by a protected call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit rejected the call; the operation was not attempted.
    #[error("circuit breaker for {operation} is open")]
    Open { operation: String },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Per-operation circuit state.
#[derive(Debug)]
struct OperationCircuit {
    /// Current state (CLOSED, OPEN, HALF_OPEN)
    state: AtomicU32,
    /// Failures counted since the circuit last closed
    failures: AtomicU32,
    /// Last failure timestamp (ms since start)
    last_failure_ms: AtomicU64,
}

impl OperationCircuit {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(CLOSED),
            failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
        }
    }

    fn get_state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::SeqCst))
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Reopens a half-open circuit if the probe call is dropped before it
/// reports an outcome, so a cancelled probe cannot wedge the circuit.
struct ProbeGuard {
    circuit: Arc<OperationCircuit>,
    armed: bool,
}

impl ProbeGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.circuit.state.compare_exchange(
                HALF_OPEN,
                OPEN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

/// Circuit breaker keyed by protected operation name.
///
/// Circuits are created lazily on first use and live for the life of the
/// breaker. Leaving OPEN is a compare-and-swap, so exactly one caller
/// gets to probe a recovering operation; the rest keep fast-failing
/// until the probe reports.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<OperationCircuit>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current timestamp in milliseconds.
    fn now_ms() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_millis() as u64
    }

    fn get_or_create(&self, operation: &str) -> Arc<OperationCircuit> {
        if let Some(circuit) = self.circuits.get(operation) {
            return circuit.clone();
        }
        self.circuits
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(OperationCircuit::new()))
            .clone()
    }

    /// Run `f` through the circuit; every `Err` counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: &str, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(operation, f, |_| true).await
    }

    /// Run `f` through the circuit; only errors for which
    /// `counts_as_failure` returns true move the circuit toward OPEN.
    /// Other errors are returned to the caller and treated as a completed
    /// call.
    pub async fn call_classified<T, E, F, Fut, C>(
        &self,
        operation: &str,
        f: F,
        counts_as_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        let circuit = self.get_or_create(operation);

        let admission = match self.admit(operation, &circuit) {
            Some(admission) => admission,
            None => {
                return Err(BreakerError::Open {
                    operation: operation.to_string(),
                })
            }
        };

        let guard = (admission == Admission::Probe).then(|| ProbeGuard {
            circuit: circuit.clone(),
            armed: true,
        });

        let result = f().await;

        match &result {
            Err(e) if counts_as_failure(e) => self.on_failure(operation, &circuit),
            _ => self.on_success(operation, &circuit),
        }
        if let Some(guard) = guard {
            guard.disarm();
        }

        result.map_err(BreakerError::Inner)
    }

    /// Decide whether a call may proceed.
    fn admit(&self, operation: &str, circuit: &OperationCircuit) -> Option<Admission> {
        match circuit.get_state() {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen => None,
            CircuitState::Open => {
                let last_failure = circuit.last_failure_ms.load(Ordering::SeqCst);
                let recovery_ms = self.config.recovery_timeout.as_millis() as u64;

                if Self::now_ms().saturating_sub(last_failure) < recovery_ms {
                    return None;
                }

                match circuit.state.compare_exchange(
                    OPEN,
                    HALF_OPEN,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        tracing::info!("circuit breaker for {} transitioning to half-open", operation);
                        Some(Admission::Probe)
                    }
                    Err(_) => None,
                }
            }
        }
    }

    fn on_success(&self, operation: &str, circuit: &OperationCircuit) {
        match circuit.get_state() {
            CircuitState::HalfOpen => {
                circuit.failures.store(0, Ordering::SeqCst);
                circuit.state.store(CLOSED, Ordering::SeqCst);
                tracing::info!("circuit breaker for {} closed (recovered)", operation);
            }
            CircuitState::Closed => {
                circuit.failures.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, operation: &str, circuit: &OperationCircuit) {
        let now = Self::now_ms();
        circuit.last_failure_ms.store(now, Ordering::SeqCst);

        match circuit.get_state() {
            CircuitState::Closed => {
                let failures = circuit.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold
                    && circuit
                        .state
                        .compare_exchange(CLOSED, OPEN, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    tracing::warn!(
                        "circuit breaker for {} opened after {} failures",
                        operation,
                        failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.failures.fetch_add(1, Ordering::SeqCst);
                circuit.state.store(OPEN, Ordering::SeqCst);
                tracing::warn!("circuit breaker for {} re-opened (probe failed)", operation);
            }
            CircuitState::Open => {
                circuit.failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Get the current state of a circuit.
    pub fn state(&self, operation: &str) -> CircuitState {
        self.circuits
            .get(operation)
            .map(|c| c.get_state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Get metrics for a circuit.
    pub fn metrics(&self, operation: &str) -> CircuitMetrics {
        self.circuits
            .get(operation)
            .map(|c| CircuitMetrics {
                state: c.get_state(),
                failures: c.failures.load(Ordering::SeqCst),
            })
            .unwrap_or_default()
    }

    /// Get all circuit states.
    pub fn all_states(&self) -> Vec<(String, CircuitState)> {
        self.circuits
            .iter()
            .map(|e| (e.key().clone(), e.get_state()))
            .collect()
    }

    /// Manually reset a circuit to closed.
    pub fn reset(&self, operation: &str) {
        if let Some(circuit) = self.circuits.get(operation) {
            circuit.state.store(CLOSED, Ordering::SeqCst);
            circuit.failures.store(0, Ordering::SeqCst);
            tracing::info!("circuit breaker for {} manually reset", operation);
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Metrics for a circuit.
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failures: u32,
}
