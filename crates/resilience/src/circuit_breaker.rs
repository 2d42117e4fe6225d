//! Per-endpoint circuit breakers.
//!
//! The registry owns one state machine per endpoint key:
//!
//! ```text
//! Closed ──(threshold failures within window)──► Open
//!   ▲                                              │
//!   │                                     (cooldown elapsed)
//!   │                                              ▼
//!   └────────────(probe succeeds)────────────── HalfOpen
//!                                                  │
//!                    Open ◄──(probe fails)─────────┘
//! ```
//!
//! HalfOpen admits exactly one probe; concurrent callers get
//! [`StepResult::CircuitOpen`] until it resolves. Each transition bumps a
//! generation counter and results from calls admitted under an older
//! generation are ignored, so a slow call can never move the state backwards.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::step_result::StepResult;

/// Circuit breaker tuning shared by every key in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Transient failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,
    /// Rolling window failures are counted in.
    pub failure_window: Duration,
    /// How long the circuit stays open before a probe is allowed.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast without reaching the dependency.
    Open,
    /// A single probe call is allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of one circuit, for health reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    /// Failures currently inside the rolling window (Closed only).
    pub recent_failures: usize,
    /// Number of transitions the circuit has gone through.
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct Circuit {
    phase: Phase,
    failures: VecDeque<Instant>,
    generation: u64,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    probe: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            phase: Phase::Closed,
            failures: VecDeque::new(),
            generation: 0,
        }
    }

    fn state(&self) -> CircuitState {
        match self.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn transition(&mut self, phase: Phase) {
        self.phase = phase;
        self.failures.clear();
        self.generation += 1;
    }

    /// Applies time-driven transitions (Open → HalfOpen) and window pruning.
    fn refresh(&mut self, now: Instant, config: &CircuitBreakerConfig) {
        match self.phase {
            Phase::Open { until } if now >= until => {
                self.transition(Phase::HalfOpen {
                    probe_in_flight: false,
                });
            }
            Phase::Closed => {
                while let Some(oldest) = self.failures.front() {
                    if now.duration_since(*oldest) >= config.failure_window {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    fn admit(&mut self, now: Instant, config: &CircuitBreakerConfig) -> Option<Admission> {
        self.refresh(now, config);
        match self.phase {
            Phase::Closed => Some(Admission {
                generation: self.generation,
                probe: false,
            }),
            Phase::Open { .. } => None,
            Phase::HalfOpen {
                probe_in_flight: true,
            } => None,
            Phase::HalfOpen {
                probe_in_flight: false,
            } => {
                self.phase = Phase::HalfOpen {
                    probe_in_flight: true,
                };
                Some(Admission {
                    generation: self.generation,
                    probe: true,
                })
            }
        }
    }

    /// Returns true if the circuit opened as a result of this failure.
    fn record_failure(
        &mut self,
        admission: Admission,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> bool {
        if admission.generation != self.generation {
            return false;
        }
        match self.phase {
            Phase::Closed => {
                self.refresh(now, config);
                self.failures.push_back(now);
                if self.failures.len() >= config.failure_threshold as usize {
                    self.transition(Phase::Open {
                        until: now + config.cooldown,
                    });
                    return true;
                }
                false
            }
            Phase::HalfOpen { .. } if admission.probe => {
                self.transition(Phase::Open {
                    until: now + config.cooldown,
                });
                true
            }
            _ => false,
        }
    }

    /// Returns true if the circuit closed as a result of this success.
    fn record_success(&mut self, admission: Admission) -> bool {
        if admission.generation != self.generation {
            return false;
        }
        match self.phase {
            Phase::Closed => {
                self.failures.clear();
                false
            }
            Phase::HalfOpen { .. } if admission.probe => {
                self.transition(Phase::Closed);
                true
            }
            _ => false,
        }
    }

    fn abandon(&mut self, admission: Admission) {
        if admission.probe && admission.generation == self.generation {
            self.phase = Phase::HalfOpen {
                probe_in_flight: false,
            };
        }
    }
}

/// Frees the half-open probe slot if the call never reported a verdict
/// (cancelled, or its future was dropped).
struct ProbeGuard<'a> {
    circuit: &'a Mutex<Circuit>,
    admission: Admission,
    settled: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.circuit.lock().abandon(self.admission);
        }
    }
}

/// Registry of circuit breakers keyed by endpoint name.
///
/// Injected into the orchestrator rather than held globally. Each key's
/// state sits behind its own mutex so workers hitting different endpoints
/// never contend.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Arc<Mutex<Circuit>>>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        tracing::info!(
            failure_threshold = config.failure_threshold,
            failure_window_ms = config.failure_window.as_millis() as u64,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "circuit breaker registry initialized"
        );
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the registry configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, key: &str) -> Arc<Mutex<Circuit>> {
        let mut circuits = self.circuits.lock();
        circuits
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::new())))
            .clone()
    }

    /// Runs `operation` under the circuit for `key`.
    ///
    /// Returns [`StepResult::CircuitOpen`] without invoking `operation` when
    /// the circuit is open or a half-open probe is already in flight.
    /// Transient failures count against the circuit; permanent failures
    /// mean the dependency answered and count as healthy.
    pub async fn execute<T, F, Fut>(&self, key: &str, operation: F) -> StepResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StepResult<T>>,
    {
        let circuit = self.circuit(key);

        let admission = circuit.lock().admit(Instant::now(), &self.config);
        let Some(admission) = admission else {
            metrics::counter!("circuit_rejections_total", "endpoint" => key.to_string())
                .increment(1);
            tracing::debug!(endpoint = key, "circuit open, failing fast");
            return StepResult::CircuitOpen;
        };

        if admission.probe {
            tracing::info!(endpoint = key, "circuit half-open, sending probe");
        }

        let mut guard = ProbeGuard {
            circuit: circuit.as_ref(),
            admission,
            settled: false,
        };

        let result = operation().await;

        match &result {
            StepResult::Success(_) | StepResult::PermanentError(_) => {
                guard.settled = true;
                if circuit.lock().record_success(admission) {
                    tracing::info!(endpoint = key, "circuit closed (recovered)");
                }
            }
            StepResult::TransientError(reason) => {
                guard.settled = true;
                let opened =
                    circuit
                        .lock()
                        .record_failure(admission, Instant::now(), &self.config);
                if opened {
                    metrics::counter!("circuit_opened_total", "endpoint" => key.to_string())
                        .increment(1);
                    tracing::error!(
                        endpoint = key,
                        reason = %reason,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            StepResult::CircuitOpen | StepResult::Cancelled => {}
        }

        drop(guard);
        result
    }

    /// Returns the current state for `key` (Closed for unknown keys).
    pub fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key).state
    }

    /// Returns a snapshot for `key`, applying any elapsed cooldown first.
    pub fn snapshot(&self, key: &str) -> CircuitSnapshot {
        let circuit = self.circuit(key);
        let mut circuit = circuit.lock();
        circuit.refresh(Instant::now(), &self.config);
        CircuitSnapshot {
            state: circuit.state(),
            recent_failures: circuit.failures.len(),
            generation: circuit.generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::oneshot;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_millis(500),
        }
    }

    async fn fail(registry: &CircuitBreakerRegistry, key: &str) -> StepResult<()> {
        registry
            .execute(key, || async { StepResult::transient("connection reset") })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_closed_and_passes_calls() {
        let registry = CircuitBreakerRegistry::new(config(3));
        let result = registry
            .execute("payment", || async { StepResult::Success(5) })
            .await;
        assert_eq!(result, StepResult::Success(5));
        assert_eq!(registry.state("payment"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let registry = CircuitBreakerRegistry::new(config(3));

        for _ in 0..3 {
            assert!(fail(&registry, "payment").await.is_transient());
        }
        assert_eq!(registry.state("payment"), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = registry
            .execute("payment", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                StepResult::Success(())
            })
            .await;
        assert_eq!(result, StepResult::CircuitOpen);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let registry = CircuitBreakerRegistry::new(config(1));
        fail(&registry, "payment").await;

        assert_eq!(registry.state("payment"), CircuitState::Open);
        assert_eq!(registry.state("inventory"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let registry = CircuitBreakerRegistry::new(config(3));
        fail(&registry, "inventory").await;
        fail(&registry, "inventory").await;
        registry
            .execute("inventory", || async { StepResult::Success(()) })
            .await;
        fail(&registry, "inventory").await;

        let snapshot = registry.snapshot("inventory");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.recent_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_expire() {
        let registry = CircuitBreakerRegistry::new(config(2));
        fail(&registry, "payment").await;
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&registry, "payment").await;

        assert_eq!(registry.state("payment"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_do_not_trip() {
        let registry = CircuitBreakerRegistry::new(config(2));
        for _ in 0..5 {
            registry
                .execute("inventory", || async {
                    StepResult::<()>::permanent("InsufficientStock")
                })
                .await;
        }
        assert_eq!(registry.state("inventory"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_and_probe_success_closes() {
        let registry = CircuitBreakerRegistry::new(config(1));
        fail(&registry, "payment").await;
        assert_eq!(registry.state("payment"), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(registry.state("payment"), CircuitState::HalfOpen);

        let result = registry
            .execute("payment", || async { StepResult::Success(()) })
            .await;
        assert!(result.is_success());
        assert_eq!(registry.state("payment"), CircuitState::Closed);
        assert_eq!(registry.snapshot("payment").recent_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_and_restarts_cooldown() {
        let registry = CircuitBreakerRegistry::new(config(1));
        fail(&registry, "payment").await;
        tokio::time::advance(Duration::from_millis(500)).await;

        assert!(fail(&registry, "payment").await.is_transient());
        assert_eq!(registry.state("payment"), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert_eq!(registry.state("payment"), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(registry.state("payment"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_while_half_open() {
        let registry = Arc::new(CircuitBreakerRegistry::new(config(1)));
        fail(&registry, "payment").await;
        tokio::time::advance(Duration::from_millis(500)).await;

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let probe = tokio::spawn({
            let registry = registry.clone();
            async move {
                registry
                    .execute("payment", || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        StepResult::Success(())
                    })
                    .await
            }
        });
        started_rx.await.unwrap();

        let invoked = AtomicU32::new(0);
        let concurrent = registry
            .execute("payment", || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                StepResult::Success(())
            })
            .await;
        assert_eq!(concurrent, StepResult::CircuitOpen);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_success());
        assert_eq!(registry.state("payment"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_slot() {
        let registry = Arc::new(CircuitBreakerRegistry::new(config(1)));
        fail(&registry, "payment").await;
        tokio::time::advance(Duration::from_millis(500)).await;

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let probe = tokio::spawn({
            let registry = registry.clone();
            async move {
                registry
                    .execute("payment", || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<StepResult<()>>().await
                    })
                    .await
            }
        });
        started_rx.await.unwrap();
        probe.abort();
        let _ = probe.await;

        let result = registry
            .execute("payment", || async { StepResult::Success(()) })
            .await;
        assert!(result.is_success());
        assert_eq!(registry.state("payment"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_result_does_not_move_state() {
        let registry = Arc::new(CircuitBreakerRegistry::new(config(1)));

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slow = tokio::spawn({
            let registry = registry.clone();
            async move {
                registry
                    .execute("payment", || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        StepResult::Success(())
                    })
                    .await
            }
        });
        started_rx.await.unwrap();

        fail(&registry, "payment").await;
        assert_eq!(registry.state("payment"), CircuitState::Open);

        release_tx.send(()).unwrap();
        slow.await.unwrap();
        assert_eq!(registry.state("payment"), CircuitState::Open);
    }
}
