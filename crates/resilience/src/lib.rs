//! Resilience primitives shared by every outbound fulfillment call.
//!
//! Every collaborator call returns a [`StepResult`] which is inspected by
//! value rather than through an error hierarchy. Calls are wrapped as
//! `RetryExecutor::execute(CircuitBreakerRegistry::execute(call))`:
//!
//! - the circuit breaker fails fast with [`StepResult::CircuitOpen`] while a
//!   dependency is unhealthy,
//! - the retry executor re-runs transient failures with exponential backoff.

pub mod circuit_breaker;
pub mod retry;
pub mod step_result;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use retry::{RetryExecutor, RetryPolicy};
pub use step_result::StepResult;
