//! Tagged outcome of a single collaborator call.

use serde::{Deserialize, Serialize};

/// Reason prefix of a permanent failure produced by running out of retries.
const RETRIES_EXHAUSTED: &str = "retries exhausted";

/// The result of one outbound step.
///
/// Collaborators never signal failure through `Err`; the variant carries
/// the classification that the retry executor and orchestrator act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepResult<T> {
    /// The call succeeded.
    Success(T),

    /// A retryable failure (timeouts, unavailable backends).
    TransientError(String),

    /// A non-retryable rejection (validation, insufficient stock, declined card).
    PermanentError(String),

    /// The endpoint's circuit is open; the call was not attempted.
    CircuitOpen,

    /// The call or its retry delay was aborted by cancellation.
    Cancelled,
}

impl<T> StepResult<T> {
    /// Builds a transient failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        StepResult::TransientError(reason.into())
    }

    /// Builds a permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        StepResult::PermanentError(reason.into())
    }

    /// Builds the permanent failure a retry loop ends with after its last
    /// transient failure.
    pub fn exhausted(last_reason: impl std::fmt::Display) -> Self {
        StepResult::PermanentError(format!("{RETRIES_EXHAUSTED}: {last_reason}"))
    }

    /// Returns true for [`StepResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success(_))
    }

    /// Returns true for [`StepResult::TransientError`].
    pub fn is_transient(&self) -> bool {
        matches!(self, StepResult::TransientError(_))
    }

    /// Returns true for a permanent failure built by [`StepResult::exhausted`]:
    /// the dependency kept failing transiently rather than rejecting the call.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, StepResult::PermanentError(reason) if reason.starts_with(RETRIES_EXHAUSTED))
    }

    /// Returns true for [`StepResult::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepResult::Cancelled)
    }

    /// Consumes the result, returning the success payload if any.
    pub fn success(self) -> Option<T> {
        match self {
            StepResult::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Converts `&StepResult<T>` to `StepResult<&T>`.
    pub fn as_ref(&self) -> StepResult<&T> {
        match self {
            StepResult::Success(value) => StepResult::Success(value),
            StepResult::TransientError(reason) => StepResult::TransientError(reason.clone()),
            StepResult::PermanentError(reason) => StepResult::PermanentError(reason.clone()),
            StepResult::CircuitOpen => StepResult::CircuitOpen,
            StepResult::Cancelled => StepResult::Cancelled,
        }
    }

    /// Maps the success payload, keeping the failure classification.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> StepResult<U> {
        match self {
            StepResult::Success(value) => StepResult::Success(f(value)),
            StepResult::TransientError(reason) => StepResult::TransientError(reason),
            StepResult::PermanentError(reason) => StepResult::PermanentError(reason),
            StepResult::CircuitOpen => StepResult::CircuitOpen,
            StepResult::Cancelled => StepResult::Cancelled,
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StepResult::Success(_) => "success",
            StepResult::TransientError(_) => "transient_error",
            StepResult::PermanentError(_) => "permanent_error",
            StepResult::CircuitOpen => "circuit_open",
            StepResult::Cancelled => "cancelled",
        }
    }

    /// Human-readable failure description, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            StepResult::Success(_) => None,
            StepResult::TransientError(reason) => Some(format!("transient: {reason}")),
            StepResult::PermanentError(reason) => Some(reason.clone()),
            StepResult::CircuitOpen => Some("circuit open".to_string()),
            StepResult::Cancelled => Some("cancelled".to_string()),
        }
    }
}
