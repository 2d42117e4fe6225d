//! Collaborator traits for the fulfillment workflow, with in-memory
//! implementations used by tests and the demo binary.
//!
//! Every call reports its outcome through [`StepResult`]; none of them
//! return `Err`.

pub mod inventory;
pub mod notification;
pub mod payment;

use std::collections::VecDeque;
use std::time::Duration;

use resilience::StepResult;

pub use inventory::{InMemoryInventoryService, InventoryService, Reservation};
pub use notification::{InMemoryNotificationService, NotificationService};
pub use payment::{InMemoryPaymentGateway, PaymentGateway, PaymentReceipt};

/// A failure an in-memory collaborator can be told to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Answer with `TransientError`.
    Transient(String),
    /// Answer with `PermanentError`.
    Permanent(String),
    /// Never answer; only a timeout or cancellation ends the call.
    Hang,
}

impl ScriptedFailure {
    /// Shorthand for [`ScriptedFailure::Transient`].
    pub fn transient(reason: impl Into<String>) -> Self {
        ScriptedFailure::Transient(reason.into())
    }

    /// Shorthand for [`ScriptedFailure::Permanent`].
    pub fn permanent(reason: impl Into<String>) -> Self {
        ScriptedFailure::Permanent(reason.into())
    }
}

/// Scripted behavior of one collaborator operation.
///
/// Queued one-shot failures are consumed first; after that the persistent
/// failure (if any) applies to every call.
#[derive(Debug, Default)]
struct OperationScript {
    queued: VecDeque<ScriptedFailure>,
    persistent: Option<ScriptedFailure>,
    latency: Duration,
    calls: u32,
}

impl OperationScript {
    /// Counts the call and returns the latency and failure to apply to it.
    fn begin_call(&mut self) -> (Duration, Option<ScriptedFailure>) {
        self.calls += 1;
        let failure = self
            .queued
            .pop_front()
            .or_else(|| self.persistent.clone());
        (self.latency, failure)
    }

    fn clear(&mut self) {
        self.queued.clear();
        self.persistent = None;
    }
}

/// Waits out the scripted latency and returns the scripted failure, if any.
async fn play<T>(latency: Duration, failure: Option<ScriptedFailure>) -> Option<StepResult<T>> {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
    match failure? {
        ScriptedFailure::Transient(reason) => Some(StepResult::TransientError(reason)),
        ScriptedFailure::Permanent(reason) => Some(StepResult::PermanentError(reason)),
        ScriptedFailure::Hang => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queued_failures_precede_persistent_one() {
        let mut script = OperationScript {
            persistent: Some(ScriptedFailure::permanent("down")),
            ..Default::default()
        };
        script.queued.push_back(ScriptedFailure::transient("blip"));

        assert_eq!(script.begin_call().1, Some(ScriptedFailure::transient("blip")));
        assert_eq!(script.begin_call().1, Some(ScriptedFailure::permanent("down")));
        assert_eq!(script.calls, 2);

        script.clear();
        assert_eq!(script.begin_call().1, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_resolves() {
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            play::<()>(Duration::ZERO, Some(ScriptedFailure::Hang)),
        )
        .await;
        assert!(result.is_err());
    }
}
