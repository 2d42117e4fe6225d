//! Notification service trait and in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use common::{CustomerId, OrderId};
use parking_lot::RwLock;
use resilience::StepResult;

use super::{OperationScript, ScriptedFailure, play};

/// Trait for customer notifications.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Sends the order confirmation to the customer.
    async fn send_confirmation(&self, customer_id: CustomerId, order_id: OrderId)
    -> StepResult<()>;
}

#[derive(Debug, Default)]
struct InMemoryNotificationState {
    sent: Vec<(CustomerId, OrderId)>,
    send: OperationScript,
}

/// In-memory notification service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    state: Arc<RwLock<InMemoryNotificationState>>,
}

impl InMemoryNotificationService {
    /// Creates a new in-memory notification service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next send fail with `failure`.
    pub fn fail_next_send(&self, failure: ScriptedFailure) {
        self.state.write().send.queued.push_back(failure);
    }

    /// Makes every send fail with `failure` until cleared.
    pub fn fail_sends(&self, failure: ScriptedFailure) {
        self.state.write().send.persistent = Some(failure);
    }

    /// Removes all scripted failures.
    pub fn clear_failures(&self) {
        self.state.write().send.clear();
    }

    /// Returns the number of `send_confirmation` calls made.
    pub fn send_calls(&self) -> u32 {
        self.state.read().send.calls
    }

    /// Returns the number of confirmations delivered.
    pub fn sent_count(&self) -> usize {
        self.state.read().sent.len()
    }

    /// Returns true if a confirmation for the order was delivered.
    pub fn was_sent(&self, order_id: OrderId) -> bool {
        self.state
            .read()
            .sent
            .iter()
            .any(|(_, sent)| *sent == order_id)
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn send_confirmation(&self, customer_id: CustomerId, order_id: OrderId) -> StepResult<()> {
        let (latency, failure) = self.state.write().send.begin_call();
        if let Some(result) = play(latency, failure).await {
            return result;
        }

        self.state.write().sent.push((customer_id, order_id));
        StepResult::Success(())
    }
}
