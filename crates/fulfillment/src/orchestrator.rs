//! Per-order fulfillment workflow.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::OrderId;
use resilience::{CircuitBreakerRegistry, RetryExecutor, StepResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::endpoints::{ENDPOINT_INVENTORY, ENDPOINT_NOTIFICATION, ENDPOINT_PAYMENT};
use crate::notification_retry::NotificationScheduler;
use crate::services::{
    InventoryService, NotificationService, PaymentGateway, PaymentReceipt, Reservation,
};
use crate::state::OrderState;
use crate::work_item::WorkItem;

/// The external collaborators an orchestrator drives.
pub struct Collaborators<P, I, N> {
    pub payment: Arc<P>,
    pub inventory: Arc<I>,
    pub notification: Arc<N>,
}

impl<P, I, N> Collaborators<P, I, N> {
    pub fn new(payment: Arc<P>, inventory: Arc<I>, notification: Arc<N>) -> Self {
        Self {
            payment,
            inventory,
            notification,
        }
    }
}

impl<P, I, N> Clone for Collaborators<P, I, N> {
    fn clone(&self) -> Self {
        Self {
            payment: self.payment.clone(),
            inventory: self.inventory.clone(),
            notification: self.notification.clone(),
        }
    }
}

/// Outcome of releasing a captured payment after a later critical step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub order_id: OrderId,
    /// Why the payment had to be released.
    pub reason: String,
    pub succeeded: bool,
    /// The release failure, when it did not succeed.
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Everything one workflow run produced.
#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub order_id: OrderId,
    pub payment: StepResult<PaymentReceipt>,
    pub inventory: StepResult<Reservation>,
    pub notification: StepResult<()>,
    /// Terminal state this run resolves to.
    pub state: OrderState,
    pub compensation: Option<CompensationRecord>,
    /// Retry record created for a failed confirmation.
    pub notification_retry: Option<u64>,
    /// True when re-running the whole workflow later may succeed: the
    /// deciding critical step hit an open circuit and no funds remain
    /// captured.
    pub retryable: bool,
    /// True when the deciding critical step kept failing transiently until
    /// its retries ran out. Such orders are dead-lettered.
    pub retries_exhausted: bool,
    /// Human-readable summary, used as the status message.
    pub message: String,
}

/// Runs the fulfillment workflow for one order.
///
/// Payment, inventory reservation and the confirmation are launched
/// concurrently. Each call goes through the retry executor, then the
/// endpoint's circuit breaker, then the per-call timeout:
///
/// ```text
/// retry ─► breaker[endpoint] ─► timeout ─► collaborator
/// ```
///
/// Payment and inventory decide the order's fate; the confirmation is
/// best-effort. Payment's result is inspected first, so when both critical
/// steps fail no compensation is attempted.
pub struct Orchestrator<P, I, N> {
    payment: Arc<P>,
    inventory: Arc<I>,
    notification: Arc<N>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
    call_timeout: Duration,
    notifications: Option<NotificationScheduler>,
}

impl<P, I, N> Orchestrator<P, I, N>
where
    P: PaymentGateway + 'static,
    I: InventoryService + 'static,
    N: NotificationService + 'static,
{
    /// Creates an orchestrator. Failed confirmations are only logged until
    /// a scheduler is attached with [`Self::with_notification_scheduler`].
    pub fn new(
        collaborators: Collaborators<P, I, N>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryExecutor,
        call_timeout: Duration,
    ) -> Self {
        Self {
            payment: collaborators.payment,
            inventory: collaborators.inventory,
            notification: collaborators.notification,
            breakers,
            retry,
            call_timeout,
            notifications: None,
        }
    }

    /// Hands failed confirmations to `scheduler` for out-of-band delivery.
    pub fn with_notification_scheduler(mut self, scheduler: NotificationScheduler) -> Self {
        self.notifications = Some(scheduler);
        self
    }

    /// Returns the circuit breaker registry.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Returns the retry executor.
    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Runs one workflow pass for `item`.
    #[tracing::instrument(skip(self, item, cancel), fields(order_id = %item.order_id, attempt = item.attempt))]
    pub async fn run(&self, item: &WorkItem, cancel: &CancellationToken) -> ProcessingOutcome {
        let order_id = item.order_id;
        let payload = &item.payload;

        // 1. Fan out
        let payment = &self.payment;
        let inventory = &self.inventory;
        let notification = &self.notification;
        let (payment_result, inventory_result, notification_result) = tokio::join!(
            self.call(ENDPOINT_PAYMENT, cancel, move || {
                payment.process_payment(order_id, payload.amount)
            }),
            self.call(ENDPOINT_INVENTORY, cancel, move || {
                inventory.reserve_items(order_id, payload.items.clone())
            }),
            self.call(ENDPOINT_NOTIFICATION, cancel, move || {
                notification.send_confirmation(payload.customer_id, order_id)
            }),
        );

        tracing::debug!(
            payment = payment_result.kind(),
            inventory = inventory_result.kind(),
            notification = notification_result.kind(),
            "workflow steps settled"
        );

        // 2. Decide on the critical steps, payment first
        let mut compensation = None;
        let mut retryable = false;
        let mut retries_exhausted = false;
        let (state, message) = match (&payment_result, &inventory_result) {
            (StepResult::Success(_), StepResult::Success(_)) => {
                (OrderState::Completed, "order completed".to_string())
            }
            (StepResult::Success(_), failed) => {
                let reason = format!("inventory {}", describe(failed));
                let record = self.compensate(order_id, &reason).await;
                let resolved = if !record.succeeded {
                    let error = record.error.clone().unwrap_or_default();
                    (
                        OrderState::RequiresManualReview,
                        format!("{reason}; payment release failed: {error}"),
                    )
                } else if failed.is_cancelled() {
                    (OrderState::Cancelled, format!("{reason}; payment released"))
                } else {
                    retryable = matches!(failed, StepResult::CircuitOpen);
                    retries_exhausted = failed.is_exhausted();
                    (OrderState::Failed, format!("{reason}; payment released"))
                };
                compensation = Some(record);
                resolved
            }
            (failed, reservation) => {
                let mut reservation_held = false;
                if reservation.is_success() {
                    reservation_held = !self.release_reservation(order_id).await;
                }
                let reason = format!("payment {}", describe(failed));
                if failed.is_cancelled() {
                    (OrderState::Cancelled, reason)
                } else {
                    retryable = matches!(failed, StepResult::CircuitOpen) && !reservation_held;
                    retries_exhausted = failed.is_exhausted();
                    (OrderState::Failed, reason)
                }
            }
        };

        // 3. Best-effort confirmation
        let mut notification_retry = None;
        if state == OrderState::Completed {
            if let Some(reason) = notification_result.failure_reason() {
                notification_retry =
                    self.schedule_notification_retry(order_id, payload.customer_id, reason);
            }
        }

        ProcessingOutcome {
            order_id,
            payment: payment_result,
            inventory: inventory_result,
            notification: notification_result,
            state,
            compensation,
            notification_retry,
            retryable,
            retries_exhausted,
            message,
        }
    }

    /// One outbound call through retry, the endpoint breaker and the timeout.
    async fn call<T, F, Fut>(
        &self,
        endpoint: &'static str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> StepResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StepResult<T>>,
    {
        let timeout = self.call_timeout;
        let breakers = &self.breakers;
        self.retry
            .execute(cancel, || {
                let call = operation();
                breakers.execute(endpoint, move || with_timeout(timeout, call))
            })
            .await
    }

    /// Releases the captured payment exactly once.
    ///
    /// The release bypasses the breaker and the retry executor and runs in
    /// its own task, so it completes even if this run is cancelled.
    async fn compensate(&self, order_id: OrderId, reason: &str) -> CompensationRecord {
        metrics::counter!("compensations_total").increment(1);
        tracing::warn!(%order_id, reason, "releasing payment");

        let payment = self.payment.clone();
        let timeout = self.call_timeout;
        let release = tokio::spawn(async move {
            with_timeout(timeout, payment.release_payment(order_id)).await
        });

        let error = match release.await {
            Ok(StepResult::Success(())) => None,
            Ok(failed) => Some(failed.failure_reason().unwrap_or_default()),
            Err(e) => Some(format!("release task failed: {e}")),
        };

        match &error {
            None => tracing::info!(%order_id, "payment released"),
            Some(error) => {
                metrics::counter!("compensation_failures_total").increment(1);
                tracing::error!(%order_id, error = %error, "payment release failed, order needs manual review");
            }
        }

        CompensationRecord {
            order_id,
            reason: reason.to_string(),
            succeeded: error.is_none(),
            error,
            at: Utc::now(),
        }
    }

    /// Releases a reservation whose payment failed. Returns true on success.
    async fn release_reservation(&self, order_id: OrderId) -> bool {
        let inventory = self.inventory.clone();
        let timeout = self.call_timeout;
        let release = tokio::spawn(async move {
            with_timeout(timeout, inventory.release_items(order_id)).await
        });

        match release.await {
            Ok(StepResult::Success(())) => true,
            Ok(failed) => {
                tracing::warn!(
                    %order_id,
                    error = failed.failure_reason().unwrap_or_default(),
                    "failed to release reservation"
                );
                false
            }
            Err(e) => {
                tracing::warn!(%order_id, error = %e, "reservation release task failed");
                false
            }
        }
    }

    fn schedule_notification_retry(
        &self,
        order_id: OrderId,
        customer_id: common::CustomerId,
        reason: String,
    ) -> Option<u64> {
        match &self.notifications {
            Some(scheduler) => {
                let id = scheduler.schedule(order_id, customer_id, reason.clone());
                tracing::warn!(%order_id, retry_id = id, reason = %reason, "confirmation failed, retry scheduled");
                Some(id)
            }
            None => {
                tracing::warn!(%order_id, reason = %reason, "confirmation failed, no retrier attached");
                None
            }
        }
    }
}

fn describe<T>(result: &StepResult<T>) -> String {
    match result.failure_reason() {
        Some(reason) => format!("failed: {reason}"),
        None => "succeeded".to_string(),
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = StepResult<T>>,
) -> StepResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => StepResult::transient(format!("call timed out after {}ms", timeout.as_millis())),
    }
}
