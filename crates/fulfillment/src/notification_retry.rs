//! Out-of-band re-delivery of failed order confirmations.
//!
//! The confirmation is best-effort: an order completes even when it could
//! not be sent. The orchestrator hands the failure to a
//! [`NotificationScheduler`], which records it in the
//! [`NotificationRetryLog`] and wakes the [`NotificationRetrier`] task.
//! The retrier re-sends through the `notification` circuit with backoff
//! and gives up after a fixed number of attempts.
//!
//! ```text
//! Pending ──► Delivered
//!    │
//!    └──────► Abandoned   (attempts exhausted or permanent rejection)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CustomerId, OrderId};
use parking_lot::RwLock;
use resilience::{CircuitBreakerRegistry, RetryExecutor, RetryPolicy, StepResult};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::endpoints::ENDPOINT_NOTIFICATION;
use crate::services::NotificationService;

/// Delivery state of a retry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationRetryStatus {
    Pending,
    Delivered,
    Abandoned,
}

impl NotificationRetryStatus {
    /// Returns true once the record will not change any more.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NotificationRetryStatus::Pending)
    }
}

/// A confirmation that still has to reach the customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRetryRecord {
    pub id: u64,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    /// Re-delivery attempts made by the retrier.
    pub attempts: u32,
    pub status: NotificationRetryStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store of notification retry records.
#[derive(Debug, Default)]
pub struct NotificationRetryLog {
    records: RwLock<HashMap<u64, NotificationRetryRecord>>,
    next_id: AtomicU64,
}

impl NotificationRetryLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn create(&self, order_id: OrderId, customer_id: CustomerId, error: String) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let record = NotificationRetryRecord {
            id,
            order_id,
            customer_id,
            attempts: 0,
            status: NotificationRetryStatus::Pending,
            last_error: Some(error),
            created_at: now,
            updated_at: now,
        };
        self.records.write().insert(id, record);
        id
    }

    fn update(&self, id: u64, f: impl FnOnce(&mut NotificationRetryRecord)) {
        if let Some(record) = self.records.write().get_mut(&id) {
            f(record);
            record.updated_at = Utc::now();
        }
    }

    /// Returns a copy of the record.
    pub fn get(&self, id: u64) -> Option<NotificationRetryRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Returns the most recent record for the order.
    pub fn for_order(&self, order_id: OrderId) -> Option<NotificationRetryRecord> {
        self.records
            .read()
            .values()
            .filter(|record| record.order_id == order_id)
            .max_by_key(|record| record.id)
            .cloned()
    }

    /// Returns the number of records in `status`.
    pub fn count_in(&self, status: NotificationRetryStatus) -> usize {
        self.records
            .read()
            .values()
            .filter(|record| record.status == status)
            .count()
    }

    /// Returns the total number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if no confirmation ever needed a retry.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

/// Handle used by the orchestrator to request a re-delivery.
///
/// Scheduling never blocks. The retrier task stops once every scheduler
/// clone has been dropped and the pending records are processed.
#[derive(Debug, Clone)]
pub struct NotificationScheduler {
    log: Arc<NotificationRetryLog>,
    sender: mpsc::UnboundedSender<u64>,
}

impl NotificationScheduler {
    /// Records the failed confirmation and queues it for re-delivery.
    /// Returns the retry record ID.
    pub fn schedule(&self, order_id: OrderId, customer_id: CustomerId, error: String) -> u64 {
        let id = self.log.create(order_id, customer_id, error);
        if self.sender.send(id).is_err() {
            tracing::warn!(%order_id, retry_id = id, "notification retrier stopped, abandoning retry");
            self.log.update(id, |record| {
                record.status = NotificationRetryStatus::Abandoned;
            });
        }
        id
    }
}

struct RetryContext<N> {
    notification: Arc<N>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
    call_timeout: Duration,
    log: Arc<NotificationRetryLog>,
}

/// Background task that re-delivers failed confirmations.
#[derive(Debug)]
pub struct NotificationRetrier {
    handle: JoinHandle<()>,
}

impl NotificationRetrier {
    /// Spawns the retrier and returns it with the scheduler feeding it.
    ///
    /// `policy.max_attempts` is the re-delivery ceiling per record.
    pub fn spawn<N>(
        notification: Arc<N>,
        breakers: Arc<CircuitBreakerRegistry>,
        policy: RetryPolicy,
        call_timeout: Duration,
        log: Arc<NotificationRetryLog>,
        cancel: CancellationToken,
    ) -> (NotificationScheduler, NotificationRetrier)
    where
        N: NotificationService + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let context = Arc::new(RetryContext {
            notification,
            breakers,
            retry: RetryExecutor::new(policy),
            call_timeout,
            log: log.clone(),
        });

        let handle = tokio::spawn(run(context, receiver, cancel));
        (NotificationScheduler { log, sender }, NotificationRetrier { handle })
    }

    /// Waits for the task to finish.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "notification retrier panicked");
        }
    }
}

async fn run<N>(
    context: Arc<RetryContext<N>>,
    mut receiver: mpsc::UnboundedReceiver<u64>,
    cancel: CancellationToken,
) where
    N: NotificationService + 'static,
{
    tracing::info!("notification retrier started");
    let mut deliveries = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "notification delivery task failed");
                }
            }
            next = receiver.recv() => match next {
                Some(id) => {
                    deliveries.spawn(deliver(context.clone(), id, cancel.clone()));
                }
                None => break,
            },
        }
    }

    while let Some(joined) = deliveries.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "notification delivery task failed");
        }
    }
    tracing::info!(
        pending = context.log.count_in(NotificationRetryStatus::Pending),
        "notification retrier stopped"
    );
}

async fn deliver<N>(context: Arc<RetryContext<N>>, id: u64, cancel: CancellationToken)
where
    N: NotificationService + 'static,
{
    let Some(record) = context.log.get(id) else {
        return;
    };
    let (order_id, customer_id) = (record.order_id, record.customer_id);

    // The first send already failed inside the order workflow.
    if !context.retry.backoff(&cancel, 1).await {
        return;
    }

    let mut attempts = 0u32;
    let result = context
        .retry
        .execute(&cancel, || {
            attempts += 1;
            metrics::counter!("notification_retries_total").increment(1);
            let context = &context;
            async move {
                let outcome = context
                    .breakers
                    .execute(ENDPOINT_NOTIFICATION, || async {
                        match tokio::time::timeout(
                            context.call_timeout,
                            context.notification.send_confirmation(customer_id, order_id),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => StepResult::transient(format!(
                                "call timed out after {}ms",
                                context.call_timeout.as_millis()
                            )),
                        }
                    })
                    .await;
                match outcome {
                    // Open circuits are worth waiting out here.
                    StepResult::CircuitOpen => StepResult::transient("circuit open"),
                    other => other,
                }
            }
        })
        .await;

    match result {
        StepResult::Success(()) => {
            tracing::info!(%order_id, retry_id = id, attempts, "confirmation delivered on retry");
            context.log.update(id, |record| {
                record.attempts = attempts;
                record.status = NotificationRetryStatus::Delivered;
                record.last_error = None;
            });
        }
        StepResult::Cancelled => {
            tracing::info!(%order_id, retry_id = id, attempts, "confirmation retry interrupted");
            context.log.update(id, |record| record.attempts = attempts);
        }
        failed => {
            let error = failed.failure_reason().unwrap_or_default();
            tracing::warn!(
                %order_id,
                retry_id = id,
                attempts,
                error = %error,
                "confirmation abandoned"
            );
            context.log.update(id, |record| {
                record.attempts = attempts;
                record.status = NotificationRetryStatus::Abandoned;
                record.last_error = Some(error);
            });
        }
    }
}
