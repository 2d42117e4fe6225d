//! Worker pool consuming the work queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::OrderId;
use resilience::{CircuitBreakerRegistry, RetryExecutor};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{FulfillmentConfig, OverflowPolicy};
use crate::dead_letter::DeadLetterQueue;
use crate::error::{ConfigError, QueueError};
use crate::notification_retry::{NotificationRetrier, NotificationRetryLog};
use crate::orchestrator::{Collaborators, Orchestrator, ProcessingOutcome};
use crate::queue::WorkQueue;
use crate::services::{InventoryService, NotificationService, PaymentGateway};
use crate::single_flight::OrderLocks;
use crate::state::OrderState;
use crate::status::{OrderStatusBoard, StatusPublisher, StatusTracker};
use crate::work_item::{OrderPayload, WorkItem};

/// Producer-facing entry point.
///
/// Enqueueing registers the order as `Pending` on the status board, places
/// it on the queue and publishes that first event. Those steps run under a
/// short per-order admission lock that workers only touch momentarily, so
/// a duplicate submission never waits on an order that is being processed.
#[derive(Clone)]
pub struct OrderIntake {
    queue: Arc<WorkQueue>,
    tracker: StatusTracker,
    admissions: Arc<OrderLocks>,
}

impl OrderIntake {
    /// Accepts an order for processing.
    ///
    /// Fails with [`QueueError::QueueFull`] when the queue is at capacity
    /// under the `Reject` policy; under `Wait` it suspends until a worker
    /// frees a slot. Fails with [`QueueError::QueueClosed`] once the pool
    /// is shutting down.
    pub async fn enqueue(&self, order_id: OrderId, payload: OrderPayload) -> Result<(), QueueError> {
        let mut item = WorkItem::new(order_id, payload);
        let board = self.tracker.board();

        loop {
            {
                let _admission = self.admissions.acquire(order_id).await;
                // Registered before it is queued, so anything that dequeues
                // the item finds it on the board.
                let pending = board.register(order_id);
                match self.queue.try_enqueue(item) {
                    Ok(()) => {
                        metrics::counter!("orders_enqueued_total").increment(1);
                        match pending {
                            Some(event) => self.tracker.publish(event).await,
                            None => {
                                tracing::debug!(%order_id, "order already known, queued as duplicate")
                            }
                        }
                        return Ok(());
                    }
                    Err((err, rejected)) => {
                        if pending.is_some() {
                            board.forget(order_id);
                        }
                        let wait = matches!(err, QueueError::QueueFull { .. })
                            && self.queue.policy() == OverflowPolicy::Wait;
                        if !wait {
                            tracing::warn!(%order_id, error = %err, "order rejected");
                            return Err(err);
                        }
                        item = rejected;
                    }
                }
            }
            self.queue.wait_for_space().await;
        }
    }
}

/// What a pool shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Orders still queued when the workers stopped; now `Cancelled`.
    pub cancelled: Vec<OrderId>,
    /// True if the grace period elapsed and in-flight work was cancelled.
    pub forced: bool,
}

struct WorkerContext<P, I, N> {
    orchestrator: Orchestrator<P, I, N>,
    queue: Arc<WorkQueue>,
    tracker: StatusTracker,
    locks: Arc<OrderLocks>,
    admissions: Arc<OrderLocks>,
    dead_letters: Arc<DeadLetterQueue>,
    order_retry: RetryExecutor,
    max_attempts: u32,
    cancel: CancellationToken,
    stop: CancellationToken,
}

/// Fixed-size pool of workers draining one shared [`WorkQueue`].
///
/// Each worker runs one order at a time, so the pool's concurrency bound
/// is its worker count. The pool also owns the notification retrier.
pub struct WorkerPool {
    intake: OrderIntake,
    queue: Arc<WorkQueue>,
    board: Arc<OrderStatusBoard>,
    tracker: StatusTracker,
    locks: Arc<OrderLocks>,
    admissions: Arc<OrderLocks>,
    dead_letters: Arc<DeadLetterQueue>,
    notification_retries: Arc<NotificationRetryLog>,
    breakers: Arc<CircuitBreakerRegistry>,
    workers: JoinSet<()>,
    retrier: NotificationRetrier,
    worker_count: usize,
    cancel: CancellationToken,
    stop: CancellationToken,
}

impl WorkerPool {
    /// Validates `config` and spawns the workers and the notification retrier.
    ///
    /// `cancel` is the process-wide token; the pool derives a child token
    /// from it, so cancelling `cancel` aborts in-flight work too.
    pub fn start<P, I, N>(
        config: &FulfillmentConfig,
        collaborators: Collaborators<P, I, N>,
        publisher: Arc<dyn StatusPublisher>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError>
    where
        P: PaymentGateway + 'static,
        I: InventoryService + 'static,
        N: NotificationService + 'static,
    {
        config.validate()?;

        let cancel = cancel.child_token();
        let stop = CancellationToken::new();
        let queue = Arc::new(WorkQueue::new(config.queue_capacity, config.overflow_policy));
        let board = Arc::new(OrderStatusBoard::new());
        let tracker = StatusTracker::new(board.clone(), publisher);
        let locks = Arc::new(OrderLocks::new());
        let admissions = Arc::new(OrderLocks::new());
        let dead_letters = Arc::new(DeadLetterQueue::new());
        let notification_retries = Arc::new(NotificationRetryLog::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker()));

        let (scheduler, retrier) = NotificationRetrier::spawn(
            collaborators.notification.clone(),
            breakers.clone(),
            config.notification_retry_policy(),
            config.per_call_timeout(),
            notification_retries.clone(),
            cancel.clone(),
        );

        let orchestrator = Orchestrator::new(
            collaborators,
            breakers.clone(),
            RetryExecutor::new(config.retry_policy()),
            config.per_call_timeout(),
        )
        .with_notification_scheduler(scheduler);

        let context = Arc::new(WorkerContext {
            orchestrator,
            queue: queue.clone(),
            tracker: tracker.clone(),
            locks: locks.clone(),
            admissions: admissions.clone(),
            dead_letters: dead_letters.clone(),
            order_retry: RetryExecutor::new(config.retry_policy()),
            max_attempts: config.max_retry_attempts,
            cancel: cancel.clone(),
            stop: stop.clone(),
        });

        let mut workers = JoinSet::new();
        for worker in 0..config.worker_count {
            workers.spawn(worker_loop(worker, context.clone()));
        }
        drop(context);

        tracing::info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            overflow_policy = ?config.overflow_policy,
            "worker pool started"
        );

        Ok(Self {
            intake: OrderIntake {
                queue: queue.clone(),
                tracker: tracker.clone(),
                admissions: admissions.clone(),
            },
            queue,
            board,
            tracker,
            locks,
            admissions,
            dead_letters,
            notification_retries,
            breakers,
            workers,
            retrier,
            worker_count: config.worker_count,
            cancel,
            stop,
        })
    }

    /// Returns a producer handle.
    pub fn intake(&self) -> OrderIntake {
        self.intake.clone()
    }

    /// Shorthand for `self.intake().enqueue(..)`.
    pub async fn enqueue(&self, order_id: OrderId, payload: OrderPayload) -> Result<(), QueueError> {
        self.intake.enqueue(order_id, payload).await
    }

    pub fn board(&self) -> &Arc<OrderStatusBoard> {
        &self.board
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn notification_retries(&self) -> &Arc<NotificationRetryLog> {
        &self.notification_retries
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Stops intake, lets the workers finish every queued order, then
    /// waits for pending confirmation retries to settle.
    pub async fn drain(mut self) {
        tracing::info!(queued = self.queue.len(), "draining worker pool");
        self.queue.close();
        join_workers(&mut self.workers).await;
        // Workers held the last notification schedulers.
        self.retrier.join().await;
        tracing::info!("worker pool drained");
    }

    /// Stops intake and dequeuing, giving in-flight orders `grace` to finish.
    ///
    /// When the grace period runs out the pool's cancellation token is
    /// tripped: in-flight calls and retry delays abort, started
    /// compensations still complete. Orders left in the queue are moved
    /// to `Cancelled`.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        tracing::info!(grace_ms = grace.as_millis() as u64, "shutting down worker pool");
        self.queue.close();
        self.stop.cancel();

        let forced = tokio::time::timeout(grace, join_workers(&mut self.workers))
            .await
            .is_err();
        if forced {
            tracing::warn!(
                in_flight = self.locks.in_flight(),
                "grace period elapsed, cancelling in-flight orders"
            );
            self.cancel.cancel();
            join_workers(&mut self.workers).await;
        }

        let mut cancelled = Vec::new();
        for item in self.queue.drain_remaining() {
            let order_id = item.order_id;
            // Let an intake finish publishing the order's Pending event.
            let _admission = self.admissions.acquire(order_id).await;
            if self.board.state(order_id) != Some(OrderState::Pending) {
                continue;
            }
            match self
                .tracker
                .transition(order_id, OrderState::Cancelled, "cancelled during shutdown")
                .await
            {
                Ok(()) => {
                    metrics::counter!("orders_cancelled_total").increment(1);
                    cancelled.push(order_id);
                }
                Err(e) => tracing::error!(%order_id, error = %e, "failed to cancel queued order"),
            }
        }

        self.cancel.cancel();
        self.retrier.join().await;

        tracing::info!(cancelled = cancelled.len(), forced, "worker pool stopped");
        ShutdownReport { cancelled, forced }
    }
}

async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "worker task failed");
        }
    }
}

async fn worker_loop<P, I, N>(worker: usize, context: Arc<WorkerContext<P, I, N>>)
where
    P: PaymentGateway + 'static,
    I: InventoryService + 'static,
    N: NotificationService + 'static,
{
    tracing::debug!(worker, "worker started");
    loop {
        let item = tokio::select! {
            biased;
            () = context.stop.cancelled() => break,
            () = context.cancel.cancelled() => break,
            item = context.queue.dequeue() => match item {
                Some(item) => item,
                None => break,
            },
        };
        context.process(item).await;
    }
    tracing::debug!(worker, "worker stopped");
}

impl<P, I, N> WorkerContext<P, I, N>
where
    P: PaymentGateway + 'static,
    I: InventoryService + 'static,
    N: NotificationService + 'static,
{
    #[tracing::instrument(skip(self, item), fields(order_id = %item.order_id))]
    async fn process(&self, mut item: WorkItem) {
        let order_id = item.order_id;
        let _guard = self.locks.acquire(order_id).await;
        // Let an intake finish publishing the order's Pending event.
        drop(self.admissions.acquire(order_id).await);
        let board = self.tracker.board();

        match board.state(order_id) {
            Some(state) if state.can_start_processing() => {}
            Some(state) => {
                metrics::counter!("orders_duplicate_skipped_total").increment(1);
                tracing::debug!(%state, "order already handled, skipping duplicate");
                return;
            }
            None => {
                // Enqueued straight onto the queue, bypassing the intake.
                self.tracker.accept(order_id).await;
            }
        }

        if let Err(e) = self
            .tracker
            .transition(order_id, OrderState::Processing, "processing started")
            .await
        {
            tracing::error!(error = %e, "failed to start order");
            return;
        }

        let started = Instant::now();
        let (state, message) = loop {
            item.attempt += 1;
            if let Err(e) = board.record_attempt(order_id, item.attempt) {
                tracing::warn!(error = %e, "failed to record attempt");
            }

            let outcome = self.orchestrator.run(&item, &self.cancel).await;
            self.record(&outcome);

            if outcome.retries_exhausted {
                self.dead_letters.push(item.clone(), outcome.message.clone());
                break (outcome.state, outcome.message);
            }
            if !outcome.retryable {
                break (outcome.state, outcome.message);
            }
            if item.attempt >= self.max_attempts {
                let reason = format!("retries exhausted: {}", outcome.message);
                self.dead_letters.push(item.clone(), reason.clone());
                break (OrderState::Failed, reason);
            }

            tracing::warn!(
                attempt = item.attempt,
                reason = %outcome.message,
                "dependency unavailable, re-running order"
            );
            if !self.order_retry.backoff(&self.cancel, item.attempt).await {
                break (
                    OrderState::Cancelled,
                    "cancelled while waiting to retry".to_string(),
                );
            }
        };

        if let Err(e) = self.tracker.transition(order_id, state, message).await {
            tracing::error!(error = %e, "failed to record final state");
        }

        metrics::histogram!("order_processing_seconds", "state" => state.as_str())
            .record(started.elapsed().as_secs_f64());
        match state {
            OrderState::Completed => metrics::counter!("orders_completed_total").increment(1),
            OrderState::Failed => metrics::counter!("orders_failed_total").increment(1),
            OrderState::RequiresManualReview => {
                metrics::counter!("orders_manual_review_total").increment(1)
            }
            OrderState::Cancelled => metrics::counter!("orders_cancelled_total").increment(1),
            OrderState::Pending | OrderState::Processing => {}
        }
    }

    fn record(&self, outcome: &ProcessingOutcome) {
        let board = self.tracker.board();
        if let Some(record) = &outcome.compensation {
            if let Err(e) = board.record_compensation(outcome.order_id, record.clone()) {
                tracing::warn!(error = %e, "failed to record compensation");
            }
        }
        if let Some(retry_id) = outcome.notification_retry {
            if let Err(e) = board.record_notification_retry(outcome.order_id, retry_id) {
                tracing::warn!(error = %e, "failed to record notification retry");
            }
        }
    }
}
