//! Bounded FIFO of pending orders with backpressure.

use std::collections::VecDeque;
use std::pin::pin;

use common::OrderId;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::OverflowPolicy;
use crate::error::QueueError;
use crate::work_item::{OrderPayload, WorkItem};

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer work queue.
///
/// The buffer never holds more than `capacity` items. When full, producers
/// either get [`QueueError::QueueFull`] or wait for a consumer to make room,
/// depending on the [`OverflowPolicy`]. Closing the queue rejects new items
/// but still hands out the ones already buffered.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
}

impl WorkQueue {
    /// Creates an empty queue. A zero capacity is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Returns the maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Returns the number of buffered items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Enqueues a new order, honoring the overflow policy.
    pub async fn enqueue(&self, order_id: OrderId, payload: OrderPayload) -> Result<(), QueueError> {
        self.enqueue_item(WorkItem::new(order_id, payload)).await
    }

    /// Enqueues an existing item, honoring the overflow policy.
    pub async fn enqueue_item(&self, mut item: WorkItem) -> Result<(), QueueError> {
        loop {
            match self.try_enqueue(item) {
                Ok(()) => return Ok(()),
                Err((QueueError::QueueFull { .. }, rejected))
                    if self.policy == OverflowPolicy::Wait =>
                {
                    item = rejected;
                    self.wait_for_space().await;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    /// Enqueues without waiting; on failure the item is handed back.
    pub fn try_enqueue(&self, item: WorkItem) -> Result<(), (QueueError, WorkItem)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err((QueueError::QueueClosed, item));
        }
        if state.items.len() >= self.capacity {
            metrics::counter!("orders_rejected_total").increment(1);
            return Err((
                QueueError::QueueFull {
                    capacity: self.capacity,
                },
                item,
            ));
        }
        state.items.push_back(item);
        metrics::gauge!("work_queue_depth").set(state.items.len() as f64);
        drop(state);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Resolves once there is room for at least one item or the queue is closed.
    pub async fn wait_for_space(&self) {
        loop {
            let mut notified = pin!(self.not_full.notified());
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.closed || state.items.len() < self.capacity {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Takes the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let mut notified = pin!(self.not_empty.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    metrics::gauge!("work_queue_depth").set(state.items.len() as f64);
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting new items and wakes every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        tracing::info!("work queue closed");
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Removes and returns every buffered item.
    pub fn drain_remaining(&self) -> Vec<WorkItem> {
        let mut state = self.state.lock();
        let items: Vec<WorkItem> = state.items.drain(..).collect();
        metrics::gauge!("work_queue_depth").set(0.0);
        drop(state);

        self.not_full.notify_waiters();
        items
    }
}
