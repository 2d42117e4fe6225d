//! Publishing order state changes to external subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::OrderId;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::board::{OrderStatusBoard, OrderStatusEvent};
use crate::error::{HubError, StatusError};
use crate::state::OrderState;

/// Emits order state transitions.
///
/// Called right after each transition by the task that owns the order, so
/// events for one order arrive in causal order. Nothing is guaranteed
/// across different orders.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Publishes one state change.
    async fn publish(&self, event: OrderStatusEvent);
}

/// The external subscriber collaborator (socket push, event stream, bus...).
#[async_trait]
pub trait StatusHub: Send + Sync {
    /// Broadcasts one order event to everyone watching that order.
    async fn publish_order_event(&self, event: &OrderStatusEvent) -> Result<(), HubError>;
}

/// Delivers events to a [`StatusHub`] at least once.
///
/// A failed delivery is retried up to `max_deliveries` times with a linear
/// backoff; a subscriber may therefore see the same `sequence` twice.
pub struct HubStatusPublisher<H> {
    hub: Arc<H>,
    max_deliveries: u32,
    redelivery_delay: Duration,
}

impl<H: StatusHub> HubStatusPublisher<H> {
    /// Creates a publisher with 3 deliveries and a 50ms redelivery delay.
    pub fn new(hub: Arc<H>) -> Self {
        Self {
            hub,
            max_deliveries: 3,
            redelivery_delay: Duration::from_millis(50),
        }
    }

    /// Overrides the delivery bound and base delay.
    pub fn with_redelivery(mut self, max_deliveries: u32, redelivery_delay: Duration) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self.redelivery_delay = redelivery_delay;
        self
    }
}

#[async_trait]
impl<H: StatusHub + 'static> StatusPublisher for HubStatusPublisher<H> {
    async fn publish(&self, event: OrderStatusEvent) {
        for delivery in 1..=self.max_deliveries {
            match self.hub.publish_order_event(&event).await {
                Ok(()) => {
                    metrics::counter!("status_events_published_total").increment(1);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        order_id = %event.order_id,
                        state = %event.state,
                        delivery,
                        error = %e,
                        "status event delivery failed"
                    );
                    if delivery < self.max_deliveries {
                        tokio::time::sleep(self.redelivery_delay * delivery).await;
                    }
                }
            }
        }

        metrics::counter!("status_events_undeliverable_total").increment(1);
        tracing::error!(
            order_id = %event.order_id,
            state = %event.state,
            sequence = event.sequence,
            "status event undeliverable"
        );
    }
}

/// Couples the status board with a publisher: every transition is
/// recorded first and then published.
#[derive(Clone)]
pub struct StatusTracker {
    board: Arc<OrderStatusBoard>,
    publisher: Arc<dyn StatusPublisher>,
}

impl StatusTracker {
    /// Creates a tracker.
    pub fn new(board: Arc<OrderStatusBoard>, publisher: Arc<dyn StatusPublisher>) -> Self {
        Self { board, publisher }
    }

    /// Returns the underlying board.
    pub fn board(&self) -> &Arc<OrderStatusBoard> {
        &self.board
    }

    /// Registers the order as `Pending` and publishes it if it is new.
    /// Returns false for an order the board already knows.
    pub async fn accept(&self, order_id: OrderId) -> bool {
        match self.board.register(order_id) {
            Some(event) => {
                self.publisher.publish(event).await;
                true
            }
            None => false,
        }
    }

    /// Publishes an event the board already recorded, such as the
    /// `Pending` event returned by [`OrderStatusBoard::register`].
    pub async fn publish(&self, event: OrderStatusEvent) {
        self.publisher.publish(event).await;
    }

    /// Applies a transition and publishes the resulting event.
    pub async fn transition(
        &self,
        order_id: OrderId,
        state: OrderState,
        message: impl Into<String>,
    ) -> Result<(), StatusError> {
        let event = self.board.transition(order_id, state, message)?;
        tracing::info!(%order_id, %state, message = %event.message, "order state changed");
        self.publisher.publish(event).await;
        Ok(())
    }
}

/// In-process hub that keeps every event grouped by order and fans them
/// out to broadcast subscribers.
pub struct InMemoryStatusHub {
    events: RwLock<HashMap<OrderId, Vec<OrderStatusEvent>>>,
    sender: broadcast::Sender<OrderStatusEvent>,
    fail_next: AtomicU32,
}

impl Default for InMemoryStatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStatusHub {
    /// Creates a hub whose broadcast channel buffers 1024 events.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            events: RwLock::new(HashMap::new()),
            sender,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Subscribes to every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<OrderStatusEvent> {
        self.sender.subscribe()
    }

    /// Makes the next `count` deliveries fail.
    pub fn fail_next_deliveries(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Returns every event delivered for `order_id`, in arrival order.
    pub fn events_for(&self, order_id: OrderId) -> Vec<OrderStatusEvent> {
        self.events
            .read()
            .get(&order_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the states delivered for `order_id`, in arrival order.
    pub fn states_for(&self, order_id: OrderId) -> Vec<OrderState> {
        self.events_for(order_id)
            .into_iter()
            .map(|event| event.state)
            .collect()
    }

    /// Returns the total number of delivered events.
    pub fn event_count(&self) -> usize {
        self.events.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl StatusHub for InMemoryStatusHub {
    async fn publish_order_event(&self, event: &OrderStatusEvent) -> Result<(), HubError> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(HubError::Unavailable("simulated outage".to_string()));
        }

        self.events
            .write()
            .entry(event.order_id)
            .or_default()
            .push(event.clone());
        // No subscribers is fine; the grouped log still has the event.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(order_id: OrderId, state: OrderState, sequence: u64) -> OrderStatusEvent {
        OrderStatusEvent {
            order_id,
            state,
            message: state.to_string(),
            timestamp: Utc::now(),
            sequence,
        }
    }

    #[tokio::test]
    async fn test_hub_groups_events_by_order() {
        let hub = InMemoryStatusHub::new();
        let a = OrderId::new();
        let b = OrderId::new();

        hub.publish_order_event(&event(a, OrderState::Pending, 1))
            .await
            .unwrap();
        hub.publish_order_event(&event(b, OrderState::Pending, 1))
            .await
            .unwrap();
        hub.publish_order_event(&event(a, OrderState::Processing, 2))
            .await
            .unwrap();

        assert_eq!(
            hub.states_for(a),
            vec![OrderState::Pending, OrderState::Processing]
        );
        assert_eq!(hub.states_for(b), vec![OrderState::Pending]);
        assert_eq!(hub.event_count(), 3);
    }

    #[tokio::test]
    async fn test_hub_broadcasts_to_subscribers() {
        let hub = InMemoryStatusHub::new();
        let mut rx = hub.subscribe();
        let order_id = OrderId::new();

        hub.publish_order_event(&event(order_id, OrderState::Pending, 1))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.order_id, order_id);
        assert_eq!(received.state, OrderState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_redelivers_after_hub_failure() {
        let hub = Arc::new(InMemoryStatusHub::new());
        hub.fail_next_deliveries(2);
        let publisher = HubStatusPublisher::new(hub.clone());
        let order_id = OrderId::new();

        publisher
            .publish(event(order_id, OrderState::Completed, 3))
            .await;

        assert_eq!(hub.states_for(order_id), vec![OrderState::Completed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_gives_up_after_max_deliveries() {
        let hub = Arc::new(InMemoryStatusHub::new());
        hub.fail_next_deliveries(5);
        let publisher =
            HubStatusPublisher::new(hub.clone()).with_redelivery(2, Duration::from_millis(10));
        let order_id = OrderId::new();

        publisher
            .publish(event(order_id, OrderState::Failed, 3))
            .await;

        assert!(hub.events_for(order_id).is_empty());
        // Two of the five scripted failures were consumed.
        hub.publish_order_event(&event(order_id, OrderState::Failed, 3))
            .await
            .unwrap_err();
    }

    #[tokio::test]
    async fn test_tracker_records_then_publishes() {
        let hub = Arc::new(InMemoryStatusHub::new());
        let board = Arc::new(OrderStatusBoard::new());
        let tracker = StatusTracker::new(board.clone(), Arc::new(HubStatusPublisher::new(hub.clone())));
        let order_id = OrderId::new();

        assert!(tracker.accept(order_id).await);
        assert!(!tracker.accept(order_id).await);
        tracker
            .transition(order_id, OrderState::Processing, "processing started")
            .await
            .unwrap();

        assert_eq!(board.state(order_id), Some(OrderState::Processing));
        let events = hub.events_for(order_id);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].sequence, 2);

        let err = tracker
            .transition(order_id, OrderState::Pending, "rewind")
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::InvalidTransition { .. }));
        assert_eq!(hub.events_for(order_id).len(), 2);
    }
}
