//! Queryable record of every accepted order's state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::OrderId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StatusError};
use crate::orchestrator::CompensationRecord;
use crate::state::OrderState;

/// One state change, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusEvent {
    pub order_id: OrderId,
    pub state: OrderState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Position of this change in the order's history, starting at 1.
    /// Lets subscribers discard redelivered duplicates.
    pub sequence: u64,
}

/// Current status of an order plus everything that happened to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: OrderId,
    pub state: OrderState,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    /// Workflow runs started so far.
    pub attempts: u32,
    pub history: Vec<OrderStatusEvent>,
    pub compensations: Vec<CompensationRecord>,
    /// Out-of-band confirmation retry scheduled for this order, if any.
    pub notification_retry: Option<u64>,
}

impl OrderStatus {
    fn new(order_id: OrderId, now: DateTime<Utc>) -> Self {
        let event = OrderStatusEvent {
            order_id,
            state: OrderState::Pending,
            message: "order accepted".to_string(),
            timestamp: now,
            sequence: 1,
        };
        Self {
            order_id,
            state: OrderState::Pending,
            message: event.message.clone(),
            updated_at: now,
            attempts: 0,
            history: vec![event],
            compensations: Vec::new(),
            notification_retry: None,
        }
    }
}

/// In-memory state-query interface for orders.
///
/// Workers are the only writers; every write goes through a validated
/// [`OrderState`] transition.
#[derive(Debug, Default)]
pub struct OrderStatusBoard {
    orders: RwLock<HashMap<OrderId, OrderStatus>>,
}

impl OrderStatusBoard {
    /// Creates an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly accepted order as `Pending`.
    ///
    /// Returns the `Pending` event if the order was not known yet, or
    /// `None` if it already has a status (a duplicate submission).
    pub fn register(&self, order_id: OrderId) -> Option<OrderStatusEvent> {
        let mut orders = self.orders.write();
        if orders.contains_key(&order_id) {
            return None;
        }
        let status = OrderStatus::new(order_id, Utc::now());
        let event = status.history[0].clone();
        orders.insert(order_id, status);
        Some(event)
    }

    /// Drops a registration that never made it onto the queue.
    pub fn forget(&self, order_id: OrderId) {
        let mut orders = self.orders.write();
        if let Some(status) = orders.get(&order_id) {
            if status.state == OrderState::Pending && status.history.len() == 1 {
                orders.remove(&order_id);
            }
        }
    }

    /// Applies a state transition and returns the event to publish.
    pub fn transition(
        &self,
        order_id: OrderId,
        next: OrderState,
        message: impl Into<String>,
    ) -> Result<OrderStatusEvent> {
        let mut orders = self.orders.write();
        let status = orders
            .get_mut(&order_id)
            .ok_or(StatusError::UnknownOrder(order_id))?;

        if !status.state.can_transition_to(next) {
            return Err(StatusError::InvalidTransition {
                order_id,
                from: status.state,
                to: next,
            });
        }

        let now = Utc::now();
        let event = OrderStatusEvent {
            order_id,
            state: next,
            message: message.into(),
            timestamp: now,
            sequence: status.history.len() as u64 + 1,
        };
        status.state = next;
        status.message = event.message.clone();
        status.updated_at = now;
        status.history.push(event.clone());
        Ok(event)
    }

    /// Records that a workflow run started.
    pub fn record_attempt(&self, order_id: OrderId, attempt: u32) -> Result<()> {
        self.update(order_id, |status| status.attempts = attempt)
    }

    /// Attaches a compensation record to the order.
    pub fn record_compensation(&self, order_id: OrderId, record: CompensationRecord) -> Result<()> {
        self.update(order_id, |status| status.compensations.push(record))
    }

    /// Links the order to its confirmation retry record.
    pub fn record_notification_retry(&self, order_id: OrderId, retry_id: u64) -> Result<()> {
        self.update(order_id, |status| status.notification_retry = Some(retry_id))
    }

    fn update(&self, order_id: OrderId, f: impl FnOnce(&mut OrderStatus)) -> Result<()> {
        let mut orders = self.orders.write();
        let status = orders
            .get_mut(&order_id)
            .ok_or(StatusError::UnknownOrder(order_id))?;
        f(status);
        Ok(())
    }

    /// Returns a copy of the order's status.
    pub fn get(&self, order_id: OrderId) -> Option<OrderStatus> {
        self.orders.read().get(&order_id).cloned()
    }

    /// Returns the order's current state.
    pub fn state(&self, order_id: OrderId) -> Option<OrderState> {
        self.orders.read().get(&order_id).map(|status| status.state)
    }

    /// Returns the number of orders currently in `state`.
    pub fn count_in(&self, state: OrderState) -> usize {
        self.orders
            .read()
            .values()
            .filter(|status| status.state == state)
            .count()
    }

    /// Returns the IDs of orders currently in `state`.
    pub fn orders_in(&self, state: OrderState) -> Vec<OrderId> {
        self.orders
            .read()
            .values()
            .filter(|status| status.state == state)
            .map(|status| status.order_id)
            .collect()
    }

    /// Returns the number of known orders.
    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    /// Returns true if no order has been registered.
    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_creates_pending_status() {
        let board = OrderStatusBoard::new();
        let order_id = OrderId::new();

        let event = board.register(order_id).unwrap();
        assert_eq!(event.state, OrderState::Pending);
        assert_eq!(event.sequence, 1);
        assert_eq!(board.state(order_id), Some(OrderState::Pending));
        assert!(board.register(order_id).is_none());
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn test_transition_appends_history_with_sequence() {
        let board = OrderStatusBoard::new();
        let order_id = OrderId::new();
        board.register(order_id);

        let processing = board
            .transition(order_id, OrderState::Processing, "processing started")
            .unwrap();
        let completed = board
            .transition(order_id, OrderState::Completed, "order completed")
            .unwrap();

        assert_eq!(processing.sequence, 2);
        assert_eq!(completed.sequence, 3);

        let status = board.get(order_id).unwrap();
        assert_eq!(status.state, OrderState::Completed);
        assert_eq!(status.message, "order completed");
        let states: Vec<OrderState> = status.history.iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                OrderState::Pending,
                OrderState::Processing,
                OrderState::Completed
            ]
        );
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let board = OrderStatusBoard::new();
        let order_id = OrderId::new();
        board.register(order_id);

        let err = board
            .transition(order_id, OrderState::Completed, "skipped processing")
            .unwrap_err();
        assert_eq!(
            err,
            StatusError::InvalidTransition {
                order_id,
                from: OrderState::Pending,
                to: OrderState::Completed,
            }
        );
        assert_eq!(board.state(order_id), Some(OrderState::Pending));
    }

    #[test]
    fn test_unknown_order() {
        let board = OrderStatusBoard::new();
        let order_id = OrderId::new();
        assert_eq!(
            board.transition(order_id, OrderState::Processing, "x"),
            Err(StatusError::UnknownOrder(order_id))
        );
        assert_eq!(
            board.record_attempt(order_id, 1),
            Err(StatusError::UnknownOrder(order_id))
        );
    }

    #[test]
    fn test_forget_only_removes_untouched_pending() {
        let board = OrderStatusBoard::new();
        let fresh = OrderId::new();
        let started = OrderId::new();
        board.register(fresh);
        board.register(started);
        board
            .transition(started, OrderState::Processing, "processing started")
            .unwrap();

        board.forget(fresh);
        board.forget(started);

        assert!(board.get(fresh).is_none());
        assert_eq!(board.state(started), Some(OrderState::Processing));
    }

    #[test]
    fn test_counts_by_state() {
        let board = OrderStatusBoard::new();
        let a = OrderId::new();
        let b = OrderId::new();
        board.register(a);
        board.register(b);
        board.transition(a, OrderState::Cancelled, "shutdown").unwrap();

        assert_eq!(board.count_in(OrderState::Pending), 1);
        assert_eq!(board.count_in(OrderState::Cancelled), 1);
        assert_eq!(board.orders_in(OrderState::Cancelled), vec![a]);
    }
}
