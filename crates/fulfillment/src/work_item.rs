//! Units of work carried by the queue.

use chrono::{DateTime, Utc};
use common::{CustomerId, LineItem, Money, OrderId};
use serde::{Deserialize, Serialize};

/// Everything the workflow needs to fulfill an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    /// The customer to charge and notify.
    pub customer_id: CustomerId,
    /// Total to charge.
    pub amount: Money,
    /// Products to reserve.
    pub items: Vec<LineItem>,
}

impl OrderPayload {
    /// Creates a new payload.
    pub fn new(customer_id: CustomerId, amount: Money, items: Vec<LineItem>) -> Self {
        Self {
            customer_id,
            amount,
            items,
        }
    }
}

/// A queued order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub order_id: OrderId,
    pub payload: OrderPayload,
    pub enqueued_at: DateTime<Utc>,
    /// Number of workflow runs started for this item; bumped by the worker.
    pub attempt: u32,
}

impl WorkItem {
    /// Creates a fresh item stamped with the current time.
    pub fn new(order_id: OrderId, payload: OrderPayload) -> Self {
        Self {
            order_id,
            payload,
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }
}
