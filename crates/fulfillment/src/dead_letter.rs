//! Orders that exhausted their order-level retries.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::work_item::WorkItem;

/// A work item parked for operator attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: WorkItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Append-only store of dead letters.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    entries: RwLock<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `item` with the reason it was given up on.
    pub fn push(&self, item: WorkItem, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(
            order_id = %item.order_id,
            attempt = item.attempt,
            reason = %reason,
            "order dead-lettered"
        );
        metrics::counter!("orders_dead_lettered_total").increment(1);
        self.entries.write().push(DeadLetter {
            item,
            reason,
            failed_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns a copy of every entry, oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::OrderPayload;
    use common::{CustomerId, Money, OrderId};

    #[test]
    fn test_push_keeps_arrival_order() {
        let queue = DeadLetterQueue::new();
        let first = OrderId::new();
        let second = OrderId::new();
        let payload = OrderPayload::new(CustomerId::new(), Money::from_cents(100), vec![]);

        queue.push(WorkItem::new(first, payload.clone()), "circuit open");
        queue.push(WorkItem::new(second, payload), "circuit open");

        let entries = queue.entries();
        assert_eq!(queue.len(), 2);
        assert_eq!(entries[0].item.order_id, first);
        assert_eq!(entries[1].item.order_id, second);
        assert_eq!(entries[0].reason, "circuit open");
    }
}
