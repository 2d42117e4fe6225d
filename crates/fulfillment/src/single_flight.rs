//! Per-order mutual exclusion.

use std::collections::HashMap;
use std::sync::Arc;

use common::OrderId;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed async locks guaranteeing that at most one task works on a given
/// order at any instant.
///
/// Entries are created on demand and removed when the last holder or
/// waiter goes away, so the map only ever contains orders in flight.
#[derive(Debug, Default)]
pub struct OrderLocks {
    locks: Mutex<HashMap<OrderId, Arc<AsyncMutex<()>>>>,
}

impl OrderLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no one else holds `order_id`, then takes it.
    pub async fn acquire(&self, order_id: OrderId) -> OrderGuard<'_> {
        let lock = self.locks.lock().entry(order_id).or_default().clone();
        let guard = lock.lock_owned().await;
        OrderGuard {
            locks: self,
            order_id,
            guard: Some(guard),
        }
    }

    /// Returns the number of orders currently held or awaited.
    pub fn in_flight(&self) -> usize {
        self.locks.lock().len()
    }

    /// Returns true if some task holds or awaits `order_id`.
    #[cfg(test)]
    fn is_held(&self, order_id: OrderId) -> bool {
        self.locks.lock().contains_key(&order_id)
    }
}

/// Exclusive claim on one order; released on drop.
#[derive(Debug)]
pub struct OrderGuard<'a> {
    locks: &'a OrderLocks,
    order_id: OrderId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl OrderGuard<'_> {
    /// The order this guard holds.
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.locks.lock();
        if let Some(lock) = locks.get(&self.order_id) {
            // Only the table's own reference left: no holder, no waiter.
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.order_id);
            }
        }
    }
}
