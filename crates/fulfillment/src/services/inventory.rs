//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{LineItem, OrderId, ProductId};
use parking_lot::RwLock;
use resilience::StepResult;
use serde::{Deserialize, Serialize};

use super::{OperationScript, ScriptedFailure, play};

/// A confirmed stock reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
    /// The reserved items.
    pub items: Vec<LineItem>,
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for the order's items.
    async fn reserve_items(&self, order_id: OrderId, items: Vec<LineItem>)
    -> StepResult<Reservation>;

    /// Releases the order's reservation, if any.
    async fn release_items(&self, order_id: OrderId) -> StepResult<()>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<OrderId, Reservation>,
    /// `None` means unlimited stock.
    stock: Option<HashMap<ProductId, u32>>,
    next_id: u32,
    reserve: OperationScript,
    release: OperationScript,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a service with unlimited stock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a service that only holds the listed stock levels.
    /// Unlisted products have no stock.
    pub fn with_stock(stock: impl IntoIterator<Item = (ProductId, u32)>) -> Self {
        let service = Self::default();
        service.state.write().stock = Some(stock.into_iter().collect());
        service
    }

    /// Makes the next reservation fail with `failure`.
    pub fn fail_next_reserve(&self, failure: ScriptedFailure) {
        self.state.write().reserve.queued.push_back(failure);
    }

    /// Makes every reservation fail with `failure` until cleared.
    pub fn fail_reserves(&self, failure: ScriptedFailure) {
        self.state.write().reserve.persistent = Some(failure);
    }

    /// Makes every release fail with `failure` until cleared.
    pub fn fail_releases(&self, failure: ScriptedFailure) {
        self.state.write().release.persistent = Some(failure);
    }

    /// Removes all scripted failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.write();
        state.reserve.clear();
        state.release.clear();
    }

    /// Delays every reservation by `latency`.
    pub fn set_reserve_latency(&self, latency: Duration) {
        self.state.write().reserve.latency = latency;
    }

    /// Returns the number of `reserve_items` calls made.
    pub fn reserve_calls(&self) -> u32 {
        self.state.read().reserve.calls
    }

    /// Returns the number of `release_items` calls made.
    pub fn release_calls(&self) -> u32 {
        self.state.read().release.calls
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.state.read().reservations.len()
    }

    /// Returns true if the order holds a reservation.
    pub fn has_reservation(&self, order_id: OrderId) -> bool {
        self.state.read().reservations.contains_key(&order_id)
    }

    /// Returns the remaining stock for a product, or `None` with unlimited stock.
    pub fn available(&self, product_id: &ProductId) -> Option<u32> {
        self.state
            .read()
            .stock
            .as_ref()
            .map(|stock| stock.get(product_id).copied().unwrap_or(0))
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve_items(
        &self,
        order_id: OrderId,
        items: Vec<LineItem>,
    ) -> StepResult<Reservation> {
        let (latency, failure) = self.state.write().reserve.begin_call();
        if let Some(result) = play(latency, failure).await {
            return result;
        }

        let mut state = self.state.write();
        if let Some(existing) = state.reservations.get(&order_id) {
            return StepResult::Success(existing.clone());
        }

        if let Some(stock) = state.stock.as_mut() {
            let short = items.iter().find(|item| {
                stock.get(&item.product_id).copied().unwrap_or(0) < item.quantity
            });
            if let Some(item) = short {
                return StepResult::permanent(format!("InsufficientStock: {}", item.product_id));
            }
            for item in &items {
                if let Some(level) = stock.get_mut(&item.product_id) {
                    *level -= item.quantity;
                }
            }
        }

        state.next_id += 1;
        let reservation = Reservation {
            reservation_id: format!("RES-{:04}", state.next_id),
            items,
        };
        state.reservations.insert(order_id, reservation.clone());
        StepResult::Success(reservation)
    }

    async fn release_items(&self, order_id: OrderId) -> StepResult<()> {
        let (latency, failure) = self.state.write().release.begin_call();
        if let Some(result) = play(latency, failure).await {
            return result;
        }

        let mut state = self.state.write();
        let InMemoryInventoryState {
            reservations,
            stock,
            ..
        } = &mut *state;
        if let Some(reservation) = reservations.remove(&order_id) {
            if let Some(stock) = stock.as_mut() {
                for item in reservation.items {
                    *stock.entry(item.product_id).or_insert(0) += item.quantity;
                }
            }
        }
        StepResult::Success(())
    }
}
