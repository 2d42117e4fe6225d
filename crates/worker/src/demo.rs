//! Demo collaborators and a synthetic order source.

use std::sync::Arc;
use std::time::Duration;

use common::{CustomerId, LineItem, Money, OrderId, ProductId};
use fulfillment::{
    Collaborators, InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentGateway,
    OrderIntake, OrderPayload, QueueError,
};
use tokio_util::sync::CancellationToken;

/// Products the demo catalog stocks, with unit prices in cents.
const CATALOG: [(&str, i64); 3] = [("SKU-001", 1999), ("SKU-002", 4500), ("SKU-003", 899)];

/// Units stocked per product; later orders run out and get compensated.
const STOCK_PER_PRODUCT: u32 = 25;

pub type DemoCollaborators =
    Collaborators<InMemoryPaymentGateway, InMemoryInventoryService, InMemoryNotificationService>;

/// Builds in-memory collaborators with a small, finite catalog.
pub fn collaborators() -> DemoCollaborators {
    let inventory = InMemoryInventoryService::with_stock(
        CATALOG
            .iter()
            .map(|(sku, _)| (ProductId::new(*sku), STOCK_PER_PRODUCT)),
    );
    Collaborators::new(
        Arc::new(InMemoryPaymentGateway::new()),
        Arc::new(inventory),
        Arc::new(InMemoryNotificationService::new()),
    )
}

/// Generates a random order against the demo catalog.
pub fn random_order() -> OrderPayload {
    let lines = fastrand::usize(1..=CATALOG.len());
    let mut items = Vec::with_capacity(lines);
    let mut total = Money::zero();
    for (sku, price) in CATALOG.iter().take(lines) {
        let quantity = fastrand::u32(1..=3);
        items.push(LineItem::new(*sku, quantity));
        total = total + Money::from_cents(price * i64::from(quantity));
    }
    OrderPayload::new(CustomerId::new(), total, items)
}

/// Submits `count` random orders, one every `interval`.
///
/// Returns the IDs that were accepted. Stops early on cancellation or
/// once the queue closes; orders rejected for a full queue are skipped.
pub async fn seed_orders(
    intake: OrderIntake,
    count: usize,
    interval: Duration,
    cancel: CancellationToken,
) -> Vec<OrderId> {
    let mut accepted = Vec::with_capacity(count);
    for _ in 0..count {
        let order_id = OrderId::new();
        match intake.enqueue(order_id, random_order()).await {
            Ok(()) => {
                metrics::counter!("demo_orders_submitted_total").increment(1);
                accepted.push(order_id);
            }
            Err(QueueError::QueueFull { capacity }) => {
                tracing::warn!(%order_id, capacity, "demo order dropped, queue full");
            }
            Err(QueueError::QueueClosed) => break,
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    tracing::info!(accepted = accepted.len(), "demo orders submitted");
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_order_totals_match_lines() {
        for _ in 0..20 {
            let order = random_order();
            assert!(!order.items.is_empty());
            let expected: i64 = order
                .items
                .iter()
                .map(|item| {
                    let (_, price) = CATALOG
                        .iter()
                        .find(|(sku, _)| *sku == item.product_id.as_str())
                        .unwrap();
                    price * i64::from(item.quantity)
                })
                .sum();
            assert_eq!(order.amount.cents(), expected);
        }
    }

    #[tokio::test]
    async fn test_collaborators_stock_the_catalog() {
        let collaborators = collaborators();
        for (sku, _) in CATALOG {
            assert_eq!(
                collaborators.inventory.available(&ProductId::new(sku)),
                Some(STOCK_PER_PRODUCT)
            );
        }
    }
}
