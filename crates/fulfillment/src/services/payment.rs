//! Payment gateway trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Money, OrderId};
use parking_lot::RwLock;
use resilience::StepResult;
use serde::{Deserialize, Serialize};

use super::{OperationScript, ScriptedFailure, play};

/// Proof of a captured payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    /// The payment ID assigned by the gateway.
    pub payment_id: String,
    /// The captured amount.
    pub amount: Money,
}

/// Trait for payment operations.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Captures `amount` for the order.
    async fn process_payment(&self, order_id: OrderId, amount: Money)
    -> StepResult<PaymentReceipt>;

    /// Releases (refunds) the order's captured payment.
    async fn release_payment(&self, order_id: OrderId) -> StepResult<()>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<OrderId, PaymentReceipt>,
    released: Vec<OrderId>,
    next_id: u32,
    charge: OperationScript,
    release: OperationScript,
}

/// In-memory payment gateway for testing.
///
/// Charges are idempotent per order: charging an order that already holds
/// a payment returns the existing receipt.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentGateway {
    /// Creates a new in-memory payment gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next charge fail with `failure`. Calls stack up in order.
    pub fn fail_next_charge(&self, failure: ScriptedFailure) {
        self.state.write().charge.queued.push_back(failure);
    }

    /// Makes every charge fail with `failure` until cleared.
    pub fn fail_charges(&self, failure: ScriptedFailure) {
        self.state.write().charge.persistent = Some(failure);
    }

    /// Makes the next release fail with `failure`.
    pub fn fail_next_release(&self, failure: ScriptedFailure) {
        self.state.write().release.queued.push_back(failure);
    }

    /// Makes every release fail with `failure` until cleared.
    pub fn fail_releases(&self, failure: ScriptedFailure) {
        self.state.write().release.persistent = Some(failure);
    }

    /// Removes all scripted failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.write();
        state.charge.clear();
        state.release.clear();
    }

    /// Delays every charge by `latency`.
    pub fn set_charge_latency(&self, latency: Duration) {
        self.state.write().charge.latency = latency;
    }

    /// Returns the number of `process_payment` calls made.
    pub fn charge_calls(&self) -> u32 {
        self.state.read().charge.calls
    }

    /// Returns the number of `release_payment` calls made.
    pub fn release_calls(&self) -> u32 {
        self.state.read().release.calls
    }

    /// Returns the number of payments currently captured.
    pub fn payment_count(&self) -> usize {
        self.state.read().payments.len()
    }

    /// Returns true if the order currently holds a captured payment.
    pub fn is_charged(&self, order_id: OrderId) -> bool {
        self.state.read().payments.contains_key(&order_id)
    }

    /// Returns true if a payment was released for the order.
    pub fn was_released(&self, order_id: OrderId) -> bool {
        self.state.read().released.contains(&order_id)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn process_payment(
        &self,
        order_id: OrderId,
        amount: Money,
    ) -> StepResult<PaymentReceipt> {
        let (latency, failure) = self.state.write().charge.begin_call();
        if let Some(result) = play(latency, failure).await {
            return result;
        }

        if !amount.is_positive() {
            return StepResult::permanent(format!("InvalidAmount: {amount}"));
        }

        let mut state = self.state.write();
        if let Some(existing) = state.payments.get(&order_id) {
            return StepResult::Success(existing.clone());
        }
        state.next_id += 1;
        let receipt = PaymentReceipt {
            payment_id: format!("PAY-{:04}", state.next_id),
            amount,
        };
        state.payments.insert(order_id, receipt.clone());
        StepResult::Success(receipt)
    }

    async fn release_payment(&self, order_id: OrderId) -> StepResult<()> {
        let (latency, failure) = self.state.write().release.begin_call();
        if let Some(result) = play(latency, failure).await {
            return result;
        }

        let mut state = self.state.write();
        if state.payments.remove(&order_id).is_some() {
            state.released.push(order_id);
        }
        StepResult::Success(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_charge_and_release() {
        let gateway = InMemoryPaymentGateway::new();
        let order_id = OrderId::new();

        let receipt = gateway
            .process_payment(order_id, Money::from_cents(5000))
            .await
            .success()
            .unwrap();
        assert!(receipt.payment_id.starts_with("PAY-"));
        assert!(gateway.is_charged(order_id));

        assert!(gateway.release_payment(order_id).await.is_success());
        assert!(!gateway.is_charged(order_id));
        assert!(gateway.was_released(order_id));
        assert_eq!(gateway.charge_calls(), 1);
        assert_eq!(gateway.release_calls(), 1);
    }

    #[tokio::test]
    async fn test_charge_is_idempotent_per_order() {
        let gateway = InMemoryPaymentGateway::new();
        let order_id = OrderId::new();

        let first = gateway
            .process_payment(order_id, Money::from_cents(1000))
            .await;
        let second = gateway
            .process_payment(order_id, Money::from_cents(1000))
            .await;

        assert_eq!(first, second);
        assert_eq!(gateway.payment_count(), 1);
    }

    #[tokio::test]
    async fn test_sequential_payment_ids() {
        let gateway = InMemoryPaymentGateway::new();
        let r1 = gateway
            .process_payment(OrderId::new(), Money::from_cents(1000))
            .await
            .success()
            .unwrap();
        let r2 = gateway
            .process_payment(OrderId::new(), Money::from_cents(1000))
            .await
            .success()
            .unwrap();

        assert_eq!(r1.payment_id, "PAY-0001");
        assert_eq!(r2.payment_id, "PAY-0002");
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let gateway = InMemoryPaymentGateway::new();
        let order_id = OrderId::new();
        gateway.fail_next_charge(ScriptedFailure::transient("gateway timeout"));

        let first = gateway
            .process_payment(order_id, Money::from_cents(1000))
            .await;
        assert_eq!(first, StepResult::transient("gateway timeout"));
        assert!(!gateway.is_charged(order_id));

        gateway.fail_charges(ScriptedFailure::permanent("CardDeclined"));
        let second = gateway
            .process_payment(order_id, Money::from_cents(1000))
            .await;
        assert_eq!(second, StepResult::permanent("CardDeclined"));

        gateway.clear_failures();
        assert!(
            gateway
                .process_payment(order_id, Money::from_cents(1000))
                .await
                .is_success()
        );
    }

    #[tokio::test]
    async fn test_zero_amount_is_rejected() {
        let gateway = InMemoryPaymentGateway::new();
        let result = gateway
            .process_payment(OrderId::new(), Money::zero())
            .await;
        assert!(matches!(result, StepResult::PermanentError(reason) if reason.starts_with("InvalidAmount")));
    }
}
