//! Fulfillment error types.
//!
//! Step-level failures are not errors here: collaborators report them by
//! value through [`resilience::StepResult`]. These types cover the
//! producer-facing queue, the status board, configuration, and the status hub.

use common::OrderId;
use thiserror::Error;

use crate::state::OrderState;

/// Errors returned to producers when enqueueing work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue is at capacity and the overflow policy is `Reject`.
    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The queue no longer accepts items.
    #[error("Queue is closed")]
    QueueClosed,
}

/// Errors raised by the order status board.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    /// No status has been registered for the order.
    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),

    /// The requested transition is not allowed from the current state.
    #[error("Invalid state transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderState,
        to: OrderState,
    },
}

/// Configuration loading and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable was present but could not be parsed.
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// The configuration is internally inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors reported by a status hub delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// The hub could not accept the event right now.
    #[error("Status hub unavailable: {0}")]
    Unavailable(String),
}

/// Convenience type alias for status board results.
pub type Result<T> = std::result::Result<T, StatusError>;
