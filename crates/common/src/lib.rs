//! Shared identifiers and value objects used across the fulfillment crates.

pub mod types;

pub use types::{CustomerId, LineItem, Money, OrderId, ProductId};
