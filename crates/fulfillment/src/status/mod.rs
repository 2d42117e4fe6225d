//! Order status tracking and publication.

mod board;
mod publisher;

pub use board::{OrderStatus, OrderStatusBoard, OrderStatusEvent};
pub use publisher::{
    HubStatusPublisher, InMemoryStatusHub, StatusHub, StatusPublisher, StatusTracker,
};
