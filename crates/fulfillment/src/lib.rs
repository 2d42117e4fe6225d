//! Order fulfillment workers.
//!
//! Producers hand orders to an [`OrderIntake`], which places them on a
//! bounded [`WorkQueue`]. A fixed [`WorkerPool`] dequeues them and drives
//! the [`Orchestrator`] for each order:
//!
//! 1. Payment, inventory reservation and the confirmation notification are
//!    launched concurrently, each through retry and a per-endpoint circuit
//!    breaker.
//! 2. Payment and inventory are critical; the notification is best-effort
//!    and re-delivered out of band when it fails.
//! 3. If payment succeeded but inventory did not, the payment is released.
//!    A failed release escalates the order to manual review.
//!
//! Every state transition is recorded on the [`OrderStatusBoard`] and
//! published through a [`StatusPublisher`].

pub mod config;
pub mod dead_letter;
pub mod endpoints;
pub mod error;
pub mod notification_retry;
pub mod orchestrator;
pub mod queue;
pub mod services;
pub mod single_flight;
pub mod state;
pub mod status;
pub mod work_item;
pub mod worker;

pub use config::{FulfillmentConfig, OverflowPolicy};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use error::{ConfigError, HubError, QueueError, StatusError};
pub use notification_retry::{
    NotificationRetrier, NotificationRetryLog, NotificationRetryRecord, NotificationRetryStatus,
    NotificationScheduler,
};
pub use orchestrator::{Collaborators, CompensationRecord, Orchestrator, ProcessingOutcome};
pub use queue::WorkQueue;
pub use services::{
    InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentGateway,
    InventoryService, NotificationService, PaymentGateway, PaymentReceipt, Reservation,
    ScriptedFailure,
};
pub use single_flight::{OrderGuard, OrderLocks};
pub use state::OrderState;
pub use status::{
    HubStatusPublisher, InMemoryStatusHub, OrderStatus, OrderStatusBoard, OrderStatusEvent,
    StatusHub, StatusPublisher, StatusTracker,
};
pub use work_item::{OrderPayload, WorkItem};
pub use worker::{OrderIntake, ShutdownReport, WorkerPool};

pub use resilience::StepResult;
