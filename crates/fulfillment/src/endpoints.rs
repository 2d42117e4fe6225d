//! Circuit breaker keys for the fulfillment collaborators.

/// Endpoint key: payment gateway.
pub const ENDPOINT_PAYMENT: &str = "payment";

/// Endpoint key: inventory service.
pub const ENDPOINT_INVENTORY: &str = "inventory";

/// Endpoint key: notification service.
pub const ENDPOINT_NOTIFICATION: &str = "notification";

/// Every endpoint the orchestrator calls.
pub const ALL_ENDPOINTS: [&str; 3] = [ENDPOINT_PAYMENT, ENDPOINT_INVENTORY, ENDPOINT_NOTIFICATION];
