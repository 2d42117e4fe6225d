//! Order state machine.

use serde::{Deserialize, Serialize};

/// The state of an order in the fulfillment pipeline.
///
/// State transitions:
/// ```text
/// Pending ──► Processing ──┬──► Completed
///    │                     ├──► Failed
///    │                     ├──► RequiresManualReview
///    └─────────────────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderState {
    /// Accepted onto the queue, not yet picked up by a worker.
    #[default]
    Pending,

    /// A worker is running the fulfillment workflow.
    Processing,

    /// Payment and inventory succeeded (terminal state).
    Completed,

    /// A critical step failed and nothing is left to undo (terminal state).
    Failed,

    /// A compensating action failed; an operator must intervene (terminal state).
    RequiresManualReview,

    /// Processing was abandoned because of shutdown (terminal state).
    Cancelled,
}

impl OrderState {
    /// Returns true if a worker may start processing from this state.
    pub fn can_start_processing(&self) -> bool {
        matches!(self, OrderState::Pending)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        match (self, next) {
            (OrderState::Pending, OrderState::Processing | OrderState::Cancelled) => true,
            (
                OrderState::Processing,
                OrderState::Completed
                | OrderState::Failed
                | OrderState::RequiresManualReview
                | OrderState::Cancelled,
            ) => true,
            _ => false,
        }
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Completed
                | OrderState::Failed
                | OrderState::RequiresManualReview
                | OrderState::Cancelled
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "Pending",
            OrderState::Processing => "Processing",
            OrderState::Completed => "Completed",
            OrderState::Failed => "Failed",
            OrderState::RequiresManualReview => "RequiresManualReview",
            OrderState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderState; 6] = [
        OrderState::Pending,
        OrderState::Processing,
        OrderState::Completed,
        OrderState::Failed,
        OrderState::RequiresManualReview,
        OrderState::Cancelled,
    ];

    #[test]
    fn test_default_state_is_pending() {
        assert_eq!(OrderState::default(), OrderState::Pending);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderState::Pending.is_terminal());
        assert!(!OrderState::Processing.is_terminal());
        assert!(OrderState::Completed.is_terminal());
        assert!(OrderState::Failed.is_terminal());
        assert!(OrderState::RequiresManualReview.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
    }

    #[test]
    fn test_pending_transitions() {
        assert!(OrderState::Pending.can_start_processing());
        assert!(OrderState::Pending.can_transition_to(OrderState::Processing));
        assert!(OrderState::Pending.can_transition_to(OrderState::Cancelled));
        assert!(!OrderState::Pending.can_transition_to(OrderState::Completed));
        assert!(!OrderState::Pending.can_transition_to(OrderState::Failed));
    }

    #[test]
    fn test_processing_reaches_every_terminal_state() {
        for next in ALL.iter().filter(|s| s.is_terminal()) {
            assert!(OrderState::Processing.can_transition_to(*next), "{next}");
        }
        assert!(!OrderState::Processing.can_transition_to(OrderState::Pending));
        assert!(!OrderState::Processing.can_start_processing());
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(OrderState::Pending.to_string(), "Pending");
        assert_eq!(
            OrderState::RequiresManualReview.to_string(),
            "RequiresManualReview"
        );
    }

    #[test]
    fn test_serialization() {
        let state = OrderState::RequiresManualReview;
        let json = serde_json::to_string(&state).unwrap();
        let deserialized: OrderState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, deserialized);
    }
}
