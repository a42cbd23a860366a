//! Guard lifecycle
//!
//! `Fresh -> Started -> Finished { pending } -> [Repeating] -> Closed`.
//! A repeated execution is a new sibling guard starting at `Fresh`.

use crate::error::StateMachineError;

/// Lifecycle state of one guarded execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardState {
    /// Created, not started
    Fresh,
    /// Start notifications queued
    Started,
    /// Scope closed
    Finished {
        /// Another execution is required
        pending: bool,
    },
    /// A sibling took over the pending execution
    Repeating,
    /// Terminal cleanup done
    Closed,
}

impl GuardState {
    /// Every state, for exhaustive checks
    pub const ALL: [GuardState; 6] = [
        GuardState::Fresh,
        GuardState::Started,
        GuardState::Finished { pending: false },
        GuardState::Finished { pending: true },
        GuardState::Repeating,
        GuardState::Closed,
    ];

    /// Check if no transition leaves this state
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

/// Validates a state transition
///
/// # Errors
/// Returns `StateMachineError::IllegalTransition` if `to` is not reachable
/// from `from`.
pub fn validate_transition(from: GuardState, to: GuardState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: GuardState) -> Vec<GuardState> {
    use GuardState::*;
    match from {
        Fresh => vec![Started, Closed],
        Started => vec![Finished { pending: false }, Finished { pending: true }],
        Finished { pending: true } => vec![Repeating, Closed],
        Finished { pending: false } | Repeating => vec![Closed],
        Closed => vec![],
    }
}

fn allowed(from: GuardState, to: GuardState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
