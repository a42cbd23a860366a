//! Error types for execution guards

use crate::state_machine::GuardState;
use reprise_scope::ScopeError;

/// Errors raised while setting up or driving guards
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Scope layer rejected the request
    #[error("scope error: {0}")]
    Scope(#[from] ScopeError),

    /// Guard lifecycle violated
    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    /// The guard is being dropped and cannot act as a node
    #[error("guard for '{0}' is no longer reachable")]
    Detached(String),
}

/// Guard lifecycle violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not allowed from the current state
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: GuardState,
        /// Requested state
        to: GuardState,
    },
}

/// Guard result type
pub type GuardResult<T> = Result<T, GuardError>;
