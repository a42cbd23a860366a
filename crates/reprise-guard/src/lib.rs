//! Reprise Guard - transparent repetition of host task nodes
//!
//! Wraps repeatable nodes of a host execution engine in an
//! [`ExecutionGuard`] that runs them once per pending combination, while the
//! host keeps seeing a single node with stable identity, naming and cleanup.
//!
//! # Core Concepts
//!
//! - [`TaskNode`] / [`EngineListener`]: the host protocol
//! - [`RepeatCoordinator`]: intercepts nodes and provides the proxy listener
//! - [`ExecutionGuard`]: per-execution state machine
//! - [`DeferredNotificationQueue`]: ordered, fire-once listener calls
//! - [`PreservedState`]: node state restored instead of re-running setup
//!
//! # Example
//!
//! ```rust,ignore
//! use reprise_guard::RepeatCoordinator;
//!
//! let coordinator = RepeatCoordinator::with_config(engine, &config)?;
//! let listener = coordinator.listener(real_listener);
//!
//! // host adapter
//! let node = coordinator.intercept(node);
//! listener.started(&node);
//! // ... prepare / execute / cleanup ...
//! listener.finished(&node, &outcome);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod cleanup;
mod coordinator;
mod error;
mod guard;
mod host;
mod listener;
mod notification;
mod outcome;
mod preserve;
pub mod state_machine;

#[cfg(test)]
mod testing;

pub use coordinator::RepeatCoordinator;
pub use error::{GuardError, GuardResult, StateMachineError};
pub use guard::ExecutionGuard;
pub use host::{
    AbortExecution, EngineListener, ExecutionContext, ExecutionMode, Failure, NodeId, NoopListener, Outcome,
    RepetitionRole, ReportEntry, SkipDecision, SubExecutionLauncher, TaskNode,
};
pub use listener::RepeatingListener;
pub use notification::{DeferredNotificationQueue, Notification};
pub use outcome::{merge_executions, with_internal_failures};
pub use preserve::{FieldKind, FieldSnapshot, PreservedState, RestoreReport, RestoreSkip, Snapshottable};
pub use state_machine::GuardState;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
