//! Reprise Scope - hierarchical, retiring configuration state
//!
//! Tracks one [`Configuration`] per host-owned scope identity and decides,
//! together with an external [`CombinatorialEngine`], whether the execution
//! that just closed a scope must run again.
//!
//! # Core Concepts
//!
//! - [`WeakIdentityRegistry`]: identity-keyed map that never keeps keys alive
//! - [`Configuration`]: per-scope settings and custom items with retirement
//! - [`ScopeLifecycleFacade`]: open/close protocol and repeat-count limits
//! - [`ContextSnapshot`]: carries the current configuration into worker threads
//!
//! # Example
//!
//! ```rust,ignore
//! use reprise_scope::{ScopeLifecycleFacade, RepeatConfig};
//!
//! let facade = ScopeLifecycleFacade::with_config(engine, &RepeatConfig::new().with_max_total_count(10))?;
//!
//! facade.open_scope(&node);
//! facade.current_configuration().bind_session(session)?;
//! // ... run the node ...
//! let done = facade.close_scope(&node, succeeded)?;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod config;
mod configuration;
mod context;
mod counter;
mod engine;
mod error;
mod facade;
mod registry;

pub use config::{DisplaySeparators, RepeatConfig};
pub use configuration::{panic_message, Configuration, ItemValue, RetirementPlan};
pub use context::{installed_configuration, spawn_inheriting, ContextSnapshot, EnteredContext};
pub use counter::{RepeatCounter, RepeatSummary};
pub use engine::{CombinatorialEngine, NoCombinations, SessionId};
pub use error::{InconsistentCombination, MaxRepeatCount, MaxRepeatKind, RetirementFailure, ScopeError};
pub use facade::ScopeLifecycleFacade;
pub use registry::WeakIdentityRegistry;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
