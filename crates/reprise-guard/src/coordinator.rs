//! Entry point for host adapters
//!
//! A [`RepeatCoordinator`] owns the scope facade and the guard registry. Host
//! adapters pass every node through [`RepeatCoordinator::intercept`] before
//! running it and report events through [`RepeatCoordinator::listener`].

use crate::error::GuardResult;
use crate::guard::ExecutionGuard;
use crate::host::{EngineListener, RepetitionRole, TaskNode};
use crate::listener::RepeatingListener;
use parking_lot::Mutex;
use reprise_scope::{CombinatorialEngine, RepeatConfig, ScopeLifecycleFacade, WeakIdentityRegistry};
use std::fmt;
use std::sync::{Arc, Weak};

/// Guards by wrapped host node
///
/// Creation happens under its own lock, distinct from scope creation.
#[derive(Default)]
pub(crate) struct GuardRegistry {
    guards: WeakIdentityRegistry<Weak<ExecutionGuard>>,
    creation_lock: Mutex<()>,
}

impl GuardRegistry {
    /// Live, unclosed guard wrapping `node`
    pub(crate) fn lookup(&self, node: &Arc<dyn TaskNode>) -> Option<Arc<ExecutionGuard>> {
        self.guards
            .get(node)?
            .upgrade()
            .filter(|guard| !guard.is_closed())
    }

    fn active(&self) -> usize {
        self.guards
            .values()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|guard| !guard.is_closed())
            .count()
    }
}

/// Coordinates repetition between a host engine and a combinatorial engine
pub struct RepeatCoordinator {
    facade: Arc<ScopeLifecycleFacade>,
    registry: Arc<GuardRegistry>,
}

impl RepeatCoordinator {
    /// Create with default settings
    #[must_use]
    pub fn new(engine: Arc<dyn CombinatorialEngine>) -> Self {
        Self::from_facade(Arc::new(ScopeLifecycleFacade::new(engine)))
    }

    /// Create with root settings from `config`
    ///
    /// # Errors
    /// Returns `GuardError::Scope` if `config` does not validate.
    pub fn with_config(engine: Arc<dyn CombinatorialEngine>, config: &RepeatConfig) -> GuardResult<Self> {
        Ok(Self::from_facade(Arc::new(ScopeLifecycleFacade::with_config(engine, config)?)))
    }

    /// Create around an existing facade
    #[must_use]
    pub fn from_facade(facade: Arc<ScopeLifecycleFacade>) -> Self {
        Self {
            facade,
            registry: Arc::new(GuardRegistry::default()),
        }
    }

    /// Scope facade
    #[inline]
    #[must_use]
    pub fn facade(&self) -> &Arc<ScopeLifecycleFacade> {
        &self.facade
    }

    /// Node the host should run in place of `node`
    ///
    /// Repeatable nodes come back wrapped in their guard; a node is wrapped
    /// at most once while its guard is live. A repeatable node running below
    /// a guard gets a nested guard of its own. Guards come back unchanged.
    pub fn intercept(&self, node: Arc<dyn TaskNode>) -> Arc<dyn TaskNode> {
        if matches!(node.repetition_role(), RepetitionRole::Guard(_)) || !node.is_repeatable() {
            return node;
        }
        let enclosing = match node.repetition_role() {
            RepetitionRole::Descendant(guard) => Some(guard),
            _ => None,
        };

        let _creation = self.registry.creation_lock.lock();
        if let Some(existing) = self.registry.lookup(&node) {
            return existing;
        }
        let nested = enclosing.is_some();
        let guard = ExecutionGuard::root(
            Arc::clone(&node),
            Arc::clone(&self.facade),
            Arc::clone(&self.registry),
            enclosing,
        );
        self.registry.guards.put(&node, Arc::downgrade(&guard));
        tracing::debug!(node = %node.unique_id(), nested, "guarding repeatable node");
        guard
    }

    /// Live guard wrapping `node`
    #[must_use]
    pub fn guard_for(&self, node: &Arc<dyn TaskNode>) -> Option<Arc<ExecutionGuard>> {
        self.registry.lookup(node)
    }

    /// Number of guards that have not finished
    #[must_use]
    pub fn active_guards(&self) -> usize {
        self.registry.active()
    }

    /// Proxy to hand the host in place of `real`
    #[must_use]
    pub fn listener(&self, real: Arc<dyn EngineListener>) -> Arc<RepeatingListener> {
        Arc::new(RepeatingListener::new(Arc::clone(&self.facade), real))
    }
}

impl fmt::Debug for RepeatCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatCoordinator")
            .field("facade", &self.facade)
            .field("active_guards", &self.active_guards())
            .finish()
    }
}
