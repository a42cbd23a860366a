//! Open/close protocol for scopes
//!
//! [`ScopeLifecycleFacade`] maps host-owned scope identities to
//! [`Configuration`]s, retires them on close and asks the combinatorial
//! engine whether the execution that just finished must be repeated.

use crate::config::RepeatConfig;
use crate::configuration::Configuration;
use crate::context;
use crate::counter::{RepeatCounter, RepeatSummary};
use crate::engine::{CombinatorialEngine, SessionId};
use crate::error::{MaxRepeatCount, RetirementFailure, ScopeError};
use crate::registry::WeakIdentityRegistry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TREE: AtomicU64 = AtomicU64::new(1);

/// Scope lifecycle manager
///
/// # Concurrency
/// Scopes may be opened and closed from any thread. Creation of a
/// configuration for a given identity happens under a dedicated lock so
/// concurrent opens never create two configurations for one scope.
pub struct ScopeLifecycleFacade {
    tree: u64,
    root: Arc<Configuration>,
    opened: AtomicU64,
    scopes: WeakIdentityRegistry<Arc<Configuration>>,
    creation_lock: Mutex<()>,
    counters: DashMap<SessionId, RepeatCounter>,
    pending_repeats: WeakIdentityRegistry<SessionId>,
    engine: Arc<dyn CombinatorialEngine>,
}

impl ScopeLifecycleFacade {
    /// Create facade with default settings
    #[must_use]
    pub fn new(engine: Arc<dyn CombinatorialEngine>) -> Self {
        Self::build(engine, &RepeatConfig::default())
    }

    /// Create facade whose root carries `config`
    ///
    /// # Errors
    /// Returns `ScopeError::InvalidSetting` if `config` does not validate.
    pub fn with_config(
        engine: Arc<dyn CombinatorialEngine>,
        config: &RepeatConfig,
    ) -> Result<Self, ScopeError> {
        config.validate()?;
        Ok(Self::build(engine, config))
    }

    fn build(engine: Arc<dyn CombinatorialEngine>, config: &RepeatConfig) -> Self {
        let tree = NEXT_TREE.fetch_add(1, Ordering::Relaxed);
        Self {
            tree,
            root: Arc::new(Configuration::root(tree, config)),
            opened: AtomicU64::new(0),
            scopes: WeakIdentityRegistry::new(),
            creation_lock: Mutex::new(()),
            counters: DashMap::new(),
            pending_repeats: WeakIdentityRegistry::new(),
            engine,
        }
    }

    /// Root configuration of this tree
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Arc<Configuration> {
        &self.root
    }

    /// Combinatorial engine consulted on close
    #[inline]
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn CombinatorialEngine> {
        &self.engine
    }

    /// Innermost live configuration of the calling thread
    ///
    /// Falls back to the root when nothing of this tree is installed.
    #[must_use]
    pub fn current_configuration(&self) -> Arc<Configuration> {
        let mut candidate = context::installed_configuration().filter(|config| config.tree() == self.tree);
        while let Some(config) = candidate {
            if !config.is_retired() {
                return config;
            }
            candidate = config.parent().cloned();
        }
        Arc::clone(&self.root)
    }

    /// Configuration opened for `scope`, if any
    #[must_use]
    pub fn configuration<K: ?Sized>(&self, scope: &Arc<K>) -> Option<Arc<Configuration>> {
        self.scopes.get(scope)
    }

    /// Open the scope of `scope`, returning whether it was newly created
    ///
    /// The configuration becomes the calling thread's current one. On
    /// creation, a repeat handed over for this scope is pulled forward and
    /// the parent's display fragments are carried into the new scope.
    pub fn open_scope<K>(&self, scope: &Arc<K>) -> bool
    where
        K: ?Sized + Send + Sync + 'static,
    {
        let (config, created) = {
            let _creation = self.creation_lock.lock();
            match self.scopes.get(scope) {
                Some(existing) => (existing, false),
                None => {
                    let parent = self.current_configuration();
                    let label = format!("scope-{}", self.opened.fetch_add(1, Ordering::Relaxed) + 1);
                    let config = Arc::new(Configuration::child_of(parent, label));
                    self.scopes.put(scope, Arc::clone(&config));
                    (config, true)
                }
            }
        };

        context::install(Some(Arc::clone(&config)));

        if created {
            if let Some(session) = self.pending_repeats.remove(scope) {
                tracing::debug!(scope = %config.label(), %session, "continuing combination session");
                config.force_session(session);
                self.engine.start_new_combination(session);
            }
            if let Some(parent) = config.parent() {
                let fragments = parent.display_fragments();
                if !fragments.is_empty() {
                    config.seed_display(fragments);
                }
            }
            tracing::debug!(scope = %config.label(), "opened scope");
        }
        created
    }

    /// Close the scope of `scope`
    ///
    /// Returns `Ok(true)` when no repetition is pending and `Ok(false)` when
    /// the execution must be repeated. Closing an unknown or already closed
    /// scope returns `Ok(true)` without side effects. An execution whose
    /// scope fails to retire counts as failed.
    ///
    /// # Errors
    /// Returns `MaxRepeatCount` when the session must stop: a configured
    /// maximum was reached or the engine reported an inconsistency.
    pub fn close_scope<K: ?Sized>(&self, scope: &Arc<K>, succeeded: bool) -> Result<bool, MaxRepeatCount> {
        let Some(config) = self.scopes.get(scope) else {
            return Ok(true);
        };
        context::leave(&config);

        if !config.retire("close_scope") {
            tracing::debug!(scope = %config.label(), "scope already closed");
            return Ok(true);
        }
        let succeeded = succeeded && config.retirement_failures().is_empty();

        let Some(session) = config.session() else {
            return Ok(true);
        };

        let counter = {
            let mut counter = self.counters.entry(session).or_default();
            counter.record(succeeded);
            counter.clone()
        };

        if config.is_non_repeatable() {
            self.finish_session(&config, session, &counter);
            return Ok(true);
        }

        match self.engine.has_pending_combination(session, succeeded) {
            Err(inconsistency) => {
                tracing::warn!(scope = %config.label(), %session, %inconsistency, "stopping repetition");
                self.stop_session(&config, session, &counter);
                Err(MaxRepeatCount::inconsistent(&counter, inconsistency))
            }
            Ok(false) => {
                self.finish_session(&config, session, &counter);
                Ok(true)
            }
            Ok(true) => {
                if config
                    .max_total_count()
                    .is_some_and(|max| counter.total_count() >= max)
                {
                    self.stop_session(&config, session, &counter);
                    return Err(MaxRepeatCount::total(&counter));
                }
                if config
                    .max_failure_count()
                    .is_some_and(|max| counter.failure_count() >= max)
                {
                    self.stop_session(&config, session, &counter);
                    return Err(MaxRepeatCount::failures(&counter));
                }
                tracing::debug!(
                    scope = %config.label(),
                    %session,
                    total = counter.total_count(),
                    "repetition pending"
                );
                config.set_pending_repeat(session);
                Ok(false)
            }
        }
    }

    fn finish_session(&self, config: &Configuration, session: SessionId, counter: &RepeatCounter) {
        self.counters.remove(&session);
        config.set_summary(counter.summary());
        tracing::debug!(
            scope = %config.label(),
            %session,
            total = counter.total_count(),
            failures = counter.failure_count(),
            "combination session finished"
        );
    }

    fn stop_session(&self, config: &Configuration, session: SessionId, counter: &RepeatCounter) {
        self.finish_session(config, session, counter);
        self.engine.mark_non_repeatable(session);
    }

    /// Move the repeat pending on `from` so `to` continues its session
    ///
    /// Returns `false` if `from` has nothing pending.
    pub fn hand_over_repeat<F, T>(&self, from: &Arc<F>, to: &Arc<T>) -> bool
    where
        F: ?Sized,
        T: ?Sized + Send + Sync + 'static,
    {
        let Some(session) = self
            .scopes
            .get(from)
            .and_then(|config| config.take_pending_repeat())
        else {
            return false;
        };
        self.pending_repeats.put(to, session);
        true
    }

    /// Drop a repeat handed over to `scope` that will never open
    ///
    /// The session's counter is discarded and the engine is told it ended.
    /// Returns the abandoned session, if one was pending.
    pub fn abandon_repeat<K: ?Sized>(&self, scope: &Arc<K>) -> Option<SessionId> {
        let session = self.pending_repeats.remove(scope)?;
        self.counters.remove(&session);
        self.engine.mark_non_repeatable(session);
        tracing::debug!(%session, "abandoned pending repetition");
        Some(session)
    }

    /// Sessions with a repetition still pending
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.counters.len()
    }

    /// Forbid repetition of whatever session runs in `scope`
    pub fn mark_non_repeatable<K: ?Sized>(&self, scope: &Arc<K>) {
        let Some(config) = self.scopes.get(scope) else {
            return;
        };
        if let Some(session) = config.set_non_repeatable() {
            tracing::debug!(scope = %config.label(), %session, "session marked non-repeatable");
            self.engine.mark_non_repeatable(session);
        }
    }

    /// Rendered display appendix of an open or just closed scope
    #[must_use]
    pub fn resolve_display_appendix<K: ?Sized>(&self, scope: &Arc<K>) -> Option<String> {
        self.scopes.get(scope)?.display_appendix()
    }

    /// Terminal summary of the session that ended in `scope`
    #[must_use]
    pub fn repeat_summary<K: ?Sized>(&self, scope: &Arc<K>) -> Option<RepeatSummary> {
        self.scopes.get(scope)?.summary()
    }

    /// Retirement failures collected while closing `scope`
    #[must_use]
    pub fn retirement_failures<K: ?Sized>(&self, scope: &Arc<K>) -> Vec<RetirementFailure> {
        self.scopes
            .get(scope)
            .map(|config| config.retirement_failures())
            .unwrap_or_default()
    }

    /// Retire every open scope and forget all sessions
    pub fn reset(&self) {
        let _creation = self.creation_lock.lock();
        for config in self.scopes.values() {
            config.retire("reset");
        }
        self.scopes.clear();
        self.pending_repeats.clear();
        self.counters.clear();
        context::clear_tree(self.tree);
        tracing::debug!("scope tree reset");
    }
}

impl fmt::Debug for ScopeLifecycleFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeLifecycleFacade")
            .field("tree", &self.tree)
            .field("scopes", &self.scopes)
            .field("sessions", &self.counters.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NoCombinations;

    #[test]
    fn open_installs_current() {
        let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
        let scope = Arc::new("class");

        assert!(facade.open_scope(&scope));
        let config = facade.configuration(&scope).unwrap();
        assert!(Arc::ptr_eq(&facade.current_configuration(), &config));

        assert_eq!(facade.close_scope(&scope, true), Ok(true));
        assert!(Arc::ptr_eq(&facade.current_configuration(), facade.root()));
    }

    #[test]
    fn nested_scope_parent_is_current() {
        let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
        let outer = Arc::new(1_u8);
        let inner = Arc::new(2_u8);

        facade.open_scope(&outer);
        facade.open_scope(&inner);
        let outer_config = facade.configuration(&outer).unwrap();
        let inner_config = facade.configuration(&inner).unwrap();
        assert!(Arc::ptr_eq(inner_config.parent().unwrap(), &outer_config));

        facade.close_scope(&inner, true).unwrap();
        assert!(Arc::ptr_eq(&facade.current_configuration(), &outer_config));
        facade.close_scope(&outer, true).unwrap();
    }

    #[test]
    fn display_fragments_carried_into_child() {
        let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
        let outer = Arc::new(());
        let inner = Arc::new(());

        facade.open_scope(&outer);
        facade.current_configuration().append_display("x=1").unwrap();
        facade.open_scope(&inner);
        facade.current_configuration().append_display("y=2").unwrap();

        assert_eq!(facade.resolve_display_appendix(&inner).as_deref(), Some(" [x=1, y=2]"));
        assert_eq!(facade.resolve_display_appendix(&outer).as_deref(), Some(" [x=1]"));
        facade.reset();
    }

    #[test]
    fn unknown_scope_close_is_done() {
        let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
        assert_eq!(facade.close_scope(&Arc::new(()), false), Ok(true));
    }

    #[test]
    fn invalid_config_rejected() {
        let config = RepeatConfig::new().with_max_total_count(0);
        assert!(ScopeLifecycleFacade::with_config(Arc::new(NoCombinations), &config).is_err());
    }

    #[test]
    fn reset_retires_everything() {
        let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
        let scope = Arc::new(());
        facade.open_scope(&scope);
        let config = facade.configuration(&scope).unwrap();

        facade.reset();
        assert!(config.is_retired());
        assert_eq!(config.retired_by().as_deref(), Some("reset"));
        assert!(facade.configuration(&scope).is_none());
    }
}
