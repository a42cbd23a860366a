//! Hierarchical, retirable configuration
//!
//! A [`Configuration`] holds the settings and custom items of one scope.
//! Lookups that miss locally fall back through the parent chain up to the
//! root of the tree. Retiring a configuration runs each stored item's
//! retirement plan exactly once; afterwards the configuration accepts no
//! further live mutation.

use crate::config::{validate_limit, DisplaySeparators, RepeatConfig};
use crate::counter::RepeatSummary;
use crate::engine::SessionId;
use crate::error::{RetirementFailure, ScopeError};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Type-erased item value
pub type ItemValue = Arc<dyn Any + Send + Sync>;

/// What to do when a stored item retires
pub struct RetirementPlan(Option<Box<dyn FnOnce() -> anyhow::Result<()> + Send>>);

impl RetirementPlan {
    /// Run `action` on retirement
    pub fn new(action: impl FnOnce() -> anyhow::Result<()> + Send + 'static) -> Self {
        Self(Some(Box::new(action)))
    }

    /// Nothing to do on retirement
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    /// Run the plan, converting errors and panics into a message
    fn execute(self) -> Result<(), String> {
        let Some(action) = self.0 else {
            return Ok(());
        };
        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => Err(panic_message(panic.as_ref())),
        }
    }
}

impl Default for RetirementPlan {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RetirementPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "RetirementPlan(..)"
        } else {
            "RetirementPlan(none)"
        })
    }
}

/// Best-effort text of a panic payload
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

struct StoredItem {
    value: ItemValue,
    plan: RetirementPlan,
}

fn same_identity(a: &ItemValue, b: &ItemValue) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

#[derive(Debug, Default, Clone)]
struct Settings {
    max_total_count: Option<u64>,
    max_failure_count: Option<u64>,
    separators: Option<DisplaySeparators>,
}

#[derive(Default)]
struct State {
    items: IndexMap<String, StoredItem>,
    retired_by: Option<String>,
    failures: Vec<RetirementFailure>,
    session: Option<SessionId>,
    display: Vec<String>,
    pending_repeat: Option<SessionId>,
    non_repeatable: bool,
    summary: Option<RepeatSummary>,
}

/// Configuration of one scope
pub struct Configuration {
    tree: u64,
    label: String,
    parent: Option<Arc<Configuration>>,
    settings: RwLock<Settings>,
    state: Mutex<State>,
}

impl Configuration {
    /// Create the root of a scope tree
    pub(crate) fn root(tree: u64, config: &RepeatConfig) -> Self {
        Self {
            tree,
            label: "root".to_string(),
            parent: None,
            settings: RwLock::new(Settings {
                max_total_count: config.max_total_count,
                max_failure_count: config.max_failure_count,
                separators: Some(config.separators.clone()),
            }),
            state: Mutex::new(State::default()),
        }
    }

    /// Create a child below `parent`
    pub(crate) fn child_of(parent: Arc<Configuration>, label: impl Into<String>) -> Self {
        Self {
            tree: parent.tree,
            label: label.into(),
            parent: Some(parent),
            settings: RwLock::new(Settings::default()),
            state: Mutex::new(State::default()),
        }
    }

    pub(crate) fn tree(&self) -> u64 {
        self.tree
    }

    /// Label used in logs
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Parent configuration, `None` at the root
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Configuration>> {
        self.parent.as_ref()
    }

    /// Check if this is the root of its tree
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Iterate from this configuration up to the root
    fn lineage(&self) -> impl Iterator<Item = &Configuration> {
        std::iter::successors(Some(self), |config| config.parent.as_deref())
    }

    // ------------------------------------------------------------------
    // Retirement
    // ------------------------------------------------------------------

    /// Whether this configuration has retired
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.state.lock().retired_by.is_some()
    }

    /// Who retired this configuration
    #[must_use]
    pub fn retired_by(&self) -> Option<String> {
        self.state.lock().retired_by.clone()
    }

    /// Retire, running each stored item's retirement plan
    ///
    /// Idempotent: only the first caller retires and gets `true`. Plan
    /// failures are collected in [`Self::retirement_failures`], never
    /// propagated.
    pub fn retire(&self, retirer: &str) -> bool {
        let items = {
            let mut state = self.state.lock();
            if state.retired_by.is_some() {
                return false;
            }
            state.retired_by = Some(retirer.to_string());
            std::mem::take(&mut state.items)
        };

        tracing::debug!(scope = %self.label, retirer, items = items.len(), "retiring configuration");
        let failures: Vec<_> = items
            .into_iter()
            .filter_map(|(key, item)| retire_item(key, item.plan))
            .collect();
        self.record_failures(failures);
        true
    }

    /// Failures collected from retirement plans
    #[must_use]
    pub fn retirement_failures(&self) -> Vec<RetirementFailure> {
        self.state.lock().failures.clone()
    }

    fn record_failures(&self, failures: Vec<RetirementFailure>) {
        if failures.is_empty() {
            return;
        }
        for failure in &failures {
            tracing::warn!(scope = %self.label, %failure, "retirement plan failed");
        }
        self.state.lock().failures.extend(failures);
    }

    fn ensure_live(&self, state: &State) -> Result<(), ScopeError> {
        match state.retired_by {
            Some(_) => Err(ScopeError::Retired(self.label.clone())),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Custom items
    // ------------------------------------------------------------------

    /// Store `value` under `key` at this level
    ///
    /// A previous value under the same key that is a different object is
    /// retired immediately. If this configuration is already retired the new
    /// value is retired immediately instead of being stored.
    pub fn set_scoped_item<T>(&self, key: impl Into<String>, value: Arc<T>, plan: RetirementPlan)
    where
        T: Any + Send + Sync,
    {
        self.set_scoped_value(key, value, plan);
    }

    /// Untyped variant of [`Self::set_scoped_item`]
    pub fn set_scoped_value(&self, key: impl Into<String>, value: ItemValue, plan: RetirementPlan) {
        let key = key.into();
        let to_retire = {
            let mut state = self.state.lock();
            if state.retired_by.is_some() {
                Some((key, plan))
            } else {
                let previous = state.items.insert(
                    key.clone(),
                    StoredItem {
                        value: value.clone(),
                        plan,
                    },
                );
                match previous {
                    Some(previous) if !same_identity(&previous.value, &value) => {
                        Some((key, previous.plan))
                    }
                    _ => None,
                }
            }
        };

        if let Some((key, plan)) = to_retire {
            tracing::debug!(scope = %self.label, key = %key, "retiring displaced item");
            self.record_failures(retire_item(key, plan).into_iter().collect());
        }
    }

    /// Look up `key` here, then through the parents
    ///
    /// Returns `None` if absent everywhere or stored with another type.
    #[must_use]
    pub fn get_scoped_item<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get_scoped_value(key)?.downcast::<T>().ok()
    }

    /// Untyped variant of [`Self::get_scoped_item`]
    #[must_use]
    pub fn get_scoped_value(&self, key: &str) -> Option<ItemValue> {
        self.lineage()
            .find_map(|config| config.state.lock().items.get(key).map(|item| item.value.clone()))
    }

    /// Whether `key` is stored at this very level
    #[must_use]
    pub fn contains_local_item(&self, key: &str) -> bool {
        self.state.lock().items.contains_key(key)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Effective max total count (`None` = unlimited)
    #[must_use]
    pub fn max_total_count(&self) -> Option<u64> {
        self.lineage()
            .find_map(|config| config.settings.read().max_total_count)
    }

    /// Effective max failure count (`None` = unlimited)
    #[must_use]
    pub fn max_failure_count(&self) -> Option<u64> {
        self.lineage()
            .find_map(|config| config.settings.read().max_failure_count)
    }

    /// Effective display separators
    #[must_use]
    pub fn separators(&self) -> DisplaySeparators {
        self.lineage()
            .find_map(|config| config.settings.read().separators.clone())
            .unwrap_or_default()
    }

    /// Set max total count for this scope and below
    ///
    /// # Errors
    /// - `ScopeError::Retired` after retirement
    /// - `ScopeError::InvalidSetting` for zero
    pub fn set_max_total_count(&self, max: u64) -> Result<(), ScopeError> {
        validate_limit("max_total_count", Some(max))?;
        self.ensure_live(&self.state.lock())?;
        self.settings.write().max_total_count = Some(max);
        Ok(())
    }

    /// Set max failure count for this scope and below
    ///
    /// # Errors
    /// - `ScopeError::Retired` after retirement
    /// - `ScopeError::InvalidSetting` for zero
    pub fn set_max_failure_count(&self, max: u64) -> Result<(), ScopeError> {
        validate_limit("max_failure_count", Some(max))?;
        self.ensure_live(&self.state.lock())?;
        self.settings.write().max_failure_count = Some(max);
        Ok(())
    }

    /// Set display separators for this scope and below
    ///
    /// # Errors
    /// Returns `ScopeError::Retired` after retirement.
    pub fn set_separators(&self, separators: DisplaySeparators) -> Result<(), ScopeError> {
        self.ensure_live(&self.state.lock())?;
        self.settings.write().separators = Some(separators);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Display accumulator
    // ------------------------------------------------------------------

    /// Append a label fragment, e.g. `x=3`
    ///
    /// # Errors
    /// Returns `ScopeError::Retired` after retirement.
    pub fn append_display(&self, fragment: impl Into<String>) -> Result<(), ScopeError> {
        let mut state = self.state.lock();
        self.ensure_live(&state)?;
        state.display.push(fragment.into());
        Ok(())
    }

    /// Fragments accumulated in this scope
    #[must_use]
    pub fn display_fragments(&self) -> Vec<String> {
        self.state.lock().display.clone()
    }

    /// Rendered appendix, `None` when nothing was accumulated
    #[must_use]
    pub fn display_appendix(&self) -> Option<String> {
        let fragments = self.display_fragments();
        self.separators().render(&fragments)
    }

    pub(crate) fn seed_display(&self, fragments: Vec<String>) {
        self.state.lock().display = fragments;
    }

    // ------------------------------------------------------------------
    // Combination session
    // ------------------------------------------------------------------

    /// Bind the combination session driven in this scope
    ///
    /// Returns the previously bound session, if any.
    ///
    /// # Errors
    /// Returns `ScopeError::Retired` after retirement.
    pub fn bind_session(&self, session: SessionId) -> Result<Option<SessionId>, ScopeError> {
        let mut state = self.state.lock();
        self.ensure_live(&state)?;
        Ok(state.session.replace(session))
    }

    /// Session bound in this scope
    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.state.lock().session
    }

    pub(crate) fn force_session(&self, session: SessionId) {
        self.state.lock().session = Some(session);
    }

    pub(crate) fn set_pending_repeat(&self, session: SessionId) {
        self.state.lock().pending_repeat = Some(session);
    }

    pub(crate) fn take_pending_repeat(&self) -> Option<SessionId> {
        self.state.lock().pending_repeat.take()
    }

    /// Whether a repetition was requested when this scope closed
    #[must_use]
    pub fn has_pending_repeat(&self) -> bool {
        self.state.lock().pending_repeat.is_some()
    }

    pub(crate) fn set_non_repeatable(&self) -> Option<SessionId> {
        let mut state = self.state.lock();
        state.non_repeatable = true;
        state.session
    }

    /// Whether repetition was forbidden for this scope
    #[must_use]
    pub fn is_non_repeatable(&self) -> bool {
        self.state.lock().non_repeatable
    }

    pub(crate) fn set_summary(&self, summary: RepeatSummary) {
        self.state.lock().summary = Some(summary);
    }

    /// Terminal summary of the session that ended in this scope
    #[must_use]
    pub fn summary(&self) -> Option<RepeatSummary> {
        self.state.lock().summary.clone()
    }
}

fn retire_item(key: String, plan: RetirementPlan) -> Option<RetirementFailure> {
    plan.execute()
        .err()
        .map(|message| RetirementFailure { key, message })
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Configuration")
            .field("label", &self.label)
            .field("items", &state.items.keys().collect::<Vec<_>>())
            .field("retired_by", &state.retired_by)
            .field("session", &state.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn root() -> Arc<Configuration> {
        Arc::new(Configuration::root(0, &RepeatConfig::new()))
    }

    fn counting_plan(counter: &Arc<AtomicUsize>) -> RetirementPlan {
        let counter = Arc::clone(counter);
        RetirementPlan::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn lookup_falls_back_to_parent() {
        let parent = root();
        parent.set_scoped_item("k", Arc::new(1_u32), RetirementPlan::none());
        let child = Configuration::child_of(Arc::clone(&parent), "child");

        assert_eq!(child.get_scoped_item::<u32>("k").as_deref(), Some(&1));
        assert!(child.get_scoped_item::<u32>("missing").is_none());
        assert!(child.get_scoped_item::<String>("k").is_none());
    }

    #[test]
    fn retire_runs_each_plan_once() {
        let config = Configuration::child_of(root(), "scope");
        let fired = Arc::new(AtomicUsize::new(0));
        config.set_scoped_item("a", Arc::new(()), counting_plan(&fired));
        config.set_scoped_item("b", Arc::new(()), counting_plan(&fired));

        assert!(config.retire("first"));
        assert!(!config.retire("second"));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(config.retired_by().as_deref(), Some("first"));
    }

    #[test]
    fn replacing_with_other_value_retires_previous() {
        let config = Configuration::child_of(root(), "scope");
        let fired = Arc::new(AtomicUsize::new(0));
        config.set_scoped_item("k", Arc::new(1_u8), counting_plan(&fired));
        config.set_scoped_item("k", Arc::new(2_u8), RetirementPlan::none());

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(config.get_scoped_item::<u8>("k").as_deref(), Some(&2));
    }

    #[test]
    fn replacing_with_same_value_does_not_retire() {
        let config = Configuration::child_of(root(), "scope");
        let fired = Arc::new(AtomicUsize::new(0));
        let value = Arc::new(5_u8);
        config.set_scoped_item("k", Arc::clone(&value), counting_plan(&fired));
        config.set_scoped_item("k", value, counting_plan(&fired));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        config.retire("test");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_set_retires_incoming_value() {
        let config = Configuration::child_of(root(), "scope");
        config.retire("test");

        let fired = Arc::new(AtomicUsize::new(0));
        config.set_scoped_item("late", Arc::new(()), counting_plan(&fired));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!config.contains_local_item("late"));
    }

    #[test]
    fn failures_are_collected() {
        let config = Configuration::child_of(root(), "scope");
        config.set_scoped_item("err", Arc::new(()), RetirementPlan::new(|| anyhow::bail!("boom")));
        config.set_scoped_item("panic", Arc::new(()), RetirementPlan::new(|| panic!("kaboom")));
        let fired = Arc::new(AtomicUsize::new(0));
        config.set_scoped_item("ok", Arc::new(()), counting_plan(&fired));

        assert!(config.retire("test"));
        let failures = config.retirement_failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].key, "err");
        assert_eq!(failures[0].message, "boom");
        assert_eq!(failures[1].message, "kaboom");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn settings_inherit() {
        let parent = Arc::new(Configuration::root(
            0,
            &RepeatConfig::new().with_max_total_count(10),
        ));
        let child = Configuration::child_of(Arc::clone(&parent), "child");
        assert_eq!(child.max_total_count(), Some(10));
        assert_eq!(child.max_failure_count(), None);

        child.set_max_total_count(3).unwrap();
        assert_eq!(child.max_total_count(), Some(3));
        assert_eq!(parent.max_total_count(), Some(10));
    }

    #[test]
    fn retired_rejects_settings() {
        let config = Configuration::child_of(root(), "scope");
        config.retire("test");
        assert!(matches!(config.set_max_failure_count(2), Err(ScopeError::Retired(_))));
        assert!(matches!(config.append_display("x=1"), Err(ScopeError::Retired(_))));
    }

    #[test]
    fn zero_limit_rejected() {
        let config = Configuration::child_of(root(), "scope");
        assert!(matches!(
            config.set_max_total_count(0),
            Err(ScopeError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn display_appendix_uses_separators() {
        let config = Configuration::child_of(root(), "scope");
        assert_eq!(config.display_appendix(), None);
        config.append_display("x=1").unwrap();
        config.append_display("y=2").unwrap();
        assert_eq!(config.display_appendix().as_deref(), Some(" [x=1, y=2]"));

        config
            .set_separators(DisplaySeparators::new("(", "; ", ")"))
            .unwrap();
        assert_eq!(config.display_appendix().as_deref(), Some("(x=1; y=2)"));
    }
}
