//! Execution guard
//!
//! An [`ExecutionGuard`] stands in for one host task node and makes it run
//! once per pending combination. The guard the host first sees is the root
//! of a family; every repeated execution is a sibling guard spawned by the
//! root, sharing the root's preserved state and suspended cleanup.
//!
//! Listener calls about the family are queued and replayed once the final
//! outcome is known, so names, parents and the reported result are settled
//! when the real listener sees them. A family guarding a node that itself
//! runs below another guard nests its queue into that guard's queue and
//! leaves the replay to it.

use crate::cleanup::{CleanupDeferringLauncher, CleanupDeferringNode};
use crate::coordinator::GuardRegistry;
use crate::host::{
    EngineListener, ExecutionContext, ExecutionMode, Failure, NodeId, Outcome, RepetitionRole, SkipDecision,
    SubExecutionLauncher, TaskNode,
};
use crate::notification::DeferredNotificationQueue;
use crate::outcome;
use crate::preserve::{PreservedState, Snapshottable};
use crate::state_machine::{validate_transition, GuardState};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use reprise_scope::{MaxRepeatCount, ScopeLifecycleFacade};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

type CleanupAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// State shared by a root guard and its siblings
#[derive(Default)]
struct Family {
    preserved: Mutex<Option<Arc<PreservedState>>>,
    cleanup: Mutex<IndexMap<NodeId, CleanupAction>>,
    executions: Mutex<Vec<Outcome>>,
    members: Mutex<Vec<Weak<ExecutionGuard>>>,
    launcher: OnceCell<Arc<dyn SubExecutionLauncher>>,
    enclosing: Option<Arc<ExecutionGuard>>,
}

impl Family {
    /// Record a cleanup action; the first one per id wins
    fn record_cleanup(&self, id: NodeId, action: CleanupAction) -> bool {
        let mut cleanup = self.cleanup.lock();
        if cleanup.contains_key(&id) {
            return false;
        }
        cleanup.insert(id, action);
        true
    }

    fn run_cleanup(&self) -> Vec<Failure> {
        let actions = std::mem::take(&mut *self.cleanup.lock());
        actions
            .into_iter()
            .filter_map(|(id, action)| {
                let failure = match catch_unwind(AssertUnwindSafe(action)) {
                    Ok(Ok(())) => return None,
                    Ok(Err(err)) => Failure::from_error(&err),
                    Err(panic) => Failure::from_panic(panic.as_ref()),
                };
                tracing::warn!(node = %id, %failure, "suspended cleanup failed");
                Some(failure)
            })
            .collect()
    }

    fn discard_cleanup(&self) -> usize {
        let discarded = std::mem::take(&mut *self.cleanup.lock());
        discarded.len()
    }

    fn execution_count(&self) -> usize {
        self.members.lock().len()
    }

    fn close_all(&self) {
        let members = std::mem::take(&mut *self.members.lock());
        for guard in members.iter().filter_map(Weak::upgrade) {
            guard.set_lifecycle(GuardState::Closed);
        }
        self.preserved.lock().take();
        self.cleanup.lock().clear();
        self.executions.lock().clear();
    }
}

#[derive(Debug)]
struct GuardInner {
    lifecycle: GuardState,
    startup_pending: bool,
    has_pending_repetitions: bool,
    max_reached: Option<MaxRepeatCount>,
    outcome: Option<Outcome>,
    finalized_display_appendix: Option<String>,
}

impl Default for GuardInner {
    fn default() -> Self {
        Self {
            lifecycle: GuardState::Fresh,
            startup_pending: true,
            has_pending_repetitions: false,
            max_reached: None,
            outcome: None,
            finalized_display_appendix: None,
        }
    }
}

/// Wrapper that repeats one host task node
///
/// Forwards every [`TaskNode`] query to the wrapped node except identity,
/// naming, parent, children, `prepare`, `execute` and `cleanup`.
pub struct ExecutionGuard {
    inner: Arc<dyn TaskNode>,
    execution: usize,
    facade: Arc<ScopeLifecycleFacade>,
    registry: Arc<GuardRegistry>,
    family: Arc<Family>,
    this: Weak<ExecutionGuard>,
    final_parent: OnceCell<Option<Arc<dyn TaskNode>>>,
    notifications: Arc<DeferredNotificationQueue>,
    state: Mutex<GuardInner>,
}

impl ExecutionGuard {
    /// Create the root guard of a new family
    ///
    /// With an `enclosing` guard, the family's queue is nested into the
    /// enclosing execution's queue at this point.
    pub(crate) fn root(
        inner: Arc<dyn TaskNode>,
        facade: Arc<ScopeLifecycleFacade>,
        registry: Arc<GuardRegistry>,
        enclosing: Option<Arc<ExecutionGuard>>,
    ) -> Arc<Self> {
        let notifications = Arc::new(DeferredNotificationQueue::new());
        if let Some(enclosing) = &enclosing {
            enclosing.notifications.nest(Arc::clone(&notifications));
        }
        let family = Family {
            enclosing,
            ..Family::default()
        };
        Self::create(inner, facade, registry, Arc::new(family), notifications)
    }

    fn create(
        inner: Arc<dyn TaskNode>,
        facade: Arc<ScopeLifecycleFacade>,
        registry: Arc<GuardRegistry>,
        family: Arc<Family>,
        notifications: Arc<DeferredNotificationQueue>,
    ) -> Arc<Self> {
        let execution = family.execution_count() + 1;
        let guard = Arc::new_cyclic(|this| Self {
            inner,
            execution,
            facade,
            registry,
            family,
            this: this.clone(),
            final_parent: OnceCell::new(),
            notifications,
            state: Mutex::new(GuardInner::default()),
        });
        guard.family.members.lock().push(Arc::downgrade(&guard));
        guard
    }

    /// Spawn the guard for the next execution of the same node
    fn spawn_sibling(&self) -> Arc<Self> {
        let queue = Arc::new(DeferredNotificationQueue::new());
        self.notifications.nest(Arc::clone(&queue));
        Self::create(
            Arc::clone(&self.inner),
            Arc::clone(&self.facade),
            Arc::clone(&self.registry),
            Arc::clone(&self.family),
            queue,
        )
    }

    /// Wrapped host node
    #[inline]
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn TaskNode> {
        &self.inner
    }

    /// 1-based number of the execution this guard runs
    #[inline]
    #[must_use]
    pub fn execution(&self) -> usize {
        self.execution
    }

    /// Check if this guard is the root of its family
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.execution == 1
    }

    /// Check if this family runs below another guard
    #[inline]
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.family.enclosing.is_some()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> GuardState {
        self.state.lock().lifecycle
    }

    /// Check if terminal cleanup ran
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == GuardState::Closed
    }

    /// Outcome recorded when this execution finished
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.clone()
    }

    /// Whether another execution was requested when this one finished
    #[must_use]
    pub fn has_pending_repetitions(&self) -> bool {
        self.state.lock().has_pending_repetitions
    }

    /// Limit that stopped the repetition at this execution
    #[must_use]
    pub fn max_reached(&self) -> Option<MaxRepeatCount> {
        self.state.lock().max_reached.clone()
    }

    /// Display appendix settled when this execution's scope closed
    #[must_use]
    pub fn finalized_display_appendix(&self) -> Option<String> {
        self.state.lock().finalized_display_appendix.clone()
    }

    /// Listener calls queued for this execution
    #[inline]
    #[must_use]
    pub fn pending_notifications(&self) -> &Arc<DeferredNotificationQueue> {
        &self.notifications
    }

    fn owner(&self) -> Option<Arc<ExecutionGuard>> {
        self.this.upgrade()
    }

    fn as_node(&self) -> Option<Arc<dyn TaskNode>> {
        self.owner().map(|guard| guard as Arc<dyn TaskNode>)
    }

    fn set_lifecycle(&self, to: GuardState) {
        let mut state = self.state.lock();
        self.transition(&mut state, to);
    }

    fn transition(&self, state: &mut GuardInner, to: GuardState) {
        if state.lifecycle == to {
            return;
        }
        match validate_transition(state.lifecycle, to) {
            Ok(()) => state.lifecycle = to,
            Err(err) => tracing::warn!(node = %self.inner.unique_id(), execution = self.execution, %err, "ignoring guard transition"),
        }
    }

    /// Queue a listener call for replay
    pub(crate) fn defer(&self, notification: impl FnOnce(&dyn EngineListener) + Send + 'static) {
        self.notifications.push(notification);
    }

    /// Suspend the cleanup of `node` until the family finishes
    pub(crate) fn record_cleanup(&self, node: Arc<dyn TaskNode>, ctx: ExecutionContext) {
        let id = node.unique_id();
        let recorded = self
            .family
            .record_cleanup(id.clone(), Box::new(move || node.cleanup(&ctx)));
        tracing::trace!(node = %id, recorded, "suspended cleanup");
    }

    /// Queue the start notifications, once
    ///
    /// Siblings are announced as registered before they start. Returns
    /// whether this call queued anything.
    pub fn ensure_started(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !state.startup_pending {
                return false;
            }
            state.startup_pending = false;
            self.transition(&mut state, GuardState::Started);
        }
        let Some(node) = self.as_node() else {
            return false;
        };
        if !self.is_root() {
            let registered = Arc::clone(&node);
            self.defer(move |listener| listener.registered(&registered));
        }
        self.defer(move |listener| listener.started(&node));
        true
    }

    /// Record the outcome of this execution and close its scope
    ///
    /// Returns whether another execution is required. A sibling queues its
    /// own `finished` here; the root reports the merged outcome of the whole
    /// family when it finalizes.
    ///
    /// # Errors
    /// Returns `MaxRepeatCount` when repetition stopped at this execution.
    pub fn finish_and_close_scope(&self, outcome: Outcome) -> Result<bool, MaxRepeatCount> {
        let Some(node) = self.as_node() else {
            return Ok(false);
        };
        let result = self.facade.close_scope(&node, outcome.is_successful());
        let retirement = self
            .facade
            .retirement_failures(&node)
            .into_iter()
            .map(|failure| Failure::new(failure.to_string()))
            .collect();
        let outcome = outcome::with_internal_failures(outcome, retirement);
        let appendix = self.facade.resolve_display_appendix(&node);
        let pending = matches!(result, Ok(false));

        {
            let mut state = self.state.lock();
            self.transition(&mut state, GuardState::Finished { pending });
            state.outcome = Some(outcome.clone());
            state.finalized_display_appendix = appendix;
            state.has_pending_repetitions = pending;
            state.max_reached = result.as_ref().err().cloned();
        }
        self.family.executions.lock().push(outcome.clone());

        tracing::debug!(
            node = %self.inner.unique_id(),
            execution = self.execution,
            %outcome,
            pending,
            "guarded execution finished"
        );
        if !self.is_root() {
            self.defer(move |listener| listener.finished(&node, &outcome));
        }
        result.map(|done| !done)
    }

    /// Run every pending execution, then report the family's outcome
    ///
    /// Iterates rather than recursing: each sibling is launched from here
    /// and returns before the next one is spawned.
    pub(crate) fn repeat_and_finalize(&self, real: &dyn EngineListener) {
        let Some(mut current) = self.owner() else {
            return;
        };

        while current.has_pending_repetitions() {
            let Some(launcher) = self.family.launcher.get().cloned() else {
                tracing::warn!(node = %self.inner.unique_id(), "no launcher recorded, cannot repeat");
                break;
            };
            let sibling = self.spawn_sibling();
            current.set_lifecycle(GuardState::Repeating);

            let from: Arc<dyn TaskNode> = current;
            let to: Arc<dyn TaskNode> = Arc::clone(&sibling) as Arc<dyn TaskNode>;
            if !self.facade.hand_over_repeat(&from, &to) {
                tracing::warn!(node = %self.inner.unique_id(), "pending repeat vanished before hand-over");
                current = sibling;
                break;
            }
            tracing::debug!(node = %self.inner.unique_id(), execution = sibling.execution, "repeating execution");
            launcher.launch(to);
            current = sibling;
        }

        self.finalize(&current, real);
    }

    fn finalize(&self, last: &ExecutionGuard, real: &dyn EngineListener) {
        let executions = self.family.executions.lock().clone();
        let stop = last.max_reached();
        let mut reported = outcome::merge_executions(&executions, stop.as_ref());

        // A synthetic abort from the limits still cleans up
        if last.outcome().is_some_and(|outcome| outcome.is_aborted()) {
            let discarded = self.family.discard_cleanup();
            tracing::debug!(node = %self.inner.unique_id(), discarded, "last execution aborted, skipping cleanup");
        } else {
            reported = outcome::with_internal_failures(reported, self.family.run_cleanup());
        }

        if let Some(node) = self.as_node() {
            let outcome = reported.clone();
            self.defer(move |listener| listener.finished(&node, &outcome));
        }
        // A nested family is replayed with its enclosing guard's queue
        let fired = if self.is_nested() {
            0
        } else {
            self.notifications.fire(real)
        };
        self.family.close_all();

        tracing::debug!(
            node = %self.inner.unique_id(),
            executions = executions.len(),
            fired,
            outcome = %reported,
            "repetition finished"
        );
    }

    /// Handle the host skipping this execution
    ///
    /// A skipped sibling never opens its scope, so the session handed over
    /// to it is abandoned here.
    pub(crate) fn skip(&self, reason: &str, real: &dyn EngineListener) {
        let Some(node) = self.as_node() else {
            return;
        };
        self.set_lifecycle(GuardState::Closed);
        if !self.is_root() {
            if let Some(session) = self.facade.abandon_repeat(&node) {
                tracing::debug!(node = %self.inner.unique_id(), execution = self.execution, %session, "repetition skipped");
            }
            let registered = Arc::clone(&node);
            self.defer(move |listener| listener.registered(&registered));
        }
        if self.is_root() && !self.is_nested() {
            real.skipped(&node, reason);
        } else {
            let reason = reason.to_string();
            self.defer(move |listener| listener.skipped(&node, &reason));
        }
        if self.is_root() {
            self.family.close_all();
        }
    }

    fn resolve_parent(&self) -> Option<Arc<dyn TaskNode>> {
        let raw = self.inner.parent()?;
        Some(match self.registry.lookup(&raw) {
            Some(guard) => guard,
            None => raw,
        })
    }
}

impl TaskNode for ExecutionGuard {
    fn unique_id(&self) -> NodeId {
        let id = self.inner.unique_id();
        if self.is_root() {
            id
        } else {
            id.execution(self.execution)
        }
    }

    fn display_name(&self) -> String {
        let name = self.inner.display_name();
        match self.finalized_display_appendix() {
            Some(appendix) => format!("{name}{appendix}"),
            None => name,
        }
    }

    fn parent(&self) -> Option<Arc<dyn TaskNode>> {
        self.final_parent.get_or_init(|| self.resolve_parent()).clone()
    }

    fn children(&self) -> Vec<Arc<dyn TaskNode>> {
        let (Some(guard), Some(node)) = (self.owner(), self.as_node()) else {
            return self.inner.children();
        };
        self.inner
            .children()
            .into_iter()
            .map(|child| CleanupDeferringNode::wrap(child, Arc::clone(&node), Arc::clone(&guard)))
            .collect()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.inner.execution_mode()
    }

    fn is_repeatable(&self) -> bool {
        self.inner.is_repeatable()
    }

    fn prepare(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let _ = self.family.launcher.set(Arc::clone(ctx.launcher()));

        if !self.is_root() {
            let preserved = self.family.preserved.lock().clone();
            if let (Some(preserved), Some(target)) = (preserved, self.inner.as_snapshottable()) {
                let report = preserved.restore_onto(target);
                tracing::debug!(
                    node = %self.inner.unique_id(),
                    execution = self.execution,
                    restored = report.restored.len(),
                    skipped = report.skipped.len(),
                    "restored preserved state"
                );
                return Ok(());
            }
        }

        self.inner.prepare(ctx)?;
        if let Some(target) = self.inner.as_snapshottable() {
            let mut preserved = self.family.preserved.lock();
            if preserved.is_none() {
                *preserved = Some(Arc::new(PreservedState::capture(target)));
            }
        }
        Ok(())
    }

    fn should_skip(&self, ctx: &ExecutionContext) -> SkipDecision {
        self.inner.should_skip(ctx)
    }

    fn execute(&self, ctx: &ExecutionContext, launcher: &dyn SubExecutionLauncher) -> anyhow::Result<()> {
        match (self.owner(), self.as_node()) {
            (Some(guard), Some(node)) => {
                let deferring = CleanupDeferringLauncher::new(launcher, node, guard);
                self.inner.execute(ctx, &deferring)
            }
            _ => self.inner.execute(ctx, launcher),
        }
    }

    fn cleanup(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.record_cleanup(Arc::clone(&self.inner), ctx.clone());
        Ok(())
    }

    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        self.inner.as_snapshottable()
    }

    fn repetition_role(&self) -> RepetitionRole<'_> {
        RepetitionRole::Guard(self)
    }
}

impl fmt::Debug for ExecutionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionGuard")
            .field("node", &self.inner.unique_id())
            .field("execution", &self.execution)
            .field("state", &self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RepeatCoordinator;
    use crate::testing::{EventLog, StubNode};
    use reprise_scope::NoCombinations;

    fn guarded(coordinator: &RepeatCoordinator, node: &Arc<dyn TaskNode>) -> Arc<ExecutionGuard> {
        coordinator.intercept(Arc::clone(node));
        coordinator.guard_for(node).unwrap()
    }

    #[test]
    fn ensure_started_queues_once() {
        let coordinator = RepeatCoordinator::new(Arc::new(NoCombinations));
        let node = StubNode::repeatable("n");
        let guard = guarded(&coordinator, &node);

        let queued = (0..5).filter(|_| guard.ensure_started()).count();
        assert_eq!(queued, 1);
        assert_eq!(guard.state(), GuardState::Started);

        let log = EventLog::default();
        guard.pending_notifications().fire(&log);
        assert_eq!(log.events(), vec!["started n"]);
    }

    #[test]
    fn sibling_ids_and_names() {
        let coordinator = RepeatCoordinator::new(Arc::new(NoCombinations));
        let node = StubNode::repeatable("n");
        let root = guarded(&coordinator, &node);
        let sibling = root.spawn_sibling();

        assert_eq!(root.unique_id(), NodeId::new("n"));
        assert_eq!(sibling.unique_id(), NodeId::new("n#2"));
        assert_eq!(sibling.execution(), 2);
        assert!(!sibling.is_root());
        assert_eq!(sibling.display_name(), "n");
    }

    #[test]
    fn sibling_registers_before_start() {
        let coordinator = RepeatCoordinator::new(Arc::new(NoCombinations));
        let node = StubNode::repeatable("n");
        let root = guarded(&coordinator, &node);
        let sibling = root.spawn_sibling();
        sibling.ensure_started();

        let log = EventLog::default();
        root.pending_notifications().fire(&log);
        assert_eq!(log.events(), vec!["registered n#2", "started n#2"]);
    }

    #[test]
    fn cleanup_first_recorded_wins() {
        let coordinator = RepeatCoordinator::new(Arc::new(NoCombinations));
        let node = StubNode::repeatable("n");
        let guard = guarded(&coordinator, &node);

        let first: CleanupAction = Box::new(|| -> anyhow::Result<()> { anyhow::bail!("first") });
        let second: CleanupAction = Box::new(|| -> anyhow::Result<()> { Ok(()) });
        assert!(guard.family.record_cleanup(NodeId::new("c"), first));
        assert!(!guard.family.record_cleanup(NodeId::new("c"), second));

        let failures = guard.family.run_cleanup();
        assert_eq!(failures, vec![Failure::new("first")]);
        assert!(guard.family.run_cleanup().is_empty());
    }

    #[test]
    fn parent_resolves_to_guard_of_parent() {
        let coordinator = RepeatCoordinator::new(Arc::new(NoCombinations));
        let parent = StubNode::repeatable("parent");
        let child = StubNode::child_of("child", &parent, true);
        let parent_guard = guarded(&coordinator, &parent);
        let child_guard = guarded(&coordinator, &child);

        let resolved = child_guard.parent().unwrap();
        assert_eq!(
            Arc::as_ptr(&resolved).cast::<()>(),
            Arc::as_ptr(&parent_guard).cast::<()>()
        );
    }
}
