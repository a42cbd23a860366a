//! Suspended cleanup below a guard
//!
//! Nodes that run inside a guarded execution are wrapped so their `cleanup`
//! is recorded on the guard's family instead of running right away, and so
//! their listener events are routed into the guard's queue.

use crate::guard::ExecutionGuard;
use crate::host::{
    ExecutionContext, ExecutionMode, NodeId, Outcome, RepetitionRole, SkipDecision, SubExecutionLauncher, TaskNode,
};
use crate::preserve::Snapshottable;
use std::sync::{Arc, Weak};

/// Node running below a guard
pub(crate) struct CleanupDeferringNode {
    inner: Arc<dyn TaskNode>,
    parent: Arc<dyn TaskNode>,
    guard: Arc<ExecutionGuard>,
    this: Weak<CleanupDeferringNode>,
}

impl CleanupDeferringNode {
    /// Wrap `inner`, unless it is a guard or already routed to `guard`
    ///
    /// A node routed to an enclosing guard is wrapped again, so its events
    /// reach the innermost guard and its cleanup passes outwards.
    pub(crate) fn wrap(
        inner: Arc<dyn TaskNode>,
        parent: Arc<dyn TaskNode>,
        guard: Arc<ExecutionGuard>,
    ) -> Arc<dyn TaskNode> {
        let routed = match inner.repetition_role() {
            RepetitionRole::None => false,
            RepetitionRole::Guard(_) => true,
            RepetitionRole::Descendant(current) => Arc::ptr_eq(&current, &guard),
        };
        if routed {
            return inner;
        }
        Arc::<Self>::new_cyclic(|this| Self {
            inner,
            parent,
            guard,
            this: this.clone(),
        })
    }

    fn as_node(&self) -> Option<Arc<dyn TaskNode>> {
        self.this.upgrade().map(|node| node as Arc<dyn TaskNode>)
    }
}

impl TaskNode for CleanupDeferringNode {
    fn unique_id(&self) -> NodeId {
        self.inner.unique_id()
    }

    fn display_name(&self) -> String {
        self.inner.display_name()
    }

    fn parent(&self) -> Option<Arc<dyn TaskNode>> {
        Some(Arc::clone(&self.parent))
    }

    fn children(&self) -> Vec<Arc<dyn TaskNode>> {
        let Some(node) = self.as_node() else {
            return self.inner.children();
        };
        self.inner
            .children()
            .into_iter()
            .map(|child| Self::wrap(child, Arc::clone(&node), Arc::clone(&self.guard)))
            .collect()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.inner.execution_mode()
    }

    fn is_repeatable(&self) -> bool {
        self.inner.is_repeatable()
    }

    fn prepare(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.inner.prepare(ctx)
    }

    fn should_skip(&self, ctx: &ExecutionContext) -> SkipDecision {
        self.inner.should_skip(ctx)
    }

    fn execute(&self, ctx: &ExecutionContext, launcher: &dyn SubExecutionLauncher) -> anyhow::Result<()> {
        match self.as_node() {
            Some(node) => {
                let deferring = CleanupDeferringLauncher::new(launcher, node, Arc::clone(&self.guard));
                self.inner.execute(ctx, &deferring)
            }
            None => self.inner.execute(ctx, launcher),
        }
    }

    fn cleanup(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.guard.record_cleanup(Arc::clone(&self.inner), ctx.clone());
        Ok(())
    }

    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        self.inner.as_snapshottable()
    }

    fn repetition_role(&self) -> RepetitionRole<'_> {
        RepetitionRole::Descendant(Arc::clone(&self.guard))
    }
}

/// Launcher that wraps dynamically launched children
pub(crate) struct CleanupDeferringLauncher<'a> {
    launcher: &'a dyn SubExecutionLauncher,
    parent: Arc<dyn TaskNode>,
    guard: Arc<ExecutionGuard>,
}

impl<'a> CleanupDeferringLauncher<'a> {
    pub(crate) fn new(
        launcher: &'a dyn SubExecutionLauncher,
        parent: Arc<dyn TaskNode>,
        guard: Arc<ExecutionGuard>,
    ) -> Self {
        Self {
            launcher,
            parent,
            guard,
        }
    }
}

impl SubExecutionLauncher for CleanupDeferringLauncher<'_> {
    fn launch(&self, node: Arc<dyn TaskNode>) -> Outcome {
        let node = CleanupDeferringNode::wrap(node, Arc::clone(&self.parent), Arc::clone(&self.guard));
        self.launcher.launch(node)
    }
}
