//! Configurable task nodes
//!
//! [`FixtureNode`] counts its hook calls, writes them to an optional shared
//! [`Journal`] and carries a little mutable state that guards can capture and
//! restore between executions.

use parking_lot::Mutex;
use reprise_guard::{
    ExecutionContext, ExecutionMode, FieldSnapshot, NodeId, RestoreSkip, SkipDecision, Snapshottable,
    SubExecutionLauncher, TaskNode,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

type Body = Box<dyn Fn(&FixtureNode, &dyn SubExecutionLauncher) -> anyhow::Result<()> + Send + Sync>;

/// Ordered record of hook calls across nodes and threads
#[derive(Debug, Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Entries starting with `prefix`
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
struct FixtureState {
    setup_value: Option<u64>,
    items: Vec<String>,
    locked: bool,
}

/// Task node with scripted behavior
pub struct FixtureNode {
    id: NodeId,
    repeatable: bool,
    mode: ExecutionMode,
    setup: u64,
    skip: Option<String>,
    skip_after: Option<(usize, String)>,
    cleanup_failure: Option<String>,
    unrestorable: bool,
    body: Option<Body>,
    journal: Option<Arc<Journal>>,
    parent: Weak<FixtureNode>,
    children: Vec<Arc<FixtureNode>>,
    prepares: AtomicUsize,
    executions: AtomicUsize,
    cleanups: AtomicUsize,
    state: Mutex<FixtureState>,
}

impl FixtureNode {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn fixture_children(&self) -> &[Arc<FixtureNode>] {
        &self.children
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    /// Executions so far, including the running one
    pub fn execute_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn setup_value(&self) -> Option<u64> {
        self.state.lock().setup_value
    }

    pub fn set_setup_value(&self, value: Option<u64>) {
        self.state.lock().setup_value = value;
    }

    pub fn items(&self) -> Vec<String> {
        self.state.lock().items.clone()
    }

    pub fn push_item(&self, item: impl Into<String>) {
        self.state.lock().items.push(item.into());
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn set_locked(&self, locked: bool) {
        self.state.lock().locked = locked;
    }

    fn note(&self, hook: &str) {
        if let Some(journal) = &self.journal {
            journal.record(format!("{hook} {}", self.id));
        }
    }
}

impl TaskNode for FixtureNode {
    fn unique_id(&self) -> NodeId {
        self.id.clone()
    }

    fn display_name(&self) -> String {
        self.id.to_string()
    }

    fn parent(&self) -> Option<Arc<dyn TaskNode>> {
        self.parent.upgrade().map(|parent| parent as Arc<dyn TaskNode>)
    }

    fn children(&self) -> Vec<Arc<dyn TaskNode>> {
        self.children
            .iter()
            .map(|child| Arc::clone(child) as Arc<dyn TaskNode>)
            .collect()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    fn prepare(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        self.note("prepare");
        let mut state = self.state.lock();
        state.setup_value = Some(self.setup);
        state.items = vec![String::from("setup")];
        state.locked = true;
        Ok(())
    }

    fn should_skip(&self, _ctx: &ExecutionContext) -> SkipDecision {
        if let Some(reason) = &self.skip {
            return SkipDecision::Skip(reason.clone());
        }
        match &self.skip_after {
            Some((executions, reason)) if self.execute_count() >= *executions => SkipDecision::Skip(reason.clone()),
            _ => SkipDecision::Proceed,
        }
    }

    fn execute(&self, _ctx: &ExecutionContext, launcher: &dyn SubExecutionLauncher) -> anyhow::Result<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.note("execute");
        match &self.body {
            Some(body) => body(self, launcher),
            None => Ok(()),
        }
    }

    fn cleanup(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.note("cleanup");
        match &self.cleanup_failure {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(()),
        }
    }

    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        Some(self)
    }
}

impl Snapshottable for FixtureNode {
    fn capture(&self) -> Vec<FieldSnapshot> {
        let state = self.state.lock().clone();
        vec![
            FieldSnapshot::scalar("setup_value", state.setup_value),
            FieldSnapshot::collection("items", state.items),
            FieldSnapshot::scalar("locked", state.locked),
        ]
    }

    fn restore_field(&self, field: &FieldSnapshot) -> Result<(), RestoreSkip> {
        let mismatch = || RestoreSkip::new(field.name(), "unexpected value type");
        let mut state = self.state.lock();
        match field.name() {
            "setup_value" => state.setup_value = *field.value::<Option<u64>>().ok_or_else(mismatch)?,
            "items" => state.items = field.value::<Vec<String>>().ok_or_else(mismatch)?.clone(),
            "locked" if self.unrestorable => return Err(RestoreSkip::new("locked", "field is read-only")),
            "locked" => state.locked = *field.value::<bool>().ok_or_else(mismatch)?,
            other => return Err(RestoreSkip::new(other, "unknown field")),
        }
        Ok(())
    }
}

impl fmt::Debug for FixtureNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureNode")
            .field("id", &self.id)
            .field("repeatable", &self.repeatable)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`FixtureNode`] trees
pub struct FixtureBuilder {
    id: NodeId,
    repeatable: bool,
    mode: ExecutionMode,
    setup: u64,
    skip: Option<String>,
    skip_after: Option<(usize, String)>,
    cleanup_failure: Option<String>,
    unrestorable: bool,
    body: Option<Body>,
    journal: Option<Arc<Journal>>,
    children: Vec<FixtureBuilder>,
}

impl FixtureBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            repeatable: false,
            mode: ExecutionMode::SameThread,
            setup: 1,
            skip: None,
            skip_after: None,
            cleanup_failure: None,
            unrestorable: false,
            body: None,
            journal: None,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }

    #[must_use]
    pub fn concurrent(mut self) -> Self {
        self.mode = ExecutionMode::Concurrent;
        self
    }

    /// Value `prepare` stores as the setup value
    #[must_use]
    pub fn setup(mut self, value: u64) -> Self {
        self.setup = value;
        self
    }

    #[must_use]
    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip = Some(reason.into());
        self
    }

    /// Skip once the node has executed `executions` times
    #[must_use]
    pub fn skipped_after(mut self, executions: usize, reason: impl Into<String>) -> Self {
        self.skip_after = Some((executions, reason.into()));
        self
    }

    #[must_use]
    pub fn cleanup_failure(mut self, message: impl Into<String>) -> Self {
        self.cleanup_failure = Some(message.into());
        self
    }

    /// Refuse to restore the `locked` field
    #[must_use]
    pub fn unrestorable(mut self) -> Self {
        self.unrestorable = true;
        self
    }

    #[must_use]
    pub fn body(
        mut self,
        body: impl Fn(&FixtureNode, &dyn SubExecutionLauncher) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    /// Journal shared with children that do not set their own
    #[must_use]
    pub fn journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    #[must_use]
    pub fn child(mut self, child: FixtureBuilder) -> Self {
        self.children.push(child);
        self
    }

    pub fn build(self) -> Arc<FixtureNode> {
        self.build_below(Weak::new(), None)
    }

    fn build_below(self, parent: Weak<FixtureNode>, inherited: Option<Arc<Journal>>) -> Arc<FixtureNode> {
        let journal = self.journal.or(inherited);
        Arc::new_cyclic(|this| FixtureNode {
            children: self
                .children
                .into_iter()
                .map(|child| child.build_below(this.clone(), journal.clone()))
                .collect(),
            id: self.id,
            repeatable: self.repeatable,
            mode: self.mode,
            setup: self.setup,
            skip: self.skip,
            skip_after: self.skip_after,
            cleanup_failure: self.cleanup_failure,
            unrestorable: self.unrestorable,
            body: self.body,
            journal,
            parent,
            prepares: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            state: Mutex::new(FixtureState::default()),
        })
    }
}

impl fmt::Debug for FixtureBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureBuilder")
            .field("id", &self.id)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}
