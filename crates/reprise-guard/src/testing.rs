//! Minimal nodes and listeners for unit tests

use crate::host::{EngineListener, ExecutionContext, NodeId, Outcome, SubExecutionLauncher, TaskNode};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct StubNode {
    id: &'static str,
    repeatable: bool,
    parent: Option<Arc<dyn TaskNode>>,
}

impl StubNode {
    pub(crate) fn plain(id: &'static str) -> Arc<dyn TaskNode> {
        Arc::new(Self {
            id,
            repeatable: false,
            parent: None,
        })
    }

    pub(crate) fn repeatable(id: &'static str) -> Arc<dyn TaskNode> {
        Arc::new(Self {
            id,
            repeatable: true,
            parent: None,
        })
    }

    pub(crate) fn child_of(id: &'static str, parent: &Arc<dyn TaskNode>, repeatable: bool) -> Arc<dyn TaskNode> {
        Arc::new(Self {
            id,
            repeatable,
            parent: Some(Arc::clone(parent)),
        })
    }
}

impl TaskNode for StubNode {
    fn unique_id(&self) -> NodeId {
        NodeId::new(self.id)
    }

    fn display_name(&self) -> String {
        self.id.to_string()
    }

    fn parent(&self) -> Option<Arc<dyn TaskNode>> {
        self.parent.clone()
    }

    fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    fn execute(&self, _ctx: &ExecutionContext, _launcher: &dyn SubExecutionLauncher) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records events as `"<event> <id>"` strings
#[derive(Default)]
pub(crate) struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    pub(crate) fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn push(&self, event: String) {
        self.0.lock().push(event);
    }
}

impl EngineListener for EventLog {
    fn registered(&self, node: &Arc<dyn TaskNode>) {
        self.push(format!("registered {}", node.unique_id()));
    }

    fn started(&self, node: &Arc<dyn TaskNode>) {
        self.push(format!("started {}", node.unique_id()));
    }

    fn finished(&self, node: &Arc<dyn TaskNode>, outcome: &Outcome) {
        self.push(format!("finished {} {outcome}", node.unique_id()));
    }

    fn skipped(&self, node: &Arc<dyn TaskNode>, reason: &str) {
        self.push(format!("skipped {} {reason}", node.unique_id()));
    }
}
