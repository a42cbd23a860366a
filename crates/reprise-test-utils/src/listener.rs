//! Listener recording every event it receives

use parking_lot::Mutex;
use reprise_guard::{EngineListener, Outcome, ReportEntry, TaskNode};
use std::sync::Arc;

/// Event as seen by the real listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    Registered {
        id: String,
        name: String,
        parent: Option<String>,
    },
    Started {
        id: String,
        name: String,
    },
    Finished {
        id: String,
        name: String,
        outcome: Outcome,
    },
    Skipped {
        id: String,
        reason: String,
    },
    ReportEntry {
        id: String,
        entry: ReportEntry,
    },
}

impl RecordedEvent {
    /// Compact form, e.g. `started suite/test#2`
    pub fn line(&self) -> String {
        match self {
            Self::Registered { id, .. } => format!("registered {id}"),
            Self::Started { id, .. } => format!("started {id}"),
            Self::Finished { id, outcome, .. } => format!("finished {id} {outcome}"),
            Self::Skipped { id, reason } => format!("skipped {id} {reason}"),
            Self::ReportEntry { id, .. } => format!("report {id}"),
        }
    }
}

/// Records events in arrival order
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events in compact form
    pub fn lines(&self) -> Vec<String> {
        self.events.lock().iter().map(RecordedEvent::line).collect()
    }

    /// Outcome reported for `id`, if it finished
    pub fn outcome_of(&self, id: &str) -> Option<Outcome> {
        self.events.lock().iter().find_map(|event| match event {
            RecordedEvent::Finished { id: finished, outcome, .. } if finished == id => Some(outcome.clone()),
            _ => None,
        })
    }

    /// Display name reported when `id` finished
    pub fn finished_name_of(&self, id: &str) -> Option<String> {
        self.events.lock().iter().find_map(|event| match event {
            RecordedEvent::Finished { id: finished, name, .. } if finished == id => Some(name.clone()),
            _ => None,
        })
    }

    /// Number of `started` events for `id`
    pub fn started_count(&self, id: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, RecordedEvent::Started { id: started, .. } if started == id))
            .count()
    }

    fn record(&self, event: RecordedEvent) {
        self.events.lock().push(event);
    }
}

impl EngineListener for RecordingListener {
    fn registered(&self, node: &Arc<dyn TaskNode>) {
        self.record(RecordedEvent::Registered {
            id: node.unique_id().to_string(),
            name: node.display_name(),
            parent: node.parent().map(|parent| parent.unique_id().to_string()),
        });
    }

    fn started(&self, node: &Arc<dyn TaskNode>) {
        self.record(RecordedEvent::Started {
            id: node.unique_id().to_string(),
            name: node.display_name(),
        });
    }

    fn finished(&self, node: &Arc<dyn TaskNode>, outcome: &Outcome) {
        self.record(RecordedEvent::Finished {
            id: node.unique_id().to_string(),
            name: node.display_name(),
            outcome: outcome.clone(),
        });
    }

    fn skipped(&self, node: &Arc<dyn TaskNode>, reason: &str) {
        self.record(RecordedEvent::Skipped {
            id: node.unique_id().to_string(),
            reason: reason.to_string(),
        });
    }

    fn report_entry(&self, node: &Arc<dyn TaskNode>, entry: &ReportEntry) {
        self.record(RecordedEvent::ReportEntry {
            id: node.unique_id().to_string(),
            entry: entry.clone(),
        });
    }
}
