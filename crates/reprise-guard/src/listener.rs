//! Repeating proxy listener
//!
//! Sits between the host and its real listener. Every start opens a scope
//! keyed by the node and every finish closes it. Events of guarded nodes and
//! of nodes running below a guard are queued on the guard; everything else
//! passes straight through.

use crate::host::{EngineListener, Failure, Outcome, ReportEntry, RepetitionRole, TaskNode};
use crate::outcome;
use reprise_scope::ScopeLifecycleFacade;
use std::fmt;
use std::sync::Arc;

/// Listener proxy driving scopes and guards
pub struct RepeatingListener {
    facade: Arc<ScopeLifecycleFacade>,
    real: Arc<dyn EngineListener>,
}

impl RepeatingListener {
    /// Create proxy in front of `real`
    pub fn new(facade: Arc<ScopeLifecycleFacade>, real: Arc<dyn EngineListener>) -> Self {
        Self { facade, real }
    }

    /// Listener receiving the forwarded events
    #[inline]
    #[must_use]
    pub fn real(&self) -> &Arc<dyn EngineListener> {
        &self.real
    }

    /// Deliver now, or queue on the guard the node belongs to
    fn route(&self, node: &Arc<dyn TaskNode>, notification: impl FnOnce(&dyn EngineListener) + Send + 'static) {
        match node.repetition_role() {
            RepetitionRole::None => notification(self.real.as_ref()),
            RepetitionRole::Guard(guard) => guard.defer(notification),
            RepetitionRole::Descendant(guard) => guard.defer(notification),
        }
    }

    /// Close the scope of a node that is not repeated itself
    ///
    /// Its session, if any, is marked non-repeatable first. Retirement
    /// failures surface in the returned outcome.
    fn close_unguarded(&self, node: &Arc<dyn TaskNode>, outcome: &Outcome) -> Outcome {
        self.facade.mark_non_repeatable(node);
        if let Err(stop) = self.facade.close_scope(node, outcome.is_successful()) {
            tracing::warn!(node = %node.unique_id(), %stop, "repetition stopped for unguarded node");
        }
        let failures = self
            .facade
            .retirement_failures(node)
            .into_iter()
            .map(|failure| Failure::new(failure.to_string()))
            .collect();
        outcome::with_internal_failures(outcome.clone(), failures)
    }
}

impl EngineListener for RepeatingListener {
    fn registered(&self, node: &Arc<dyn TaskNode>) {
        let registered = Arc::clone(node);
        self.route(node, move |listener| listener.registered(&registered));
    }

    fn started(&self, node: &Arc<dyn TaskNode>) {
        self.facade.open_scope(node);
        if let RepetitionRole::Guard(guard) = node.repetition_role() {
            guard.ensure_started();
            return;
        }
        let started = Arc::clone(node);
        self.route(node, move |listener| listener.started(&started));
    }

    fn finished(&self, node: &Arc<dyn TaskNode>, outcome: &Outcome) {
        if let RepetitionRole::Guard(guard) = node.repetition_role() {
            if let Err(stop) = guard.finish_and_close_scope(outcome.clone()) {
                tracing::debug!(node = %node.unique_id(), %stop, "repetition stopped");
            }
            if guard.is_root() {
                guard.repeat_and_finalize(self.real.as_ref());
            }
            return;
        }
        let outcome = self.close_unguarded(node, outcome);
        let finished = Arc::clone(node);
        self.route(node, move |listener| listener.finished(&finished, &outcome));
    }

    fn skipped(&self, node: &Arc<dyn TaskNode>, reason: &str) {
        if let RepetitionRole::Guard(guard) = node.repetition_role() {
            guard.skip(reason, self.real.as_ref());
            return;
        }
        let skipped = Arc::clone(node);
        let reason = reason.to_string();
        self.route(node, move |listener| listener.skipped(&skipped, &reason));
    }

    fn report_entry(&self, node: &Arc<dyn TaskNode>, entry: &ReportEntry) {
        let reporting = Arc::clone(node);
        let entry = entry.clone();
        self.route(node, move |listener| listener.report_entry(&reporting, &entry));
    }
}

impl fmt::Debug for RepeatingListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatingListener")
            .field("facade", &self.facade)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EventLog, StubNode};
    use reprise_scope::{NoCombinations, RetirementPlan};

    fn proxy() -> (Arc<ScopeLifecycleFacade>, RepeatingListener, Arc<EventLog>) {
        let facade = Arc::new(ScopeLifecycleFacade::new(Arc::new(NoCombinations)));
        let log = Arc::new(EventLog::default());
        let listener = RepeatingListener::new(Arc::clone(&facade), log.clone());
        (facade, listener, log)
    }

    #[test]
    fn unguarded_events_pass_through() {
        let (facade, listener, log) = proxy();
        let node = StubNode::plain("plain");

        listener.started(&node);
        assert!(facade.configuration(&node).is_some());
        listener.finished(&node, &Outcome::Successful);

        assert_eq!(log.events(), vec!["started plain", "finished plain successful"]);
        assert!(facade.configuration(&node).unwrap().is_retired());
    }

    #[test]
    fn retirement_failure_fails_successful_node() {
        let (facade, listener, log) = proxy();
        let node = StubNode::plain("plain");

        listener.started(&node);
        facade.current_configuration().set_scoped_item(
            "socket",
            Arc::new(()),
            RetirementPlan::new(|| anyhow::bail!("close failed")),
        );
        listener.finished(&node, &Outcome::Successful);

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert!(events[1].starts_with("finished plain failed: retirement of 'socket' failed"));
    }
}
