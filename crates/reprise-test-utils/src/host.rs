//! Reference host engine
//!
//! Runs a node tree depth first: skip check, `started`, `prepare`,
//! `execute`, children, `cleanup`, `finished`. Children marked
//! [`ExecutionMode::Concurrent`] run on worker threads that inherit the
//! current configuration.

use reprise_guard::{
    with_internal_failures, EngineListener, ExecutionContext, ExecutionMode, Failure, Outcome, RepeatCoordinator,
    SkipDecision, SubExecutionLauncher, TaskNode,
};
use reprise_scope::spawn_inheriting;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

struct HostInner {
    listener: Arc<dyn EngineListener>,
    coordinator: Option<Arc<RepeatCoordinator>>,
}

/// Depth-first host engine
#[derive(Clone)]
pub struct SequentialHost {
    inner: Arc<HostInner>,
}

impl SequentialHost {
    /// Host reporting straight to `listener`, without repetition
    pub fn new(listener: Arc<dyn EngineListener>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                listener,
                coordinator: None,
            }),
        }
    }

    /// Host whose nodes and events go through `coordinator`
    pub fn with_coordinator(coordinator: Arc<RepeatCoordinator>, real: Arc<dyn EngineListener>) -> Self {
        let listener = coordinator.listener(real);
        Self {
            inner: Arc::new(HostInner {
                listener,
                coordinator: Some(coordinator),
            }),
        }
    }

    /// Run `node` and its subtree, returning the node's own outcome
    pub fn run(&self, node: Arc<dyn TaskNode>) -> Outcome {
        run_node(&self.inner, node)
    }
}

struct HostLauncher {
    host: Arc<HostInner>,
}

impl SubExecutionLauncher for HostLauncher {
    fn launch(&self, node: Arc<dyn TaskNode>) -> Outcome {
        run_node(&self.host, node)
    }
}

fn run_hook(hook: impl FnOnce() -> anyhow::Result<()>) -> Outcome {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => Outcome::from_result(result),
        Err(panic) => Outcome::Failed(Failure::from_panic(panic.as_ref())),
    }
}

fn run_node(host: &Arc<HostInner>, node: Arc<dyn TaskNode>) -> Outcome {
    let node = match &host.coordinator {
        Some(coordinator) => coordinator.intercept(node),
        None => node,
    };
    let launcher = Arc::new(HostLauncher {
        host: Arc::clone(host),
    });
    let ctx = ExecutionContext::new(launcher.clone());

    if let SkipDecision::Skip(reason) = node.should_skip(&ctx) {
        host.listener.skipped(&node, &reason);
        return Outcome::Successful;
    }

    host.listener.started(&node);
    let mut outcome = run_hook(|| node.prepare(&ctx));
    if outcome.is_successful() {
        outcome = run_hook(|| node.execute(&ctx, launcher.as_ref()));
    }
    if outcome.is_successful() {
        run_children(host, node.children());
    }
    if let Some(failure) = run_hook(|| node.cleanup(&ctx)).failure() {
        outcome = with_internal_failures(outcome, vec![failure.clone()]);
    }
    host.listener.finished(&node, &outcome);
    outcome
}

fn run_children(host: &Arc<HostInner>, children: Vec<Arc<dyn TaskNode>>) {
    let mut workers = Vec::new();
    for child in children {
        if child.execution_mode() != ExecutionMode::Concurrent {
            run_node(host, child);
            continue;
        }
        let worker_host = Arc::clone(host);
        let name = format!("host-{}", child.unique_id());
        let fallback = Arc::clone(&child);
        match spawn_inheriting(name, move || run_node(&worker_host, child)) {
            Ok(handle) => workers.push(handle),
            Err(err) => {
                tracing::warn!(%err, "could not spawn worker, running inline");
                run_node(host, fallback);
            }
        }
    }
    for worker in workers {
        if worker.join().is_err() {
            tracing::warn!("worker thread panicked");
        }
    }
}
