//! Host execution-engine protocol
//!
//! The host owns a tree of [`TaskNode`]s and reports their lifecycle to an
//! [`EngineListener`]. Guards implement [`TaskNode`] themselves, and the
//! repeating proxy implements [`EngineListener`].

use crate::guard::ExecutionGuard;
use crate::preserve::Snapshottable;
use indexmap::IndexMap;
use reprise_scope::panic_message;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Unique identifier of a task node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Create from string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier of the `execution`-th run of this node
    #[must_use]
    pub fn execution(&self, execution: usize) -> Self {
        Self(format!("{}#{execution}", self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Failure reported for a node, with failures attached to it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Failure {
    message: String,
    suppressed: Vec<Failure>,
}

impl Failure {
    /// Create from message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suppressed: Vec::new(),
        }
    }

    /// Create from any error, keeping its cause chain in the message
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }

    /// Create from a caught panic payload
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(format!("panicked: {}", panic_message(payload)))
    }

    /// Attach `failure` to this one
    #[must_use]
    pub fn with_suppressed(mut self, failure: Failure) -> Self {
        self.suppressed.push(failure);
        self
    }

    /// Attach several failures to this one
    pub fn suppress_all(&mut self, failures: impl IntoIterator<Item = Failure>) {
        self.suppressed.extend(failures);
    }

    /// Failure message
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attached failures
    #[inline]
    #[must_use]
    pub fn suppressed(&self) -> &[Failure] {
        &self.suppressed
    }
}

/// Raised by node code to abort rather than fail an execution
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct AbortExecution(pub String);

/// Result of one node execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Ran to completion
    Successful,
    /// Aborted, e.g. a precondition did not hold
    Aborted(Failure),
    /// Failed
    Failed(Failure),
}

impl Outcome {
    /// Map a hook result, treating [`AbortExecution`] as an abort
    #[must_use]
    pub fn from_result(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self::Successful,
            Err(err) if err.is::<AbortExecution>() => Self::Aborted(Failure::from_error(&err)),
            Err(err) => Self::Failed(Failure::from_error(&err)),
        }
    }

    /// Check if the execution succeeded
    #[inline]
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Successful)
    }

    /// Check if the execution was aborted
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Failure carried by this outcome
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Successful => None,
            Self::Aborted(failure) | Self::Failed(failure) => Some(failure),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Successful => f.write_str("successful"),
            Self::Aborted(failure) => write!(f, "aborted: {failure}"),
            Self::Failed(failure) => write!(f, "failed: {failure}"),
        }
    }
}

/// How the host may schedule a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Run on the thread of its parent
    #[default]
    SameThread,
    /// May run concurrently with its siblings
    Concurrent,
}

/// Result of a skip check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    /// Execute the node
    Proceed,
    /// Skip the node for the given reason
    Skip(String),
}

/// Key/value entry published while a node runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportEntry {
    /// Published values, in publication order
    pub values: IndexMap<String, String>,
}

impl ReportEntry {
    /// Entry with a single key/value pair
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = IndexMap::new();
        values.insert(key.into(), value.into());
        Self { values }
    }
}

/// Launches a node as a sub-execution of the running one
pub trait SubExecutionLauncher: Send + Sync {
    /// Run `node` to completion, returning its outcome
    fn launch(&self, node: Arc<dyn TaskNode>) -> Outcome;
}

/// Per-node execution context handed to lifecycle hooks
#[derive(Clone)]
pub struct ExecutionContext {
    launcher: Arc<dyn SubExecutionLauncher>,
}

impl ExecutionContext {
    /// Context of a node launched by `launcher`
    pub fn new(launcher: Arc<dyn SubExecutionLauncher>) -> Self {
        Self { launcher }
    }

    /// Launcher that started this node; runs siblings of it
    #[inline]
    #[must_use]
    pub fn launcher(&self) -> &Arc<dyn SubExecutionLauncher> {
        &self.launcher
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

/// How a node takes part in repetition
#[doc(hidden)]
pub enum RepetitionRole<'a> {
    /// Not guarded
    None,
    /// The node is a guard
    Guard(&'a ExecutionGuard),
    /// The node runs below a guard
    Descendant(Arc<ExecutionGuard>),
}

/// Unit of executable work in the host's tree
///
/// Every hook except [`TaskNode::execute`] has a no-op default.
pub trait TaskNode: Send + Sync {
    /// Unique identifier
    fn unique_id(&self) -> NodeId;

    /// Human readable name
    fn display_name(&self) -> String;

    /// Parent node, `None` for the tree root
    fn parent(&self) -> Option<Arc<dyn TaskNode>> {
        None
    }

    /// Statically known children, run after [`TaskNode::execute`]
    fn children(&self) -> Vec<Arc<dyn TaskNode>> {
        Vec::new()
    }

    /// Scheduling mode
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::SameThread
    }

    /// Whether the node may run once per pending combination
    fn is_repeatable(&self) -> bool {
        false
    }

    /// One-time setup before execution
    ///
    /// # Errors
    /// A returned error fails (or aborts) the execution.
    fn prepare(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether to skip this node
    fn should_skip(&self, _ctx: &ExecutionContext) -> SkipDecision {
        SkipDecision::Proceed
    }

    /// Run the node; `launcher` runs dynamically discovered children
    ///
    /// # Errors
    /// A returned error fails (or aborts) the execution.
    fn execute(&self, ctx: &ExecutionContext, launcher: &dyn SubExecutionLauncher) -> anyhow::Result<()>;

    /// Teardown after execution and children
    ///
    /// # Errors
    /// A returned error is merged into the execution's outcome.
    fn cleanup(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// State that repeated executions may restore instead of re-running setup
    fn as_snapshottable(&self) -> Option<&dyn Snapshottable> {
        None
    }

    #[doc(hidden)]
    fn repetition_role(&self) -> RepetitionRole<'_> {
        RepetitionRole::None
    }
}

/// Receives node lifecycle events
pub trait EngineListener: Send + Sync {
    /// A dynamically created node was registered
    fn registered(&self, _node: &Arc<dyn TaskNode>) {}

    /// A node started
    fn started(&self, _node: &Arc<dyn TaskNode>) {}

    /// A node finished
    fn finished(&self, _node: &Arc<dyn TaskNode>, _outcome: &Outcome) {}

    /// A node was skipped
    fn skipped(&self, _node: &Arc<dyn TaskNode>, _reason: &str) {}

    /// A node published a report entry
    fn report_entry(&self, _node: &Arc<dyn TaskNode>, _entry: &ReportEntry) {}
}

/// Listener that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl EngineListener for NoopListener {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_maps_to_aborted() {
        let outcome = Outcome::from_result(Err(AbortExecution("precondition".into()).into()));
        assert!(outcome.is_aborted());
        assert_eq!(outcome.failure().map(Failure::message), Some("precondition"));
    }

    #[test]
    fn error_maps_to_failed() {
        let outcome = Outcome::from_result(Err(anyhow::anyhow!("boom")));
        assert_eq!(outcome, Outcome::Failed(Failure::new("boom")));
        assert!(Outcome::from_result(Ok(())).is_successful());
    }

    #[test]
    fn execution_ids() {
        let id = NodeId::new("suite/test");
        assert_eq!(id.execution(3).as_str(), "suite/test#3");
    }

    #[test]
    fn suppressed_failures_accumulate() {
        let mut failure = Failure::new("primary").with_suppressed(Failure::new("first"));
        failure.suppress_all([Failure::new("second")]);
        let messages: Vec<_> = failure.suppressed().iter().map(Failure::message).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }
}
