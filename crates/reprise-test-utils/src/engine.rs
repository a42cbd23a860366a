//! Scripted combinatorial engine

use parking_lot::Mutex;
use reprise_scope::{CombinatorialEngine, InconsistentCombination, ScopeLifecycleFacade, SessionId};
use std::collections::VecDeque;
use std::sync::Arc;

/// Call received by a [`ScriptedEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Pending { succeeded: bool },
    StartNew,
    NonRepeatable,
}

/// Engine answering `has_pending_combination` from a script
///
/// Once the script runs out nothing is pending.
#[derive(Debug)]
pub struct ScriptedEngine {
    session: SessionId,
    script: Mutex<VecDeque<Result<bool, InconsistentCombination>>>,
    calls: Mutex<Vec<EngineCall>>,
}

impl ScriptedEngine {
    /// Engine whose n-th pending check answers `script[n]`
    pub fn new(script: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Self::with_answers(script.into_iter().map(Ok))
    }

    /// Engine that may also report inconsistencies
    pub fn with_answers(answers: impl IntoIterator<Item = Result<bool, InconsistentCombination>>) -> Arc<Self> {
        Arc::new(Self {
            session: SessionId::new(),
            script: Mutex::new(answers.into_iter().collect()),
            calls: Mutex::default(),
        })
    }

    /// Session this engine binds
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Bind the session to the calling thread's current configuration
    ///
    /// Leaves a session that is already bound, e.g. one handed over from a
    /// previous execution, untouched.
    pub fn bind_current(&self, facade: &ScopeLifecycleFacade) -> anyhow::Result<()> {
        let config = facade.current_configuration();
        if config.session().is_none() {
            config.bind_session(self.session)?;
        }
        Ok(())
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Number of `start_new_combination` calls
    pub fn started_combinations(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| **call == EngineCall::StartNew)
            .count()
    }

    /// Whether `mark_non_repeatable` was called
    pub fn was_marked_non_repeatable(&self) -> bool {
        self.calls.lock().contains(&EngineCall::NonRepeatable)
    }

    /// Script entries not consumed yet
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl CombinatorialEngine for ScriptedEngine {
    fn has_pending_combination(
        &self,
        _session: SessionId,
        succeeded: bool,
    ) -> Result<bool, InconsistentCombination> {
        self.calls.lock().push(EngineCall::Pending { succeeded });
        self.script.lock().pop_front().unwrap_or(Ok(false))
    }

    fn start_new_combination(&self, _session: SessionId) {
        self.calls.lock().push(EngineCall::StartNew);
    }

    fn mark_non_repeatable(&self, _session: SessionId) {
        self.calls.lock().push(EngineCall::NonRepeatable);
    }
}
