//! Contract with the combinatorial engine
//!
//! The engine decides which input combinations remain; this crate only asks,
//! advances, and prevents repetition.

use crate::error::InconsistentCombination;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one combination session
///
/// A session spans every repeated execution of the same task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a fresh session identity
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    #[inline]
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// External collaborator deciding whether combinations remain
pub trait CombinatorialEngine: Send + Sync {
    /// Whether `session` still has an unexplored combination
    ///
    /// `succeeded` is the outcome of the execution that just finished.
    ///
    /// # Errors
    /// Returns `InconsistentCombination` when the session contradicts itself.
    fn has_pending_combination(
        &self,
        session: SessionId,
        succeeded: bool,
    ) -> Result<bool, InconsistentCombination>;

    /// Advance `session` to its next combination
    fn start_new_combination(&self, session: SessionId);

    /// Forbid further repetition of `session`
    fn mark_non_repeatable(&self, session: SessionId);
}

/// Engine that never has anything pending
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCombinations;

impl CombinatorialEngine for NoCombinations {
    fn has_pending_combination(
        &self,
        _session: SessionId,
        _succeeded: bool,
    ) -> Result<bool, InconsistentCombination> {
        Ok(false)
    }

    fn start_new_combination(&self, _session: SessionId) {}

    fn mark_non_repeatable(&self, _session: SessionId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn no_combinations_never_pending() {
        let engine = NoCombinations;
        assert_eq!(engine.has_pending_combination(SessionId::new(), false), Ok(false));
    }
}
