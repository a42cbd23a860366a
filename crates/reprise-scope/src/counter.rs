//! Repetition counters per combination session

use serde::{Deserialize, Serialize};

/// Running counts for one active combination session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepeatCounter {
    total_count: u64,
    failure_count: u64,
}

impl RepeatCounter {
    /// Count one finished execution
    #[inline]
    pub fn record(&mut self, succeeded: bool) {
        self.total_count += 1;
        if !succeeded {
            self.failure_count += 1;
        }
    }

    /// Executions counted so far
    #[inline]
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Failed executions counted so far
    #[inline]
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    /// `N tests failed (total M)`
    #[must_use]
    pub fn summary_message(&self) -> String {
        format!(
            "{} tests failed (total {})",
            self.failure_count, self.total_count
        )
    }

    /// Freeze into a terminal summary
    #[must_use]
    pub fn summary(&self) -> RepeatSummary {
        RepeatSummary {
            total_count: self.total_count,
            failure_count: self.failure_count,
            message: (self.failure_count > 0).then(|| self.summary_message()),
        }
    }
}

/// Terminal result of a combination session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatSummary {
    /// Executions performed
    pub total_count: u64,
    /// Executions that failed
    pub failure_count: u64,
    /// Terminal message, present when at least one execution failed
    pub message: Option<String>,
}

impl RepeatSummary {
    /// Whether more than one execution happened
    #[inline]
    #[must_use]
    pub fn was_repeated(&self) -> bool {
        self.total_count > 1
    }
}
