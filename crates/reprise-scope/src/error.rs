//! Error types for scope management
//!
//! Provides error handling for:
//! - Retirement callbacks (collected, never propagated)
//! - Repetition limits (terminal control signal)
//! - Combinatorial engine inconsistencies
//! - Configuration validation

use crate::counter::RepeatCounter;

/// Errors raised by scope and configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// The configuration was already retired
    #[error("configuration '{0}' is retired")]
    Retired(String),

    /// A setting was given an unusable value
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting {
        /// Setting name
        name: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration document could not be parsed
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ScopeError {
    /// Create invalid setting error
    pub fn invalid_setting(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }
}

/// Failure of a single retirement callback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("retirement of '{key}' failed: {message}")]
pub struct RetirementFailure {
    /// Key of the retired item
    pub key: String,
    /// Error or panic message
    pub message: String,
}

/// Contradiction reported by the combinatorial engine
///
/// For example a parameter value that changed in the middle of a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("inconsistent combination: {0}")]
pub struct InconsistentCombination(pub String);

impl InconsistentCombination {
    /// Create from message
    #[inline]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Which limit stopped the repetition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRepeatKind {
    /// `max_total_count` reached
    TotalCount,
    /// `max_failure_count` reached
    FailureCount,
    /// The engine reported an inconsistency
    Inconsistent,
}

/// Terminal signal: no further repetition of the session
///
/// Callers must treat this as final for the repetition loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{summary}")]
pub struct MaxRepeatCount {
    /// Which limit was hit
    pub kind: MaxRepeatKind,
    /// Human readable summary, e.g. `3 tests failed (total 4)`
    pub summary: String,
    /// Executions counted for the session
    pub total_count: u64,
    /// Failed executions counted for the session
    pub failure_count: u64,
    /// Max total was reached by the very first execution.
    ///
    /// Repetition was disabled by configuration rather than exhausted.
    pub reached_max_total_count_at_one: bool,
    /// Originating inconsistency, if any
    #[source]
    pub cause: Option<InconsistentCombination>,
}

impl MaxRepeatCount {
    pub(crate) fn total(counter: &RepeatCounter) -> Self {
        let at_one = counter.total_count() == 1;
        let summary = if at_one {
            "repetition disabled: max total count is 1".to_string()
        } else {
            counter.summary_message()
        };
        Self {
            kind: MaxRepeatKind::TotalCount,
            summary,
            total_count: counter.total_count(),
            failure_count: counter.failure_count(),
            reached_max_total_count_at_one: at_one,
            cause: None,
        }
    }

    pub(crate) fn failures(counter: &RepeatCounter) -> Self {
        Self {
            kind: MaxRepeatKind::FailureCount,
            summary: counter.summary_message(),
            total_count: counter.total_count(),
            failure_count: counter.failure_count(),
            reached_max_total_count_at_one: false,
            cause: None,
        }
    }

    pub(crate) fn inconsistent(counter: &RepeatCounter, cause: InconsistentCombination) -> Self {
        Self {
            kind: MaxRepeatKind::Inconsistent,
            summary: format!("{} after {}", cause, counter.summary_message()),
            total_count: counter.total_count(),
            failure_count: counter.failure_count(),
            reached_max_total_count_at_one: false,
            cause: Some(cause),
        }
    }

    /// Repetition was effectively switched off, not exhausted
    #[inline]
    #[must_use]
    pub fn is_repetition_disabled(&self) -> bool {
        self.reached_max_total_count_at_one
    }
}
