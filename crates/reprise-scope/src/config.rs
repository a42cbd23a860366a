//! Root configuration for a scope tree
//!
//! [`RepeatConfig`] seeds the settings of the root [`Configuration`]; every
//! scope below inherits them unless it overrides them locally.
//!
//! ```toml
//! max_total_count = 100
//! max_failure_count = 5
//!
//! [separators]
//! open = " ["
//! delimiter = ", "
//! close = "]"
//! ```
//!
//! [`Configuration`]: crate::Configuration

use crate::error::ScopeError;
use serde::{Deserialize, Serialize};

/// Separators used to render the display appendix of a repeated execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySeparators {
    /// Printed before the first fragment
    pub open: String,
    /// Printed between fragments
    pub delimiter: String,
    /// Printed after the last fragment
    pub close: String,
}

impl DisplaySeparators {
    /// Create separators
    #[must_use]
    pub fn new(
        open: impl Into<String>,
        delimiter: impl Into<String>,
        close: impl Into<String>,
    ) -> Self {
        Self {
            open: open.into(),
            delimiter: delimiter.into(),
            close: close.into(),
        }
    }

    /// Render fragments, `None` when there are none
    #[must_use]
    pub fn render(&self, fragments: &[String]) -> Option<String> {
        if fragments.is_empty() {
            return None;
        }
        Some(format!(
            "{}{}{}",
            self.open,
            fragments.join(&self.delimiter),
            self.close
        ))
    }
}

impl Default for DisplaySeparators {
    fn default() -> Self {
        Self::new(" [", ", ", "]")
    }
}

/// Repetition settings applied at the root of a scope tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeatConfig {
    /// Maximum executions per combination session (`None` = unlimited)
    pub max_total_count: Option<u64>,
    /// Maximum failed executions per combination session (`None` = unlimited)
    pub max_failure_count: Option<u64>,
    /// Display appendix separators
    pub separators: DisplaySeparators,
}

impl RepeatConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With max total count
    #[inline]
    #[must_use]
    pub fn with_max_total_count(mut self, max: u64) -> Self {
        self.max_total_count = Some(max);
        self
    }

    /// With max failure count
    #[inline]
    #[must_use]
    pub fn with_max_failure_count(mut self, max: u64) -> Self {
        self.max_failure_count = Some(max);
        self
    }

    /// With display separators
    #[inline]
    #[must_use]
    pub fn with_separators(mut self, separators: DisplaySeparators) -> Self {
        self.separators = separators;
        self
    }

    /// Parse from a TOML document and validate
    ///
    /// # Errors
    /// - `ScopeError::Parse` if the document is malformed
    /// - `ScopeError::InvalidSetting` if a limit is zero
    pub fn from_toml_str(source: &str) -> Result<Self, ScopeError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that could never allow a single execution
    ///
    /// # Errors
    /// Returns `ScopeError::InvalidSetting` for a zero limit.
    pub fn validate(&self) -> Result<(), ScopeError> {
        validate_limit("max_total_count", self.max_total_count)?;
        validate_limit("max_failure_count", self.max_failure_count)
    }
}

pub(crate) fn validate_limit(name: &'static str, value: Option<u64>) -> Result<(), ScopeError> {
    match value {
        Some(0) => Err(ScopeError::invalid_setting(name, "must be at least 1")),
        _ => Ok(()),
    }
}
