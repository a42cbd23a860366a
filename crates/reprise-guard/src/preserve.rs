//! Best-effort state preservation across repeated executions
//!
//! A node opts in by implementing [`Snapshottable`]. After its first real
//! `prepare`, the guard captures a [`PreservedState`]; later executions
//! restore it instead of running setup again. Restoring is per field: a
//! field that cannot be restored is skipped and reported, and never stops
//! the others.

use reprise_scope::panic_message;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Kind of a captured field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Single value
    Scalar,
    /// Collection with the given number of elements
    Collection {
        /// Element count at capture time
        len: usize,
    },
}

/// Captured value of one field
#[derive(Clone)]
pub struct FieldSnapshot {
    name: String,
    kind: FieldKind,
    value: Arc<dyn Any + Send + Sync>,
}

impl FieldSnapshot {
    /// Capture a scalar field
    pub fn scalar<T: Any + Send + Sync>(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar,
            value: Arc::new(value),
        }
    }

    /// Capture a collection field
    pub fn collection<T: Any + Send + Sync>(name: impl Into<String>, elements: Vec<T>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Collection { len: elements.len() },
            value: Arc::new(elements),
        }
    }

    /// Field name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Captured value, if it has type `T`
    ///
    /// Collections are stored as `Vec<T>`.
    #[must_use]
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    fn is_empty_collection(&self) -> bool {
        self.kind == FieldKind::Collection { len: 0 }
    }
}

impl fmt::Debug for FieldSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSnapshot")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A field that could not be restored
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("field '{field}' not restored: {reason}")]
pub struct RestoreSkip {
    /// Field name
    pub field: String,
    /// Why it was skipped
    pub reason: String,
}

impl RestoreSkip {
    /// Create for `field`
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Node state that can be captured and restored field by field
pub trait Snapshottable: Send + Sync {
    /// Capture every mutable field
    fn capture(&self) -> Vec<FieldSnapshot>;

    /// Write one captured field back
    ///
    /// # Errors
    /// Returns `RestoreSkip` if the field cannot be restored.
    fn restore_field(&self, field: &FieldSnapshot) -> Result<(), RestoreSkip>;
}

/// Outcome of a restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Restored field names
    pub restored: Vec<String>,
    /// Fields that were skipped
    pub skipped: Vec<RestoreSkip>,
}

impl RestoreReport {
    /// Check if every field was restored
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Snapshot of a node taken after its first setup
#[derive(Debug, Clone, Default)]
pub struct PreservedState {
    fields: Vec<FieldSnapshot>,
}

impl PreservedState {
    /// Capture `target`, leaving out empty collections
    #[must_use]
    pub fn capture(target: &dyn Snapshottable) -> Self {
        let fields: Vec<_> = target
            .capture()
            .into_iter()
            .filter(|field| !field.is_empty_collection())
            .collect();
        tracing::trace!(fields = fields.len(), "captured preserved state");
        Self { fields }
    }

    /// Captured fields
    #[inline]
    #[must_use]
    pub fn fields(&self) -> &[FieldSnapshot] {
        &self.fields
    }

    /// Check if nothing was captured
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Restore every captured field onto `target`
    ///
    /// Errors and panics of single fields are reported as skipped.
    pub fn restore_onto(&self, target: &dyn Snapshottable) -> RestoreReport {
        let mut report = RestoreReport::default();
        for field in &self.fields {
            let result = catch_unwind(AssertUnwindSafe(|| target.restore_field(field)))
                .unwrap_or_else(|panic| Err(RestoreSkip::new(field.name(), panic_message(panic.as_ref()))));
            match result {
                Ok(()) => report.restored.push(field.name().to_string()),
                Err(skip) => {
                    tracing::debug!(%skip, "skipping field during restore");
                    report.skipped.push(skip);
                }
            }
        }
        report
    }
}
