//! Deferred listener notifications
//!
//! A [`DeferredNotificationQueue`] records listener calls while the final
//! shape of a node (display name, parent, outcome) is still unsettled and
//! replays them later, in order, exactly once. Queues nest: a nested queue
//! is replayed at the position it was nested at, including entries appended
//! to it after nesting.
//!
//! Neither firing nor dropping recurses per nesting level.

use crate::host::EngineListener;
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::Arc;

/// A deferred listener call
pub type Notification = Box<dyn FnOnce(&dyn EngineListener) + Send>;

enum Entry {
    Call(Notification),
    Nested(Arc<DeferredNotificationQueue>),
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    fired: bool,
}

/// Ordered, fire-once queue of listener calls
#[derive(Default)]
pub struct DeferredNotificationQueue {
    state: Mutex<QueueState>,
}

impl DeferredNotificationQueue {
    /// Create empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener call
    ///
    /// Returns `false` and drops `notification` if the queue already fired.
    pub fn push(&self, notification: impl FnOnce(&dyn EngineListener) + Send + 'static) -> bool {
        self.append(Entry::Call(Box::new(notification)))
    }

    /// Append `queue`, to be replayed at this position
    ///
    /// Returns `false` if this queue already fired.
    pub fn nest(&self, queue: Arc<DeferredNotificationQueue>) -> bool {
        self.append(Entry::Nested(queue))
    }

    fn append(&self, entry: Entry) -> bool {
        let mut state = self.state.lock();
        if state.fired {
            tracing::trace!("discarding notification appended after fire");
            return false;
        }
        state.entries.push(entry);
        true
    }

    /// Number of entries at this level
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if nothing is queued at this level
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has fired
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// Replay every queued call on `listener`, returning how many ran
    ///
    /// Only the first call replays anything. No lock is held while the
    /// listener runs.
    pub fn fire(&self, listener: &dyn EngineListener) -> usize {
        let Some(entries) = self.take_for_fire() else {
            return 0;
        };

        let mut fired = 0;
        let mut stack = vec![entries.into_iter()];
        while let Some(level) = stack.last_mut() {
            match level.next() {
                Some(Entry::Call(notification)) => {
                    notification(listener);
                    fired += 1;
                }
                Some(Entry::Nested(queue)) => {
                    if let Some(entries) = queue.take_for_fire() {
                        stack.push(entries.into_iter());
                    }
                }
                None => {
                    stack.pop();
                }
            }
        }
        tracing::trace!(fired, "fired deferred notifications");
        fired
    }

    fn take_for_fire(&self) -> Option<Vec<Entry>> {
        let mut state = self.state.lock();
        if mem::replace(&mut state.fired, true) {
            return None;
        }
        Some(mem::take(&mut state.entries))
    }
}

impl Drop for DeferredNotificationQueue {
    fn drop(&mut self) {
        let mut pending = mem::take(&mut self.state.get_mut().entries);
        while let Some(entry) = pending.pop() {
            if let Entry::Nested(queue) = entry {
                if let Some(mut queue) = Arc::into_inner(queue) {
                    pending.append(&mut queue.state.get_mut().entries);
                }
            }
        }
    }
}

impl fmt::Debug for DeferredNotificationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DeferredNotificationQueue")
            .field("entries", &state.entries.len())
            .field("fired", &state.fired)
            .finish()
    }
}
