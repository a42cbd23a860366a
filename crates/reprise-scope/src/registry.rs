//! Identity-keyed registry that never keeps its keys alive
//!
//! Provides [`WeakIdentityRegistry`] for associating state with objects owned
//! by someone else (scope tokens, host task nodes) without extending their
//! lifetime.

use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Liveness probe for a weakly held key
trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

impl<K: ?Sized + Send + Sync> Liveness for Weak<K> {
    fn is_alive(&self) -> bool {
        self.strong_count() > 0
    }
}

struct Entry<V> {
    probe: Box<dyn Liveness>,
    value: V,
}

/// Address of the allocation behind `key`
fn identity<K: ?Sized>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key).cast::<()>() as usize
}

/// Map keyed by reference identity, holding keys weakly
///
/// Two keys are equal only if they are the same allocation. Entries whose
/// key has been dropped are purged on every mutating call and are never
/// returned by lookups, even if the allocator reuses the address.
///
/// Reads and removals need no external locking; the backing map is sharded.
pub struct WeakIdentityRegistry<V> {
    entries: DashMap<usize, Entry<V>>,
}

impl<V> WeakIdentityRegistry<V> {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Associate `value` with `key`, returning the previous live value
    pub fn put<K>(&self, key: &Arc<K>, value: V) -> Option<V>
    where
        K: ?Sized + Send + Sync + 'static,
    {
        self.purge();
        let entry = Entry {
            probe: Box::new(Arc::downgrade(key)),
            value,
        };
        self.entries
            .insert(identity(key), entry)
            .filter(|previous| previous.probe.is_alive())
            .map(|previous| previous.value)
    }

    /// Look up the value for `key`
    #[must_use]
    pub fn get<K: ?Sized>(&self, key: &Arc<K>) -> Option<V>
    where
        V: Clone,
    {
        let entry = self.entries.get(&identity(key))?;
        entry.probe.is_alive().then(|| entry.value.clone())
    }

    /// Check whether `key` has a live entry
    #[inline]
    #[must_use]
    pub fn contains_key<K: ?Sized>(&self, key: &Arc<K>) -> bool {
        self.entries
            .get(&identity(key))
            .is_some_and(|entry| entry.probe.is_alive())
    }

    /// Remove the entry for `key`
    pub fn remove<K: ?Sized>(&self, key: &Arc<K>) -> Option<V> {
        self.purge();
        self.entries
            .remove(&identity(key))
            .map(|(_, entry)| entry)
            .filter(|entry| entry.probe.is_alive())
            .map(|entry| entry.value)
    }

    /// Remove every entry holding `value`, returning how many were removed
    pub fn remove_by_value(&self, value: &V) -> usize
    where
        V: PartialEq,
    {
        self.remove_matching(|candidate| candidate == value)
    }

    /// Remove every entry whose value satisfies `predicate`
    pub fn remove_matching(&self, mut predicate: impl FnMut(&V) -> bool) -> usize {
        self.purge();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !predicate(&entry.value));
        before.saturating_sub(self.entries.len())
    }

    /// Snapshot of all live values
    #[must_use]
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.entries
            .iter()
            .filter(|entry| entry.probe.is_alive())
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.probe.is_alive())
            .count()
    }

    /// Check if there are no live entries
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose key is gone
    pub fn purge(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.probe.is_alive());
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            tracing::trace!(purged, "purged unreachable registry entries");
        }
    }

    /// Remove everything
    #[inline]
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<V> Default for WeakIdentityRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for WeakIdentityRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakIdentityRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
