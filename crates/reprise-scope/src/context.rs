//! Current configuration of the calling thread
//!
//! Each thread tracks the innermost open [`Configuration`]. Worker threads do
//! not inherit it automatically: capture a [`ContextSnapshot`] on the
//! spawning thread and enter it on the worker, or use [`spawn_inheriting`].

use crate::configuration::Configuration;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Configuration>>> = const { RefCell::new(None) };
}

/// Configuration installed on this thread, if any
#[must_use]
pub fn installed_configuration() -> Option<Arc<Configuration>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn install(config: Option<Arc<Configuration>>) -> Option<Arc<Configuration>> {
    CURRENT.with(|current| std::mem::replace(&mut *current.borrow_mut(), config))
}

/// Step back to the parent if `config` is the installed one
pub(crate) fn leave(config: &Arc<Configuration>) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.as_ref().is_some_and(|installed| Arc::ptr_eq(installed, config)) {
            *current = config.parent().cloned();
        }
    });
}

/// Drop the installed configuration if it belongs to `tree`
pub(crate) fn clear_tree(tree: u64) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.as_ref().is_some_and(|installed| installed.tree() == tree) {
            *current = None;
        }
    });
}

/// Captured current configuration, to be entered on another thread
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    config: Option<Arc<Configuration>>,
}

impl ContextSnapshot {
    /// Capture the calling thread's current configuration
    #[must_use]
    pub fn capture() -> Self {
        Self { config: installed_configuration() }
    }

    /// Captured configuration
    #[inline]
    #[must_use]
    pub fn configuration(&self) -> Option<&Arc<Configuration>> {
        self.config.as_ref()
    }

    /// Install on the calling thread until the returned guard drops
    #[must_use = "the snapshot is left as soon as the guard drops"]
    pub fn enter(&self) -> EnteredContext {
        EnteredContext {
            previous: install(self.config.clone()),
            _not_send: PhantomData,
        }
    }

    /// Run `f` with the snapshot installed
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _entered = self.enter();
        f()
    }
}

/// Restores the previous configuration on drop
///
/// Bound to the thread that entered it.
#[derive(Debug)]
pub struct EnteredContext {
    previous: Option<Arc<Configuration>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for EnteredContext {
    fn drop(&mut self) {
        install(self.previous.take());
    }
}

/// Spawn a thread that starts with the caller's current configuration
///
/// # Errors
/// Returns the OS error if the thread cannot be spawned.
pub fn spawn_inheriting<F, T>(name: impl Into<String>, f: F) -> std::io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let snapshot = ContextSnapshot::capture();
    thread::Builder::new()
        .name(name.into())
        .spawn(move || snapshot.run(f))
}
