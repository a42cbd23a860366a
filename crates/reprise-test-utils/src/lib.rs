//! Testing utilities for the Reprise workspace
//!
//! A sequential reference host, a scripted combinatorial engine, a recording
//! listener and a snapshottable fixture node.

#![allow(missing_docs)]

mod engine;
mod fixture;
mod host;
mod listener;

pub use engine::{EngineCall, ScriptedEngine};
pub use fixture::{FixtureBuilder, FixtureNode, Journal};
pub use host::SequentialHost;
pub use listener::{RecordedEvent, RecordingListener};

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

static TEST_LOGGING: Lazy<()> = Lazy::new(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
});

/// Install a test-writer subscriber once, filtered by `RUST_LOG`
pub fn init_test_logging() {
    Lazy::force(&TEST_LOGGING);
}
