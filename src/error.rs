use std::io;
use thiserror::Error;

/// Everything that can go wrong while building or running a runtime.
///
/// Startup failures are surfaced through [`crate::start`]; once the thread
/// set is live the runtime handles its own faults (see the per-thread
/// policies in the scheduler).
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown service type {0:?}")]
    UnknownService(String),

    #[error("service {name:?} failed to start: {reason}")]
    ServiceStart { name: String, reason: String },

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("handle space exhausted")]
    HandleExhausted,

    #[error("daemon: {0}")]
    Daemon(String),

    #[error("record file: {0}")]
    Record(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
