//! Error types for the synchronization layer.
//!
//! Protocol violations (overlapping batches, a third rendezvous arrival, a
//! non-empty queue where an empty one is required) are programming errors and
//! panic through assertions. The variants here cover the designed failure
//! paths: bad configuration, resource exhaustion at construction time, and the
//! orderly unwinding of collector threads during shutdown.

use thiserror::Error;

/// Errors that can occur while coordinating mutator and collector threads.
///
/// # Examples
///
/// ```
/// use pauseless_sync::error::{SyncError, SyncResult};
///
/// let shutdown = SyncError::ShuttingDown;
/// let config = SyncError::InvalidConfig("poll interval must be non-zero".to_string());
///
/// let success: SyncResult<u32> = Ok(42);
/// let failure: SyncResult<u32> = Err(SyncError::NoWorkers);
///
/// assert!(success.is_ok());
/// assert!(failure.is_err());
/// assert_eq!(shutdown.to_string(), "Runtime is shutting down");
/// assert_eq!(
///     config.to_string(),
///     "Invalid configuration: poll interval must be non-zero"
/// );
/// ```
#[derive(Error, Debug)]
pub enum SyncError {
    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A task manager was asked to run with an empty worker pool
    #[error("Task manager requires at least one worker")]
    NoWorkers,
    /// The calling collector thread observed process termination while waiting
    #[error("Runtime is shutting down")]
    ShuttingDown,
    /// The OS refused to start a worker thread
    #[error("Failed to spawn worker thread {name}: {source}")]
    WorkerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    /// The mutator is not (or no longer) attached to the runtime
    #[error("Thread {0} is not registered")]
    ThreadNotRegistered(usize),
}

/// Result type for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;
