//! Collector thread identity and shutdown coordination.
//!
//! Long-lived collector threads block in rendezvous points, task batches and
//! the relocation gate. Each of those waits re-checks
//! [`CollectorThread::should_terminate`] so that process exit can unblock a
//! thread whose partner has already gone away.

use crate::error::{SyncError, SyncResult};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Runtime-wide termination flag shared by every collector thread.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Handle for a collector-control thread.
///
/// # Examples
///
/// ```
/// use pauseless_sync::collector_thread::{CollectorThread, ShutdownSignal};
/// use std::sync::Arc;
///
/// let shutdown = Arc::new(ShutdownSignal::new());
/// let thread = CollectorThread::new("new-gc", Arc::clone(&shutdown));
/// assert!(!thread.should_terminate());
///
/// shutdown.request();
/// assert!(thread.should_terminate());
/// assert!(thread.check_terminate().is_err());
/// ```
pub struct CollectorThread {
    name: String,
    blocked: AtomicBool,
    terminate: AtomicBool,
    shutdown: Arc<ShutdownSignal>,
}

impl CollectorThread {
    pub fn new(name: impl Into<String>, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            name: name.into(),
            blocked: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
            shutdown,
        }
    }

    /// A collector thread with its own private shutdown signal.
    pub fn standalone(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(ShutdownSignal::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask this particular thread to wind down.
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate.load(Ordering::Acquire) || self.shutdown.is_requested()
    }

    /// `Err(ShuttingDown)` once termination has been requested.
    pub fn check_terminate(&self) -> SyncResult<()> {
        if self.should_terminate() {
            Err(SyncError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Whether the thread is currently parked in a collector-side wait.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }

    /// Mark the thread blocked until the returned guard is dropped.
    pub fn blocked_scope(&self) -> BlockedScope<'_> {
        self.set_blocked(true);
        BlockedScope { thread: self }
    }
}

impl fmt::Debug for CollectorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorThread")
            .field("name", &self.name)
            .field("blocked", &self.is_blocked())
            .field("should_terminate", &self.should_terminate())
            .finish()
    }
}

/// RAII guard returned by [`CollectorThread::blocked_scope`].
pub struct BlockedScope<'a> {
    thread: &'a CollectorThread,
}

impl Drop for BlockedScope<'_> {
    fn drop(&mut self) {
        self.thread.set_blocked(false);
    }
}
