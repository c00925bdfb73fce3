//! Synchronization configuration.
//!
//! Every knob is fixed when the runtime is built; nothing here is consulted
//! for reconfiguration while an episode or batch is in flight.

use crate::error::{SyncError, SyncResult};
use std::time::Duration;

/// What to do when threads fail to reach a safepoint or checkpoint in time.
///
/// The delay only triggers diagnostics. With `fatal` set the coordinator
/// panics after dumping the unresponsive threads; otherwise it keeps polling
/// until every thread checks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Time after which unresponsive threads are reported
    pub delay: Duration,
    /// Whether reaching the delay aborts the episode with a panic
    pub fatal: bool,
}

impl TimeoutPolicy {
    /// Report after `delay`, keep waiting afterwards.
    pub const fn warn_after(delay: Duration) -> Self {
        Self {
            delay,
            fatal: false,
        }
    }

    /// Report after `delay` and then panic.
    pub const fn fatal_after(delay: Duration) -> Self {
        Self { delay, fatal: true }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::warn_after(Duration::from_secs(10))
    }
}

/// Configuration for the synchronization runtime.
///
/// # Example
///
/// ```
/// use pauseless_sync::config::{SyncConfig, TimeoutPolicy};
/// use std::time::Duration;
///
/// let config = SyncConfig {
///     worker_count: 8,
///     safepoint_timeout: TimeoutPolicy::fatal_after(Duration::from_secs(2)),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    // =========================================================================
    // Task pool
    // =========================================================================
    /// Number of task worker threads per task manager.
    ///
    /// Fixed at construction. Every batch is handed to all workers.
    ///
    /// Default: 4
    pub worker_count: usize,

    /// Record per-task entry/exit timestamps on each worker.
    ///
    /// Default: false
    pub record_task_timestamps: bool,

    /// Number of timestamp records kept per worker before the oldest are dropped.
    ///
    /// Default: 256
    pub task_timestamp_capacity: usize,

    // =========================================================================
    // Safepoints and checkpoints
    // =========================================================================
    /// Diagnostic timeout for `begin()`.
    ///
    /// Default: 10s, non-fatal
    pub safepoint_timeout: TimeoutPolicy,

    /// Diagnostic timeout for `do_checkpoint()`.
    ///
    /// Default: 10s, non-fatal
    pub checkpoint_timeout: TimeoutPolicy,

    /// Sleep between passes over threads that have not yet yielded their lock.
    ///
    /// Default: 500us
    pub safepoint_poll_interval: Duration,

    /// Unproductive checkpoint passes before pending threads get a priority boost.
    ///
    /// Default: 2
    pub priority_boost_passes: u32,

    /// Priority handed to the scheduler when boosting a straggler.
    ///
    /// Default: 10
    pub boost_priority: i32,

    /// Minimum gap between the end of one safepoint and the start of the next.
    ///
    /// Default: zero (no spacing)
    pub min_safepoint_spacing: Duration,

    // =========================================================================
    // Collector-side waits
    // =========================================================================
    /// Wake-up interval while waiting for relocating workers to drain.
    ///
    /// Default: 20ms
    pub quiescence_poll_interval: Duration,

    /// Wake-up interval of every other collector-side wait, used to notice
    /// process termination.
    ///
    /// Default: 50ms
    pub shutdown_poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            record_task_timestamps: false,
            task_timestamp_capacity: 256,
            safepoint_timeout: TimeoutPolicy::default(),
            checkpoint_timeout: TimeoutPolicy::default(),
            safepoint_poll_interval: Duration::from_micros(500),
            priority_boost_passes: 2,
            boost_priority: 10,
            min_safepoint_spacing: Duration::ZERO,
            quiescence_poll_interval: Duration::from_millis(20),
            shutdown_poll_interval: Duration::from_millis(50),
        }
    }
}

impl SyncConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_safepoint_timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.safepoint_timeout = policy;
        self
    }

    pub fn with_checkpoint_timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.checkpoint_timeout = policy;
        self
    }

    pub fn with_priority_boost(mut self, passes: u32, priority: i32) -> Self {
        self.priority_boost_passes = passes;
        self.boost_priority = priority;
        self
    }

    pub fn with_min_safepoint_spacing(mut self, spacing: Duration) -> Self {
        self.min_safepoint_spacing = spacing;
        self
    }

    pub fn with_task_timestamps(mut self, enabled: bool) -> Self {
        self.record_task_timestamps = enabled;
        self
    }

    /// Check that the configuration can drive a runtime.
    pub fn validate(&self) -> SyncResult<()> {
        if self.worker_count == 0 {
            return Err(SyncError::NoWorkers);
        }
        if u32::try_from(self.worker_count).is_err() {
            return Err(SyncError::InvalidConfig(format!(
                "worker_count {} exceeds u32::MAX",
                self.worker_count
            )));
        }
        let intervals = [
            ("safepoint_poll_interval", self.safepoint_poll_interval),
            ("quiescence_poll_interval", self.quiescence_poll_interval),
            ("shutdown_poll_interval", self.shutdown_poll_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(SyncError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        if self.record_task_timestamps && self.task_timestamp_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "task_timestamp_capacity must be non-zero when timestamps are recorded".into(),
            ));
        }
        Ok(())
    }
}
