//! Scheduler hints used to hurry checkpoint stragglers along.
//!
//! The checkpoint coordinator never touches OS priorities directly. It goes
//! through a SchedulerHints implementation injected at construction, which
//! lets embedders map priorities onto their platform and lets tests observe
//! exactly which threads were boosted and restored.

use crate::thread::MutatorThread;

/// Hooks for raising and restoring a mutator's scheduling priority.
pub trait SchedulerHints: Send + Sync + 'static {
    /// Temporarily run `thread` at `priority`.
    fn raise_priority(&self, thread: &MutatorThread, priority: i32);

    /// Return `thread` to its own priority after a boost, or apply a
    /// priority the thread chose for itself.
    fn restore_priority(&self, thread: &MutatorThread, priority: i32);
}

/// Default implementation that leaves OS scheduling alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopScheduler;

impl SchedulerHints for NoopScheduler {
    fn raise_priority(&self, _thread: &MutatorThread, _priority: i32) {}

    fn restore_priority(&self, _thread: &MutatorThread, _priority: i32) {}
}
