//! The unit of work handed to task workers.

use std::fmt;

/// A piece of collector work executed exactly once by some worker.
///
/// Failures inside `execute` are the task's own concern; the worker does not
/// catch panics.
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Run the task on worker `worker` (0-based pool index).
    fn execute(&self, worker: usize);
}

/// Adapter turning a closure into a [`Task`].
///
/// # Examples
///
/// ```
/// use pauseless_sync::tasks::{FnTask, Task};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let last_worker = AtomicUsize::new(usize::MAX);
/// let task = FnTask::new("scan-roots", |worker| last_worker.store(worker, Ordering::SeqCst));
///
/// task.execute(3);
/// assert_eq!(task.name(), "scan-roots");
/// assert_eq!(last_worker.load(Ordering::SeqCst), 3);
/// ```
pub struct FnTask<F> {
    name: String,
    body: F,
}

impl<F> FnTask<F>
where
    F: Fn(usize) + Send + Sync,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(usize) + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, worker: usize) {
        (self.body)(worker)
    }
}

impl<F> fmt::Debug for FnTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}
