//! Test utilities for synchronization tests
//!
//! Shared fixtures for unit tests, integration tests and benches: tasks that
//! count their executions, a scheduler that records every priority change,
//! and scripted mutator threads.

use crate::safepoint::{SafepointManager, SchedulerHints};
use crate::tasks::{Task, TaskQueue};
use crate::thread::MutatorThread;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default worker count used by task tests
pub const TEST_WORKER_COUNT: usize = 4;

/// Task that bumps a shared counter and remembers which worker ran it.
///
/// # Examples
///
/// ```
/// use pauseless_sync::tasks::Task;
/// use pauseless_sync::test_utils::CountingTask;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let counter = Arc::new(AtomicUsize::new(0));
/// let task = CountingTask::new("count", Arc::clone(&counter));
/// task.execute(2);
/// assert_eq!(counter.load(Ordering::SeqCst), 1);
/// assert_eq!(task.last_worker(), Some(2));
/// ```
pub struct CountingTask {
    name: String,
    counter: Arc<AtomicUsize>,
    last_worker: AtomicUsize,
    delay: Duration,
}

impl CountingTask {
    pub fn new(name: impl Into<String>, counter: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.into(),
            counter,
            last_worker: AtomicUsize::new(usize::MAX),
            delay: Duration::ZERO,
        }
    }

    /// Sleep for `delay` inside `execute`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn last_worker(&self) -> Option<usize> {
        match self.last_worker.load(Ordering::Acquire) {
            usize::MAX => None,
            worker => Some(worker),
        }
    }
}

impl Task for CountingTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, worker: usize) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.last_worker.store(worker, Ordering::Release);
        self.counter.fetch_add(1, Ordering::AcqRel);
    }
}

/// A queue of `count` counting tasks sharing `counter`.
pub fn counting_batch(count: usize, counter: &Arc<AtomicUsize>) -> TaskQueue {
    let mut queue = TaskQueue::new();
    for i in 0..count {
        queue.enqueue(CountingTask::new(format!("count-{i}"), Arc::clone(counter)));
    }
    queue
}

/// Scheduler mock that records `(thread id, priority)` for every call.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    raised: Mutex<Vec<(usize, i32)>>,
    restored: Mutex<Vec<(usize, i32)>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raised(&self) -> Vec<(usize, i32)> {
        self.raised.lock().clone()
    }

    pub fn restored(&self) -> Vec<(usize, i32)> {
        self.restored.lock().clone()
    }
}

impl SchedulerHints for RecordingScheduler {
    fn raise_priority(&self, thread: &MutatorThread, priority: i32) {
        self.raised.lock().push((thread.id(), priority));
    }

    fn restore_priority(&self, thread: &MutatorThread, priority: i32) {
        self.restored.lock().push((thread.id(), priority));
    }
}

/// What a [`ScriptedMutator`] does before settling into its poll loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutatorScript {
    /// Spin in native code (lock released, no polls) for this long
    pub native_for: Duration,
    /// Then spin in managed code (lock held, no polls) for this long
    pub stall_for: Duration,
}

/// A mutator running on its own OS thread.
///
/// After its script it polls in a tight loop until stopped, then detaches.
pub struct ScriptedMutator {
    id: usize,
    stop: Arc<AtomicBool>,
    polls: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl ScriptedMutator {
    /// Start the thread and wait until it has attached.
    pub fn spawn(manager: &Arc<SafepointManager>, name: &str, script: MutatorScript) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicU64::new(0));
        let (attached_tx, attached_rx) = flume::bounded(1);

        let handle = {
            let manager = Arc::clone(manager);
            let stop = Arc::clone(&stop);
            let polls = Arc::clone(&polls);
            let name = name.to_string();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let me = manager.attach(name).expect("attach scripted mutator");
                    if !script.native_for.is_zero() {
                        me.enter_native();
                    }
                    attached_tx.send(me.id()).expect("report attach");

                    if !script.native_for.is_zero() {
                        spin_for(script.native_for);
                        me.leave_native();
                    }
                    spin_for(script.stall_for);

                    while !stop.load(Ordering::Acquire) {
                        me.poll();
                        polls.fetch_add(1, Ordering::Relaxed);
                        std::hint::spin_loop();
                    }
                    me.detach();
                })
                .expect("spawn scripted mutator")
        };

        let id = attached_rx.recv().expect("scripted mutator attached");
        Self {
            id,
            stop,
            polls,
            handle,
        }
    }

    /// Mutator that only polls.
    pub fn polling(manager: &Arc<SafepointManager>, name: &str) -> Self {
        Self::spawn(manager, name, MutatorScript::default())
    }

    /// Mutator that sits in native code for `native_for` before polling.
    pub fn native_spinner(
        manager: &Arc<SafepointManager>,
        name: &str,
        native_for: Duration,
    ) -> Self {
        Self::spawn(
            manager,
            name,
            MutatorScript {
                native_for,
                stall_for: Duration::ZERO,
            },
        )
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Stop polling, detach, and join the thread.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        self.handle.join().expect("scripted mutator panicked");
    }
}

fn spin_for(duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}
