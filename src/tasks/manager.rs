//! Fixed-size worker pool that runs one batch of tasks at a time.

use crate::collector_thread::CollectorThread;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::{
    TARGET,
    queue::TaskQueue,
    worker::{TaskTimeStamp, TaskWorker, WorkerStats},
};

#[derive(Debug, Default)]
pub(super) struct StartState {
    /// Bumped once per batch; workers compare it with their cached copy
    pub(super) wakeup: u64,
    pub(super) shutdown: bool,
}

#[derive(Debug, Default)]
pub(super) struct PerfCounters {
    pub(super) lists_added: AtomicU64,
    pub(super) tasks_delivered: AtomicU64,
    pub(super) tasks_completed: AtomicU64,
    pub(super) queue_emptied: AtomicU64,
}

/// Snapshot of a task manager's cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskPerfCounters {
    /// Batches handed to the pool
    pub lists_added: u64,
    pub tasks_delivered: u64,
    pub tasks_completed: u64,
    /// Times a worker found the shared queue drained
    pub queue_emptied: u64,
}

/// State shared between the manager and its workers.
pub(super) struct ManagerShared {
    pub(super) name: String,
    worker_count: usize,
    pub(super) record_timestamps: bool,
    pub(super) timestamp_capacity: usize,
    shutdown_poll_interval: Duration,
    /// Workers hold read guards while draining; the initiator writes only
    /// between batches.
    pub(super) queue: RwLock<TaskQueue>,
    pub(super) start: Mutex<StartState>,
    pub(super) start_signal: Condvar,
    /// Workers that have not yet finished the current batch
    active: Mutex<usize>,
    all_done: Condvar,
    pub(super) batch_completed: AtomicU64,
    pub(super) counters: PerfCounters,
    pub(super) workers: Vec<WorkerStats>,
}

impl ManagerShared {
    pub(super) fn note_completion(&self) {
        let mut active = self.active.lock();
        assert!(*active > 0, "task worker completed outside of a batch");
        *active -= 1;
        if *active == 0 {
            self.all_done.notify_all();
        }
    }
}

/// Hands batches of tasks to a fixed pool of worker threads.
///
/// Every batch wakes all workers; [`add_list`](Self::add_list) returns only
/// after each of them has found the queue empty.
///
/// # Examples
///
/// ```
/// use pauseless_sync::collector_thread::CollectorThread;
/// use pauseless_sync::config::SyncConfig;
/// use pauseless_sync::tasks::{FnTask, TaskManager, TaskQueue};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let manager = TaskManager::new(&SyncConfig::default().with_worker_count(2), "gc-task").unwrap();
/// let caller = CollectorThread::standalone("gc");
/// let done = Arc::new(AtomicUsize::new(0));
///
/// let mut batch = TaskQueue::new();
/// for _ in 0..10 {
///     let done = Arc::clone(&done);
///     batch.enqueue(FnTask::new("count", move |_| {
///         done.fetch_add(1, Ordering::SeqCst);
///     }));
/// }
/// manager.add_list(&mut batch, &caller).unwrap();
///
/// assert_eq!(done.load(Ordering::SeqCst), 10);
/// assert!(batch.is_empty());
/// ```
pub struct TaskManager {
    shared: Arc<ManagerShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    /// Spawn `config.worker_count` workers named `{name}-{index}`.
    pub fn new(config: &SyncConfig, name: impl Into<String>) -> SyncResult<Self> {
        config.validate()?;
        let name = name.into();
        let worker_count = config.worker_count;

        let shared = Arc::new(ManagerShared {
            name: name.clone(),
            worker_count,
            record_timestamps: config.record_task_timestamps,
            timestamp_capacity: config.task_timestamp_capacity,
            shutdown_poll_interval: config.shutdown_poll_interval,
            queue: RwLock::new(TaskQueue::new()),
            start: Mutex::new(StartState::default()),
            start_signal: Condvar::new(),
            active: Mutex::new(0),
            all_done: Condvar::new(),
            batch_completed: AtomicU64::new(0),
            counters: PerfCounters::default(),
            workers: (0..worker_count).map(|_| WorkerStats::default()).collect(),
        });

        let manager = Self {
            shared,
            handles: Mutex::new(Vec::with_capacity(worker_count)),
        };
        for index in 0..worker_count {
            let worker = TaskWorker::new(index, Arc::clone(&manager.shared));
            let thread_name = format!("{name}-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker.run())
                .map_err(|source| SyncError::WorkerSpawn {
                    name: thread_name,
                    source,
                })?;
            manager.handles.lock().push(handle);
        }

        tracing::debug!(target: TARGET, manager = %name, workers = worker_count, "task manager started");
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count
    }

    /// No batch is in flight.
    pub fn is_idle(&self) -> bool {
        *self.shared.active.lock() == 0
    }

    /// Run every task in `list` on the pool and wait for all of them.
    ///
    /// `list` is left empty. The caller is marked blocked for the duration.
    ///
    /// # Errors
    ///
    /// [`SyncError::ShuttingDown`] if `caller` is asked to terminate before
    /// or during the batch.
    ///
    /// # Panics
    ///
    /// If another batch is still in flight, or if the workers completed a
    /// different number of tasks than were delivered.
    pub fn add_list(&self, list: &mut TaskQueue, caller: &CollectorThread) -> SyncResult<()> {
        caller.check_terminate()?;
        let _blocked = caller.blocked_scope();
        let shared = &self.shared;
        let started = Instant::now();

        {
            // Claim the pool before the transfer so a second caller fails here.
            let mut active = shared.active.lock();
            assert_eq!(*active, 0, "task batch added while another is in flight");
            *active = shared.worker_count;
        }
        let delivered = {
            let mut queue = shared.queue.write();
            assert!(queue.is_empty(), "task manager queue not drained");
            queue.enqueue_list(list);
            queue.len() as u64
        };
        shared.batch_completed.store(0, Ordering::Release);

        {
            let mut start = shared.start.lock();
            assert!(!start.shutdown, "task batch added after shutdown");
            start.wakeup += 1;
            shared.start_signal.notify_all();
        }
        tracing::debug!(target: TARGET, manager = %shared.name, tasks = delivered, "task batch started");

        {
            let mut active = shared.active.lock();
            while *active > 0 {
                if caller.should_terminate() {
                    return Err(SyncError::ShuttingDown);
                }
                shared
                    .all_done
                    .wait_for(&mut active, shared.shutdown_poll_interval);
            }
        }

        let completed = shared.batch_completed.load(Ordering::Acquire);
        assert_eq!(
            delivered, completed,
            "task batch delivered {delivered} tasks but completed {completed}"
        );
        shared.queue.write().clear();

        shared.counters.lists_added.fetch_add(1, Ordering::Relaxed);
        shared
            .counters
            .tasks_delivered
            .fetch_add(delivered, Ordering::Relaxed);
        shared
            .counters
            .tasks_completed
            .fetch_add(completed, Ordering::Relaxed);
        tracing::debug!(
            target: TARGET,
            manager = %shared.name,
            tasks = completed,
            elapsed_us = started.elapsed().as_micros() as u64,
            "task batch finished"
        );
        Ok(())
    }

    /// Task timing records, one ring per worker, oldest first.
    pub fn task_time_stamps(&self) -> Vec<Vec<TaskTimeStamp>> {
        self.shared
            .workers
            .iter()
            .map(|worker| worker.timestamps.lock().iter().cloned().collect())
            .collect()
    }

    /// Tasks executed by each worker since the counters were last reset.
    pub fn tasks_per_worker(&self) -> Vec<u64> {
        self.shared
            .workers
            .iter()
            .map(|worker| worker.executed.load(Ordering::Relaxed))
            .collect()
    }

    pub fn perf_counters(&self) -> TaskPerfCounters {
        let counters = &self.shared.counters;
        TaskPerfCounters {
            lists_added: counters.lists_added.load(Ordering::Relaxed),
            tasks_delivered: counters.tasks_delivered.load(Ordering::Relaxed),
            tasks_completed: counters.tasks_completed.load(Ordering::Relaxed),
            queue_emptied: counters.queue_emptied.load(Ordering::Relaxed),
        }
    }

    pub fn log_perf_counters(&self) {
        let counters = self.perf_counters();
        tracing::info!(
            target: TARGET,
            manager = %self.shared.name,
            lists_added = counters.lists_added,
            tasks_delivered = counters.tasks_delivered,
            tasks_completed = counters.tasks_completed,
            queue_emptied = counters.queue_emptied,
            per_worker = ?self.tasks_per_worker(),
            "task manager counters"
        );
    }

    pub fn reset_perf_counters(&self) {
        let counters = &self.shared.counters;
        counters.lists_added.store(0, Ordering::Relaxed);
        counters.tasks_delivered.store(0, Ordering::Relaxed);
        counters.tasks_completed.store(0, Ordering::Relaxed);
        counters.queue_emptied.store(0, Ordering::Relaxed);
        for worker in &self.shared.workers {
            worker.executed.store(0, Ordering::Relaxed);
            worker.timestamps.lock().clear();
        }
    }

    /// Stop every worker once it has finished any batch in flight, then join.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let mut start = self.shared.start.lock();
            start.shutdown = true;
            self.shared.start_signal.notify_all();
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                tracing::warn!(target: TARGET, manager = %self.shared.name, "task worker panicked");
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("name", &self.shared.name)
            .field("workers", &self.shared.worker_count)
            .field("idle", &self.is_idle())
            .finish()
    }
}
