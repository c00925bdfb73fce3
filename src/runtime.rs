//! Runtime context owning every synchronization component.
//!
//! One [`Runtime`] exists per VM. It is created at VM start, handed (or
//! `Arc`-shared) to every subsystem that needs to stop mutators, run task
//! batches or meet the other collector, and torn down at VM exit.

use crate::collector_thread::{CollectorThread, ShutdownSignal};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::rendezvous::{GcLockerHook, NoopGcLocker, Rendezvous};
use crate::safepoint::{EpisodeTimes, NoopScheduler, SafepointManager, SchedulerHints};
use crate::tasks::{TaskManager, TaskQueue};
use crate::thread::MutatorThread;
use std::sync::Arc;

/// Collaborators injected into a [`Runtime`].
pub struct RuntimeBuilder {
    config: SyncConfig,
    scheduler: Arc<dyn SchedulerHints>,
    gc_locker: Arc<dyn GcLockerHook>,
}

impl RuntimeBuilder {
    pub fn scheduler(mut self, scheduler: Arc<dyn SchedulerHints>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn gc_locker(mut self, gc_locker: Arc<dyn GcLockerHook>) -> Self {
        self.gc_locker = gc_locker;
        self
    }

    pub fn build(self) -> SyncResult<Runtime> {
        self.config.validate()?;
        let shutdown = Arc::new(ShutdownSignal::new());
        let safepoints = SafepointManager::new(
            self.config.clone(),
            self.scheduler,
            Arc::clone(&shutdown),
        );
        let new_gc_tasks = TaskManager::new(&self.config, "new-gc-task")?;
        let old_gc_tasks = TaskManager::new(&self.config, "old-gc-task")?;
        let rendezvous = Arc::new(Rendezvous::with_gc_locker(&self.config, self.gc_locker));

        tracing::info!(
            target: "pauseless_sync::runtime",
            workers = self.config.worker_count,
            "synchronization runtime started"
        );
        Ok(Runtime {
            config: self.config,
            shutdown,
            safepoints,
            new_gc_tasks,
            old_gc_tasks,
            rendezvous,
        })
    }
}

/// Safepoint manager, task pools and rendezvous for one VM.
///
/// # Examples
///
/// ```
/// use pauseless_sync::config::SyncConfig;
/// use pauseless_sync::runtime::Runtime;
/// use pauseless_sync::test_utils::counting_batch;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let runtime = Runtime::new(SyncConfig::default().with_worker_count(2)).unwrap();
/// let collector = runtime.collector_thread("new-gc");
///
/// let counter = Arc::new(AtomicUsize::new(0));
/// let mut batch = counting_batch(8, &counter);
/// let times = runtime.run_at_safepoint(&mut batch, &collector).unwrap();
///
/// assert_eq!(counter.load(Ordering::SeqCst), 8);
/// assert!(times.total() >= times.op_time());
/// runtime.shutdown();
/// ```
pub struct Runtime {
    config: SyncConfig,
    shutdown: Arc<ShutdownSignal>,
    safepoints: Arc<SafepointManager>,
    new_gc_tasks: TaskManager,
    old_gc_tasks: TaskManager,
    rendezvous: Arc<Rendezvous>,
}

impl Runtime {
    /// Runtime with no scheduler or GC-locker integration.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: SyncConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            scheduler: Arc::new(NoopScheduler),
            gc_locker: Arc::new(NoopGcLocker),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn safepoints(&self) -> &Arc<SafepointManager> {
        &self.safepoints
    }

    /// Task pool of the new-generation collector.
    pub fn new_gc_tasks(&self) -> &TaskManager {
        &self.new_gc_tasks
    }

    /// Task pool of the old-generation collector.
    pub fn old_gc_tasks(&self) -> &TaskManager {
        &self.old_gc_tasks
    }

    pub fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    pub fn shutdown_signal(&self) -> &Arc<ShutdownSignal> {
        &self.shutdown
    }

    /// A collector thread handle tied to this runtime's shutdown signal.
    pub fn collector_thread(&self, name: impl Into<String>) -> CollectorThread {
        CollectorThread::new(name, Arc::clone(&self.shutdown))
    }

    /// Attach the calling OS thread as a mutator.
    pub fn attach_mutator(&self, name: impl Into<String>) -> SyncResult<MutatorThread> {
        self.safepoints.attach(name)
    }

    /// Stop every mutator, run `tasks` on the new-generation pool, resume.
    ///
    /// The safepoint is ended even if the batch is abandoned for shutdown.
    pub fn run_at_safepoint(
        &self,
        tasks: &mut TaskQueue,
        caller: &CollectorThread,
    ) -> SyncResult<EpisodeTimes> {
        caller.check_terminate()?;
        let safepoint = self.safepoints.synchronize();
        self.new_gc_tasks.add_list(tasks, caller)?;
        Ok(safepoint.finish())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Flag every collector thread for termination, stop both task pools
    /// and log the exit statistics. Idempotent.
    pub fn shutdown(&self) {
        let first = !self.shutdown.is_requested();
        self.shutdown.request();
        self.new_gc_tasks.shutdown();
        self.old_gc_tasks.shutdown();
        if first {
            self.safepoints.summary().log();
            self.new_gc_tasks.log_perf_counters();
            self.old_gc_tasks.log_perf_counters();
            tracing::info!(target: "pauseless_sync::runtime", "synchronization runtime stopped");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
