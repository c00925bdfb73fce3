//! Safepoint manager and core coordination logic

use crate::collector_thread::ShutdownSignal;
use crate::config::{SyncConfig, TimeoutPolicy};
use crate::error::{SyncError, SyncResult};
use crate::thread::{MutatorInner, MutatorThread, SuspendFlags, ThreadRegistry};
use arc_swap::ArcSwapOption;
use crossbeam_utils::Backoff;
use flume::Receiver;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    TARGET,
    coordination_lock::{CoordinationGuard, CoordinationLock},
    events::{EventBus, SyncEvent},
    retry::PollLoop,
    scheduler::{NoopScheduler, SchedulerHints},
    state::{AtomicEpisodeState, EpisodeState},
    times::{EpisodeTimes, SafepointSummary},
};

/// Callback delivered to every mutator by a checkpoint.
pub type CheckpointCallback = Box<dyn Fn(&MutatorThread) + Send + Sync>;

/// Work run by the coordinator right after every safepoint is reached.
pub type CleanupHook = Box<dyn Fn() + Send + Sync>;

pub(super) struct CheckpointClosure {
    pub(super) callback: CheckpointCallback,
}

const EVENT_CAPACITY: usize = 1024;

/// Coordinates safepoints and checkpoints over the attached mutators.
///
/// One manager exists per runtime. Attach and detach, safepoints and
/// checkpoints are all serialized by a single coordination lock, so at most
/// one episode is ever in flight and the thread population is frozen while
/// it runs.
///
/// # Examples
///
/// ```
/// use pauseless_sync::safepoint::{EpisodeState, SafepointManager};
///
/// let manager = SafepointManager::new_for_testing();
/// let mutator = manager.attach("worker").unwrap();
///
/// // A thread in native code is stopped without its cooperation.
/// mutator.enter_native();
/// {
///     let safepoint = manager.synchronize();
///     assert_eq!(manager.state(), EpisodeState::Synchronized);
///     assert_eq!(safepoint.times().threads, 1);
/// }
/// assert_eq!(manager.state(), EpisodeState::NotSynchronized);
///
/// mutator.leave_native();
/// mutator.detach();
/// ```
pub struct SafepointManager {
    pub(super) config: SyncConfig,
    pub(super) scheduler: Arc<dyn SchedulerHints>,
    shutdown: Arc<ShutdownSignal>,
    pub(super) coordination: CoordinationLock,
    pub(super) state: AtomicEpisodeState,
    pub(super) registry: ThreadRegistry,
    next_thread_id: AtomicUsize,
    /// Threads still expected to block in the current safepoint
    waiting_to_block: Mutex<usize>,
    all_blocked: Condvar,
    pub(super) checkpoint_callback: ArcSwapOption<CheckpointClosure>,
    pub(super) priority_boosted: AtomicBool,
    cleanup_hooks: Mutex<Vec<CleanupHook>>,
    current: Mutex<Option<EpisodeTimes>>,
    pub(super) last_times: Mutex<Option<EpisodeTimes>>,
    pub(super) summary: Mutex<SafepointSummary>,
    last_safepoint_end: Mutex<Option<Instant>>,
    pub(super) events: EventBus,
}

struct SafepointWait<'a> {
    waiting: MutexGuard<'a, usize>,
    pending: Vec<Arc<MutatorInner>>,
}

impl SafepointManager {
    pub fn new(
        config: SyncConfig,
        scheduler: Arc<dyn SchedulerHints>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            scheduler,
            shutdown,
            coordination: CoordinationLock::new(),
            state: AtomicEpisodeState::new(),
            registry: ThreadRegistry::new(),
            next_thread_id: AtomicUsize::new(1),
            waiting_to_block: Mutex::new(0),
            all_blocked: Condvar::new(),
            checkpoint_callback: ArcSwapOption::empty(),
            priority_boosted: AtomicBool::new(false),
            cleanup_hooks: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            last_times: Mutex::new(None),
            summary: Mutex::new(SafepointSummary::default()),
            last_safepoint_end: Mutex::new(None),
            events: EventBus::new(EVENT_CAPACITY),
        })
    }

    /// Manager with default configuration and no scheduler integration.
    pub fn new_for_testing() -> Arc<Self> {
        Self::new(
            SyncConfig::default(),
            Arc::new(NoopScheduler),
            Arc::new(ShutdownSignal::new()),
        )
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> &dyn SchedulerHints {
        &*self.scheduler
    }

    pub(crate) fn coordination_guard(&self) -> CoordinationGuard<'_> {
        self.coordination.guard()
    }

    /// Register the calling OS thread as a mutator.
    ///
    /// The new thread starts out running managed code, holding its own lock.
    /// Blocks while a safepoint or checkpoint is in flight.
    pub fn attach(self: &Arc<Self>, name: impl Into<String>) -> SyncResult<MutatorThread> {
        if self.shutdown.is_requested() {
            return Err(SyncError::ShuttingDown);
        }

        let _coordination = self.coordination.guard();
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.registry.register(id, name.into());
        tracing::debug!(target: TARGET, thread = id, name = inner.name(), "mutator attached");
        Ok(MutatorThread::from_parts(inner, Arc::clone(self)))
    }

    pub(crate) fn detach(&self, inner: &MutatorInner) {
        let _coordination = self.coordination.guard();
        if self.registry.unregister(inner.id()).is_some() {
            tracing::debug!(target: TARGET, thread = inner.id(), "mutator detached");
        }
    }

    pub fn thread_count(&self) -> usize {
        self.registry.len()
    }

    /// Handles to every attached mutator, in attach order.
    pub fn threads(self: &Arc<Self>) -> Vec<MutatorThread> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|inner| MutatorThread::from_parts(inner, Arc::clone(self)))
            .collect()
    }

    pub fn thread(self: &Arc<Self>, id: usize) -> SyncResult<MutatorThread> {
        self.registry
            .get(id)
            .map(|inner| MutatorThread::from_parts(inner, Arc::clone(self)))
            .ok_or(SyncError::ThreadNotRegistered(id))
    }

    pub fn state(&self) -> EpisodeState {
        self.state.load()
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.state() == EpisodeState::Synchronized
    }

    /// Run `hook` on the coordinator after every future safepoint is reached.
    pub fn add_cleanup_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.cleanup_hooks.lock().push(Box::new(hook));
    }

    /// Receiver for [`SyncEvent`]s. All subscribers share one queue.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Longest episodes observed so far.
    pub fn summary(&self) -> SafepointSummary {
        *self.summary.lock()
    }

    /// Timing breakdown of the most recently finished episode.
    pub fn last_times(&self) -> Option<EpisodeTimes> {
        *self.last_times.lock()
    }

    /// Bring every attached mutator to a halt.
    ///
    /// Returns once each mutator lock is held by the controller. The caller
    /// must later call [`end`](Self::end) from the same thread.
    ///
    /// # Panics
    ///
    /// If another episode is in flight, or if stragglers outlive a fatal
    /// [`TimeoutPolicy`].
    pub fn begin(&self) -> EpisodeTimes {
        self.honour_spacing();

        let mut times = EpisodeTimes::starting_at(Instant::now());
        self.coordination.acquire();
        times.lock_acquired = Instant::now();
        assert_eq!(
            self.state(),
            EpisodeState::NotSynchronized,
            "safepoint requested while another episode is in flight"
        );

        let threads = self.registry.snapshot();
        times.threads = threads.len();
        tracing::debug!(target: TARGET, threads = threads.len(), "safepoint synchronizing");

        times.begin_notify = Instant::now();
        {
            let mut waiting = self.waiting_to_block.lock();
            *waiting = threads.len();
            self.state.store(EpisodeState::Synchronizing);
        }

        let mut pending = Vec::new();
        for thread in &threads {
            thread.begin_episode_timing(times.begin_notify);
            if thread.try_lock_controller() {
                thread.set_suspend(SuspendFlags::SAFEPOINT);
                *self.waiting_to_block.lock() -= 1;
            } else {
                thread.set_suspend(SuspendFlags::SAFEPOINT);
                pending.push(Arc::clone(thread));
            }
        }
        times.all_notified = Instant::now();

        let policy = self.config.safepoint_timeout;
        let mut poll = PollLoop::new(policy.delay, self.config.safepoint_poll_interval);
        let mut wait = SafepointWait {
            waiting: self.waiting_to_block.lock(),
            pending,
        };
        poll.run(
            &mut wait,
            |wait, _| {
                let now = Instant::now();
                let waiting = &mut *wait.waiting;
                wait.pending.retain(|thread| {
                    if thread.try_lock_controller() {
                        thread.mark_blocked(now);
                        *waiting -= 1;
                    }
                    !thread.is_locked_by_controller()
                });
                *waiting == 0
            },
            |wait, interval| {
                self.all_blocked.wait_for(&mut wait.waiting, interval);
            },
            |wait, elapsed| self.report_timeout("safepoint", &wait.pending, elapsed, policy),
        );

        for thread in &threads {
            thread.finish_episode_timing();
        }
        self.state.store(EpisodeState::Synchronized);
        drop(wait);

        times.reached = Instant::now();
        times.timed_out = poll.timed_out();
        for hook in self.cleanup_hooks.lock().iter() {
            hook();
        }
        times.cleanup_done = Instant::now();
        *self.current.lock() = Some(times);

        tracing::debug!(
            target: TARGET,
            threads = times.threads,
            passes = poll.passes(),
            timed_out = times.timed_out,
            wait_us = times.wait_time().as_micros() as u64,
            "safepoint reached"
        );
        self.events.publish(SyncEvent::SafepointReached {
            threads: times.threads,
            time_to_safepoint: times.time_to_safepoint(),
        });
        times
    }

    /// Release every mutator stopped by [`begin`](Self::begin).
    ///
    /// # Panics
    ///
    /// If the calling thread did not begin the safepoint, or the runtime is
    /// not synchronized.
    pub fn end(&self) -> EpisodeTimes {
        assert!(
            self.coordination.is_held_by_current(),
            "safepoint ended by a thread that did not begin it"
        );
        assert_eq!(
            self.state(),
            EpisodeState::Synchronized,
            "safepoint ended while not synchronized"
        );

        let mut times = self
            .current
            .lock()
            .take()
            .unwrap_or_else(EpisodeTimes::empty);
        times.work_done = Instant::now();

        let threads = self.registry.snapshot();
        for thread in &threads {
            assert!(
                thread.is_locked_by_controller(),
                "thread {} escaped the safepoint",
                thread.id()
            );
        }

        self.state.store(EpisodeState::NotSynchronized);
        for thread in &threads {
            thread.clear_suspend(SuspendFlags::SAFEPOINT);
            thread.unlock_controller();
        }
        times.wakeup_done = Instant::now();

        times.log_safepoint();
        self.summary.lock().record_safepoint(&times);
        *self.last_safepoint_end.lock() = Some(times.wakeup_done);
        *self.last_times.lock() = Some(times);
        self.coordination.release();

        self.events.publish(SyncEvent::SafepointEnded {
            threads: times.threads,
            total: times.total(),
        });
        times
    }

    /// Begin a safepoint that ends when the returned guard is dropped.
    pub fn synchronize(&self) -> SafepointGuard<'_> {
        let times = self.begin();
        SafepointGuard {
            manager: self,
            times,
        }
    }

    /// Park a mutator that saw the safepoint request after releasing its lock.
    pub(crate) fn block(&self, thread: &MutatorInner) {
        // The poll path never flags a detached thread, but a stale clone of
        // one may still hold its own lock. The controller would never get it.
        if thread.is_terminated() {
            return;
        }

        let backoff = Backoff::new();
        while !thread.is_locked_by_controller() {
            if thread.try_lock_controller() {
                thread.mark_blocked(Instant::now());
                let mut waiting = self.waiting_to_block.lock();
                if self.state() != EpisodeState::Synchronizing {
                    drop(waiting);
                    thread.unlock_controller();
                    return;
                }
                *waiting -= 1;
                if *waiting == 0 {
                    self.all_blocked.notify_all();
                }
                break;
            }
            backoff.snooze();
        }

        tracing::trace!(target: TARGET, thread = thread.id(), "blocked for safepoint");
        drop(self.coordination.guard());
    }

    /// Run the pending checkpoint callback on the calling mutator.
    pub(crate) fn self_checkpoint(&self, thread: &MutatorThread) {
        if let Some(closure) = self.checkpoint_callback.load_full() {
            (closure.callback)(thread);
        }
        thread.inner().clear_suspend(SuspendFlags::CHECKPOINT);
        if self.priority_boosted.load(Ordering::Acquire) {
            self.scheduler.restore_priority(thread, thread.priority());
        }
    }

    fn honour_spacing(&self) {
        let spacing = self.config.min_safepoint_spacing;
        if spacing.is_zero() {
            return;
        }
        let Some(last_end) = *self.last_safepoint_end.lock() else {
            return;
        };

        let deadline = last_end + spacing;
        loop {
            let now = Instant::now();
            if now >= deadline || self.shutdown.is_requested() {
                return;
            }
            thread::sleep((deadline - now).min(self.config.shutdown_poll_interval));
        }
    }

    pub(super) fn report_timeout(
        &self,
        kind: &'static str,
        pending: &[Arc<MutatorInner>],
        elapsed: Duration,
        policy: TimeoutPolicy,
    ) {
        let unresponsive: Vec<usize> = pending
            .iter()
            .filter(|thread| !thread.is_locked_by_controller())
            .map(|thread| thread.id())
            .collect();

        for thread in pending {
            tracing::error!(target: TARGET, kind, "{}", thread.describe());
        }
        tracing::error!(
            target: TARGET,
            kind,
            elapsed_ms = elapsed.as_millis() as u64,
            limit_ms = policy.delay.as_millis() as u64,
            unresponsive = ?unresponsive,
            "{kind} sync time longer than limit"
        );
        self.events.publish(SyncEvent::TimeoutDetected {
            checkpoint: kind == "checkpoint",
            unresponsive: unresponsive.clone(),
        });

        if policy.fatal {
            panic!("{kind} timed out after {elapsed:?}; unresponsive threads: {unresponsive:?}");
        }
    }
}

/// RAII guard returned by [`SafepointManager::synchronize`].
pub struct SafepointGuard<'a> {
    manager: &'a SafepointManager,
    times: EpisodeTimes,
}

impl SafepointGuard<'_> {
    /// Timings up to the point the safepoint was reached.
    pub fn times(&self) -> &EpisodeTimes {
        &self.times
    }

    /// End the safepoint now and return the full episode timings.
    pub fn finish(self) -> EpisodeTimes {
        let manager = self.manager;
        std::mem::forget(self);
        manager.end()
    }
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.manager.end();
    }
}
