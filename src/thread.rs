//! Mutator thread handles and the registry the coordinators walk.
//!
//! Every mutator owns a *distributed lock*. While the thread runs managed
//! code it holds the lock itself; before entering native code or parking it
//! releases the lock, and a safepoint or checkpoint initiator may then steal
//! it. Ownership only ever moves by compare-and-swap:
//!
//! ```text
//!   LockedBySelf --release--> Free --steal--> LockedByController
//!        ^                     |  ^                   |
//!        +------lock-self------+  +-----release-------+
//! ```
//!
//! # Examples
//!
//! ```
//! use pauseless_sync::safepoint::SafepointManager;
//! use pauseless_sync::thread::ThreadLockState;
//!
//! let manager = SafepointManager::new_for_testing();
//! let mutator = manager.attach("main").unwrap();
//! assert_eq!(mutator.lock_state(), ThreadLockState::LockedBySelf);
//!
//! // No episode in flight: the poll is a single load.
//! mutator.poll();
//!
//! mutator.enter_native();
//! assert_eq!(mutator.lock_state(), ThreadLockState::Free);
//! mutator.leave_native();
//! assert_eq!(mutator.lock_state(), ThreadLockState::LockedBySelf);
//!
//! mutator.detach();
//! assert_eq!(manager.thread_count(), 0);
//! ```

use crate::safepoint::SafepointManager;
use bitflags::bitflags;
use crossbeam_utils::Backoff;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Owner of a mutator's distributed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadLockState {
    /// Nobody holds the lock; the thread is in native code or parked
    Free = 0,
    /// The thread is running managed code
    LockedBySelf = 1,
    /// A safepoint or checkpoint initiator owns the thread
    LockedByController = 2,
}

impl ThreadLockState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadLockState::Free,
            1 => ThreadLockState::LockedBySelf,
            2 => ThreadLockState::LockedByController,
            other => unreachable!("corrupt thread lock state {other}"),
        }
    }
}

bitflags! {
    /// Suspend requests observed at a mutator's poll points.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuspendFlags: u32 {
        /// Park until the current safepoint ends
        const SAFEPOINT = 1 << 0;
        /// Run the registered checkpoint callback on this thread
        const CHECKPOINT = 1 << 1;
    }
}

/// Time-to-block statistics accumulated across safepoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSafepointStats {
    /// Safepoints in which this thread had to be waited for
    pub count: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Duration,
    /// Episode start of the slowest safepoint
    pub max_when: Option<Instant>,
}

impl ThreadSafepointStats {
    fn record(&mut self, interval: Duration, started: Instant) {
        self.count += 1;
        self.total += interval;
        if self.min.is_none_or(|min| interval < min) {
            self.min = Some(interval);
        }
        if interval > self.max {
            self.max = interval;
            self.max_when = Some(started);
        }
    }
}

#[derive(Debug)]
struct EpisodeTiming {
    start: Instant,
    end: Instant,
    stats: ThreadSafepointStats,
}

/// Registry-owned state of one mutator.
pub(crate) struct MutatorInner {
    id: usize,
    name: String,
    os_thread: ThreadId,
    lock: AtomicU8,
    suspend: AtomicU32,
    /// Bumped on every self-release; with `last_release` this is the payload a
    /// free lock used to carry.
    releases: AtomicU64,
    last_release: Mutex<Option<Instant>>,
    priority: AtomicI32,
    terminated: AtomicBool,
    timing: Mutex<EpisodeTiming>,
}

impl MutatorInner {
    fn new(id: usize, name: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            name,
            os_thread: std::thread::current().id(),
            lock: AtomicU8::new(ThreadLockState::LockedBySelf as u8),
            suspend: AtomicU32::new(0),
            releases: AtomicU64::new(0),
            last_release: Mutex::new(None),
            priority: AtomicI32::new(0),
            terminated: AtomicBool::new(false),
            timing: Mutex::new(EpisodeTiming {
                start: now,
                end: now,
                stats: ThreadSafepointStats::default(),
            }),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock_state(&self) -> ThreadLockState {
        ThreadLockState::from_u8(self.lock.load(Ordering::Acquire))
    }

    pub(crate) fn is_locked_by_controller(&self) -> bool {
        self.lock_state() == ThreadLockState::LockedByController
    }

    fn transition(&self, from: ThreadLockState, to: ThreadLockState) -> bool {
        self.lock
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Free -> LockedBySelf. Only the owning thread calls this.
    pub(crate) fn try_lock_self(&self) -> bool {
        self.transition(ThreadLockState::Free, ThreadLockState::LockedBySelf)
    }

    /// LockedBySelf -> Free. Only the owning thread calls this.
    pub(crate) fn unlock_self(&self) {
        assert_eq!(
            self.lock_state(),
            ThreadLockState::LockedBySelf,
            "thread {} released a lock it does not hold",
            self.id
        );
        self.releases.fetch_add(1, Ordering::Relaxed);
        *self.last_release.lock() = Some(Instant::now());
        self.lock
            .store(ThreadLockState::Free as u8, Ordering::Release);
    }

    /// Free -> LockedByController, attempted by the initiator or by a
    /// blocking mutator on the initiator's behalf.
    pub(crate) fn try_lock_controller(&self) -> bool {
        self.transition(ThreadLockState::Free, ThreadLockState::LockedByController)
    }

    /// LockedByController -> Free.
    pub(crate) fn unlock_controller(&self) {
        let released = self.transition(ThreadLockState::LockedByController, ThreadLockState::Free);
        assert!(released, "controller released thread {} it does not hold", self.id);
    }

    pub(crate) fn suspend_flags(&self) -> SuspendFlags {
        SuspendFlags::from_bits_truncate(self.suspend.load(Ordering::Acquire))
    }

    pub(crate) fn set_suspend(&self, flags: SuspendFlags) {
        self.suspend.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_suspend(&self, flags: SuspendFlags) {
        self.suspend.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flags` and report whether any of them were set.
    pub(crate) fn test_clear_suspend(&self, flags: SuspendFlags) -> bool {
        let previous = self.suspend.fetch_and(!flags.bits(), Ordering::AcqRel);
        previous & flags.bits() != 0
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn begin_episode_timing(&self, now: Instant) {
        let mut timing = self.timing.lock();
        timing.start = now;
        timing.end = now;
    }

    pub(crate) fn mark_blocked(&self, now: Instant) {
        self.timing.lock().end = now;
    }

    /// Fold this episode's time-to-block into the running statistics.
    pub(crate) fn finish_episode_timing(&self) {
        let mut timing = self.timing.lock();
        if timing.end > timing.start {
            let interval = timing.end - timing.start;
            let started = timing.start;
            timing.stats.record(interval, started);
        }
        let now = Instant::now();
        timing.start = now;
        timing.end = now;
    }

    pub(crate) fn describe(&self) -> String {
        let since_release = self
            .last_release
            .lock()
            .map(|at| format!("{:?} ago", at.elapsed()))
            .unwrap_or_else(|| "never".to_string());
        format!(
            "thread {} ({}) lock={:?} flags={:?} releases={} last_release={}",
            self.id,
            self.name,
            self.lock_state(),
            self.suspend_flags(),
            self.releases.load(Ordering::Relaxed),
            since_release
        )
    }
}

/// Handle to an attached mutator thread.
///
/// Cloning is cheap; all clones refer to the same registry entry. The handle
/// is meant to be driven by the thread that attached it.
pub struct MutatorThread {
    inner: Arc<MutatorInner>,
    manager: Arc<SafepointManager>,
}

impl MutatorThread {
    pub(crate) fn from_parts(inner: Arc<MutatorInner>, manager: Arc<SafepointManager>) -> Self {
        Self { inner, manager }
    }

    pub(crate) fn inner(&self) -> &Arc<MutatorInner> {
        &self.inner
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// OS thread that attached this mutator.
    pub fn os_thread_id(&self) -> ThreadId {
        self.inner.os_thread
    }

    pub fn lock_state(&self) -> ThreadLockState {
        self.inner.lock_state()
    }

    pub fn suspend_flags(&self) -> SuspendFlags {
        self.inner.suspend_flags()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    /// Number of times this thread released its own lock.
    pub fn release_count(&self) -> u64 {
        self.inner.releases.load(Ordering::Relaxed)
    }

    pub fn safepoint_stats(&self) -> ThreadSafepointStats {
        self.inner.timing.lock().stats
    }

    /// Poll point emitted at method entry and loop back-edges.
    #[inline]
    pub fn poll(&self) {
        if !self.inner.suspend_flags().is_empty() {
            self.inner.unlock_self();
            self.lock_self_or_suspend();
        }
    }

    /// Release the lock before running code that does not poll.
    pub fn enter_native(&self) {
        self.inner.unlock_self();
    }

    /// Retake the lock after native code, parking if a safepoint is pending.
    pub fn leave_native(&self) {
        if !self.inner.try_lock_self() || !self.inner.suspend_flags().is_empty() {
            if self.inner.lock_state() == ThreadLockState::LockedBySelf {
                self.inner.unlock_self();
            }
            self.lock_self_or_suspend();
        }
    }

    /// Run `f` with the lock released.
    pub fn run_native<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_native();
        let result = f();
        self.leave_native();
        result
    }

    /// Take the lock for self, handling every pending request on the way.
    ///
    /// A request may arrive right after the lock is taken; it is then picked
    /// up at the next poll.
    fn lock_self_or_suspend(&self) {
        let backoff = Backoff::new();
        loop {
            if self.inner.suspend_flags().contains(SuspendFlags::SAFEPOINT) {
                self.manager.block(&self.inner);
            }

            if self.inner.try_lock_self() {
                if self.inner.suspend_flags().contains(SuspendFlags::CHECKPOINT) {
                    self.manager.self_checkpoint(self);
                }
                return;
            }

            backoff.snooze();
        }
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority()
    }

    /// Change this thread's scheduling priority.
    ///
    /// Serialized with checkpoint priority boosts through the coordination
    /// lock, so the call stalls while an episode is in flight.
    pub fn set_priority(&self, priority: i32) {
        let held = self.inner.lock_state() == ThreadLockState::LockedBySelf;
        if held {
            self.inner.unlock_self();
        }
        {
            let _coordination = self.manager.coordination_guard();
            self.inner.priority.store(priority, Ordering::Release);
            self.manager.scheduler().restore_priority(self, priority);
        }
        if held {
            self.lock_self_or_suspend();
        }
    }

    /// Remove the thread from the registry.
    ///
    /// Waits for any in-flight episode to end first.
    pub fn detach(self) {
        if self.inner.lock_state() == ThreadLockState::LockedBySelf {
            self.inner.unlock_self();
        }
        self.manager.detach(&self.inner);
    }
}

impl Clone for MutatorThread {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            manager: Arc::clone(&self.manager),
        }
    }
}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("lock", &self.lock_state())
            .field("flags", &self.suspend_flags())
            .finish()
    }
}

/// Registry of attached mutators.
///
/// Insertions and removals happen only under the coordination lock, so a
/// coordinator holding that lock sees a frozen population.
#[derive(Default)]
pub(crate) struct ThreadRegistry {
    mutators: DashMap<usize, Arc<MutatorInner>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            mutators: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, id: usize, name: String) -> Arc<MutatorInner> {
        let inner = Arc::new(MutatorInner::new(id, name));
        self.mutators.insert(id, Arc::clone(&inner));
        inner
    }

    pub(crate) fn unregister(&self, id: usize) -> Option<Arc<MutatorInner>> {
        self.mutators.remove(&id).map(|(_, inner)| {
            inner.terminated.store(true, Ordering::Release);
            inner
        })
    }

    pub(crate) fn get(&self, id: usize) -> Option<Arc<MutatorInner>> {
        self.mutators.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// All registered mutators in attach order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<MutatorInner>> {
        let mut threads: Vec<_> = self
            .mutators
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        threads.sort_by_key(|inner| inner.id);
        threads
    }

    pub(crate) fn len(&self) -> usize {
        self.mutators.len()
    }
}
