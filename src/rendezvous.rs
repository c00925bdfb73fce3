//! Rendezvous between the new- and old-generation collector threads.
//!
//! The two collectors run concurrently but must meet at a handful of named
//! points in every cycle (before root marking, around the coordinated
//! safepoints, at cycle end). Each point is a two-party barrier: the first
//! arrival waits, the second releases it and re-arms the point for the next
//! cycle. The same monitor also carries the GC-locker counter and the
//! old-GC trigger, and the relocation [`QuiescenceGate`] hangs off the
//! [`Rendezvous`] too.
//!
//! Every wait wakes up periodically to check whether the calling collector
//! thread was asked to terminate, and returns
//! [`SyncError::ShuttingDown`](crate::error::SyncError::ShuttingDown) if so.

mod quiescence;

pub use quiescence::QuiescenceGate;

use crate::collector_thread::CollectorThread;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

const TARGET: &str = "pauseless_sync::rendezvous";

/// Named meeting points of the two collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendezvousPoint {
    ReadyForRootMarking,
    EndMarkingSafepoint,
    EndCoordinatedSafepointPrepare,
    EndCoordinatedSafepoint,
    GcCycleEnd,
}

impl RendezvousPoint {
    pub const ALL: [RendezvousPoint; 5] = [
        RendezvousPoint::ReadyForRootMarking,
        RendezvousPoint::EndMarkingSafepoint,
        RendezvousPoint::EndCoordinatedSafepointPrepare,
        RendezvousPoint::EndCoordinatedSafepoint,
        RendezvousPoint::GcCycleEnd,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Hooks for locking out concurrent collection while both collectors hold
/// the GC locker.
pub trait GcLockerHook: Send + Sync + 'static {
    fn lock_concurrent_gc(&self);
    fn unlock_concurrent_gc(&self);
}

/// Default hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGcLocker;

impl GcLockerHook for NoopGcLocker {
    fn lock_concurrent_gc(&self) {}
    fn unlock_concurrent_gc(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
struct PointState {
    /// Parties counted in the current round. Stays at 2 after the second
    /// arrival until the first one has woken up and reset it.
    arrived: u8,
    /// Completed rounds; the first arrival waits for this to move
    round: u64,
}

impl PointState {
    /// Count one more party in. Returns the round to wait out, or `None`
    /// when this arrival completes the rendezvous.
    fn register(&mut self, point: RendezvousPoint) -> Option<u64> {
        assert!(
            self.arrived < 2,
            "third party arrived at rendezvous {point:?} before it was reset"
        );
        self.arrived += 1;
        if self.arrived == 2 {
            self.round += 1;
            None
        } else {
            Some(self.round)
        }
    }
}

#[derive(Debug, Default)]
struct RendezvousState {
    points: [PointState; RendezvousPoint::ALL.len()],
    gc_locker_count: u8,
    old_gc_pending: bool,
}

/// Two-party barriers, the GC-locker counter, the old-GC trigger and the
/// relocation gate.
///
/// # Examples
///
/// ```
/// use pauseless_sync::collector_thread::CollectorThread;
/// use pauseless_sync::config::SyncConfig;
/// use pauseless_sync::rendezvous::Rendezvous;
/// use std::sync::Arc;
/// use std::thread;
///
/// let rendezvous = Arc::new(Rendezvous::new(&SyncConfig::default()));
///
/// let old_gc = {
///     let rendezvous = Arc::clone(&rendezvous);
///     thread::spawn(move || {
///         let me = CollectorThread::standalone("old-gc");
///         rendezvous.start_root_marking(&me).unwrap();
///     })
/// };
///
/// let new_gc = CollectorThread::standalone("new-gc");
/// rendezvous.start_root_marking(&new_gc).unwrap();
/// old_gc.join().unwrap();
/// ```
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    signal: Condvar,
    gate: QuiescenceGate,
    locker: Arc<dyn GcLockerHook>,
    shutdown_poll_interval: Duration,
}

impl Rendezvous {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_gc_locker(config, Arc::new(NoopGcLocker))
    }

    pub fn with_gc_locker(config: &SyncConfig, locker: Arc<dyn GcLockerHook>) -> Self {
        Self {
            state: Mutex::new(RendezvousState::default()),
            signal: Condvar::new(),
            gate: QuiescenceGate::new(
                config.quiescence_poll_interval,
                config.shutdown_poll_interval,
            ),
            locker,
            shutdown_poll_interval: config.shutdown_poll_interval,
        }
    }

    /// Meet the other collector at `point`.
    ///
    /// # Panics
    ///
    /// If a third party shows up before the previous pair has left.
    pub fn arrive(&self, point: RendezvousPoint, caller: &CollectorThread) -> SyncResult<()> {
        caller.check_terminate()?;
        let _blocked = caller.blocked_scope();
        let index = point.index();

        let mut state = self.state.lock();
        let Some(round) = state.points[index].register(point) else {
            self.signal.notify_all();
            tracing::debug!(target: TARGET, ?point, thread = caller.name(), round = state.points[index].round, "rendezvous complete");
            return Ok(());
        };

        tracing::trace!(target: TARGET, ?point, thread = caller.name(), "waiting at rendezvous");
        while state.points[index].round == round {
            if caller.should_terminate() {
                state.points[index].arrived -= 1;
                return Err(SyncError::ShuttingDown);
            }
            self.signal
                .wait_for(&mut state, self.shutdown_poll_interval);
        }
        state.points[index].arrived = 0;
        Ok(())
    }

    pub fn start_root_marking(&self, caller: &CollectorThread) -> SyncResult<()> {
        self.arrive(RendezvousPoint::ReadyForRootMarking, caller)
    }

    pub fn end_marking_safepoint(&self, caller: &CollectorThread) -> SyncResult<()> {
        self.arrive(RendezvousPoint::EndMarkingSafepoint, caller)
    }

    pub fn end_coordinated_safepoint_prepare(&self, caller: &CollectorThread) -> SyncResult<()> {
        self.arrive(RendezvousPoint::EndCoordinatedSafepointPrepare, caller)
    }

    pub fn end_coordinated_safepoint(&self, caller: &CollectorThread) -> SyncResult<()> {
        self.arrive(RendezvousPoint::EndCoordinatedSafepoint, caller)
    }

    pub fn end_gc_cycle(&self, caller: &CollectorThread) -> SyncResult<()> {
        self.arrive(RendezvousPoint::GcCycleEnd, caller)
    }

    /// Parties counted at `point` that have not yet left.
    pub fn waiting_at(&self, point: RendezvousPoint) -> usize {
        usize::from(self.state.lock().points[point.index()].arrived)
    }

    /// Rounds completed at `point`.
    pub fn rounds_completed(&self, point: RendezvousPoint) -> u64 {
        self.state.lock().points[point.index()].round
    }

    /// Take one of the two GC-locker holds; the first locks out
    /// concurrent collection.
    pub fn start_gc_locker_concurrent(&self) {
        let mut state = self.state.lock();
        assert!(state.gc_locker_count < 2, "gc locker taken more than twice");
        state.gc_locker_count += 1;
        if state.gc_locker_count == 1 {
            self.locker.lock_concurrent_gc();
        }
    }

    /// Drop a GC-locker hold; the last one lets concurrent collection in.
    pub fn end_gc_locker_concurrent(&self) {
        let mut state = self.state.lock();
        assert!(state.gc_locker_count > 0, "gc locker released without a hold");
        state.gc_locker_count -= 1;
        if state.gc_locker_count == 0 {
            self.locker.unlock_concurrent_gc();
        }
    }

    pub fn gc_locker_count(&self) -> u8 {
        self.state.lock().gc_locker_count
    }

    /// Ask the old-generation collector to start a cycle.
    ///
    /// # Panics
    ///
    /// If a trigger is already pending.
    pub fn trigger_old_gc(&self) {
        let mut state = self.state.lock();
        assert!(!state.old_gc_pending, "old GC triggered twice");
        state.old_gc_pending = true;
        self.signal.notify_all();
        tracing::debug!(target: TARGET, "old GC triggered");
    }

    /// Block the old-generation collector until a cycle is triggered, then
    /// consume the trigger.
    pub fn wait_for_old_gc(&self, caller: &CollectorThread) -> SyncResult<()> {
        let _blocked = caller.blocked_scope();
        let mut state = self.state.lock();
        while !state.old_gc_pending {
            caller.check_terminate()?;
            self.signal
                .wait_for(&mut state, self.shutdown_poll_interval);
        }
        state.old_gc_pending = false;
        Ok(())
    }

    pub fn is_old_gc_pending(&self) -> bool {
        self.state.lock().old_gc_pending
    }

    pub fn quiescence_gate(&self) -> &QuiescenceGate {
        &self.gate
    }

    pub fn start_relocating_threads(&self, workers: usize, caller: &CollectorThread) -> SyncResult<()> {
        self.gate.start(workers, caller)
    }

    pub fn check_suspend_relocating(&self, caller: &CollectorThread) -> SyncResult<()> {
        self.gate.check_suspend(caller)
    }

    pub fn relocating_thread_done(&self) {
        self.gate.thread_done();
    }

    pub fn request_suspend_relocation(&self, caller: &CollectorThread) -> SyncResult<()> {
        self.gate.request_suspend(caller)
    }

    pub fn resume_relocation(&self) {
        self.gate.resume();
    }

    pub fn verify_no_relocating_threads(&self) {
        self.gate.verify_no_active();
    }

    pub fn verify_relocating_threads(&self) {
        self.gate.verify_active();
    }
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Rendezvous")
            .field("points", &state.points)
            .field("gc_locker_count", &state.gc_locker_count)
            .field("old_gc_pending", &state.old_gc_pending)
            .field("gate", &self.gate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn config() -> SyncConfig {
        SyncConfig {
            shutdown_poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn second_arrival_releases_first() {
        let rendezvous = Arc::new(Rendezvous::new(&config()));
        let first = {
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || {
                let me = CollectorThread::standalone("first");
                rendezvous.end_gc_cycle(&me)
            })
        };

        while rendezvous.waiting_at(RendezvousPoint::GcCycleEnd) == 0 {
            thread::yield_now();
        }
        let second = CollectorThread::standalone("second");
        rendezvous.end_gc_cycle(&second).unwrap();
        first.join().unwrap().unwrap();

        assert_eq!(rendezvous.waiting_at(RendezvousPoint::GcCycleEnd), 0);
        assert_eq!(rendezvous.rounds_completed(RendezvousPoint::GcCycleEnd), 1);
        assert_eq!(rendezvous.rounds_completed(RendezvousPoint::ReadyForRootMarking), 0);
    }

    #[test]
    fn terminated_waiter_withdraws() {
        let rendezvous = Rendezvous::new(&config());
        let me = CollectorThread::standalone("alone");

        thread::scope(|scope| {
            let handle = scope.spawn(|| rendezvous.end_marking_safepoint(&me));
            while rendezvous.waiting_at(RendezvousPoint::EndMarkingSafepoint) == 0 {
                thread::yield_now();
            }
            me.request_terminate();
            assert!(matches!(handle.join().unwrap(), Err(SyncError::ShuttingDown)));
        });
        assert_eq!(rendezvous.waiting_at(RendezvousPoint::EndMarkingSafepoint), 0);
        assert!(!me.is_blocked());
    }

    #[test]
    #[should_panic(expected = "before it was reset")]
    fn third_party_before_reset_panics() {
        let mut slot = PointState::default();
        assert_eq!(slot.register(RendezvousPoint::GcCycleEnd), Some(0));
        // The second party completes the round; the first has not woken yet.
        assert_eq!(slot.register(RendezvousPoint::GcCycleEnd), None);
        slot.register(RendezvousPoint::GcCycleEnd);
    }

    #[derive(Default)]
    struct CountingLocker {
        locks: AtomicUsize,
        unlocks: AtomicUsize,
    }

    impl GcLockerHook for CountingLocker {
        fn lock_concurrent_gc(&self) {
            self.locks.fetch_add(1, Ordering::SeqCst);
        }

        fn unlock_concurrent_gc(&self) {
            self.unlocks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn gc_locker_hooks_fire_on_edges_only() {
        let locker = Arc::new(CountingLocker::default());
        let rendezvous = Rendezvous::with_gc_locker(&config(), Arc::clone(&locker) as Arc<dyn GcLockerHook>);

        rendezvous.start_gc_locker_concurrent();
        rendezvous.start_gc_locker_concurrent();
        assert_eq!(rendezvous.gc_locker_count(), 2);
        rendezvous.end_gc_locker_concurrent();
        assert_eq!(locker.unlocks.load(Ordering::SeqCst), 0);
        rendezvous.end_gc_locker_concurrent();

        assert_eq!(locker.locks.load(Ordering::SeqCst), 1);
        assert_eq!(locker.unlocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "more than twice")]
    fn third_gc_locker_hold_panics() {
        let rendezvous = Rendezvous::new(&config());
        for _ in 0..3 {
            rendezvous.start_gc_locker_concurrent();
        }
    }

    #[test]
    fn old_gc_trigger_is_consumed() {
        let rendezvous = Arc::new(Rendezvous::new(&config()));
        let old_gc = {
            let rendezvous = Arc::clone(&rendezvous);
            thread::spawn(move || {
                let me = CollectorThread::standalone("old-gc");
                rendezvous.wait_for_old_gc(&me)
            })
        };

        rendezvous.trigger_old_gc();
        old_gc.join().unwrap().unwrap();
        assert!(!rendezvous.is_old_gc_pending());

        rendezvous.trigger_old_gc();
        assert!(rendezvous.is_old_gc_pending());
    }

    #[test]
    #[should_panic(expected = "triggered twice")]
    fn double_trigger_panics() {
        let rendezvous = Rendezvous::new(&config());
        rendezvous.trigger_old_gc();
        rendezvous.trigger_old_gc();
    }
}
