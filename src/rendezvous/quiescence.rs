//! Quiescence gate for relocating worker threads.
//!
//! Relocation workers call [`QuiescenceGate::check_suspend`] between units
//! of work. When the collector asks for a suspension, each worker parks at
//! its next check and drops out of the active count; the collector proceeds
//! once the count has drained to zero.

use crate::collector_thread::CollectorThread;
use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::TARGET;

#[derive(Debug, Default)]
struct GateState {
    suspended: bool,
    active: usize,
}

/// Suspend flag plus active-worker count behind one monitor.
///
/// # Examples
///
/// ```
/// use pauseless_sync::collector_thread::CollectorThread;
/// use pauseless_sync::rendezvous::QuiescenceGate;
/// use std::time::Duration;
///
/// let gate = QuiescenceGate::new(Duration::from_millis(1), Duration::from_millis(1));
/// let collector = CollectorThread::standalone("collector");
///
/// gate.start(1, &collector).unwrap();
/// gate.thread_done();
///
/// // Nobody is active, so the suspension is granted at once.
/// gate.request_suspend(&collector).unwrap();
/// gate.resume();
/// gate.verify_no_active();
/// ```
#[derive(Debug)]
pub struct QuiescenceGate {
    state: Mutex<GateState>,
    changed: Condvar,
    /// Lock-free mirror of `state.suspended` for the worker fast path
    suspend_requested: AtomicBool,
    quiescence_poll_interval: Duration,
    shutdown_poll_interval: Duration,
}

impl QuiescenceGate {
    pub fn new(quiescence_poll_interval: Duration, shutdown_poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
            suspend_requested: AtomicBool::new(false),
            quiescence_poll_interval,
            shutdown_poll_interval,
        }
    }

    /// Register `workers` relocating threads, waiting out any suspension.
    ///
    /// # Panics
    ///
    /// If workers from a previous start are still active.
    pub fn start(&self, workers: usize, caller: &CollectorThread) -> SyncResult<()> {
        let mut state = self.state.lock();
        while state.suspended {
            caller.check_terminate()?;
            self.changed
                .wait_for(&mut state, self.shutdown_poll_interval);
        }
        assert_eq!(state.active, 0, "relocating threads started while others are active");
        state.active = workers;
        tracing::debug!(target: TARGET, workers, "relocating threads started");
        Ok(())
    }

    /// Park here while a suspension is requested.
    ///
    /// On `Err` the caller has left the active count for good.
    pub fn check_suspend(&self, caller: &CollectorThread) -> SyncResult<()> {
        if !self.suspend_requested.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut state = self.state.lock();
        if !state.suspended {
            return Ok(());
        }

        let _blocked = caller.blocked_scope();
        assert!(state.active > 0, "unregistered thread parked at the quiescence gate");
        state.active -= 1;
        if state.active == 0 {
            self.changed.notify_all();
        }
        tracing::trace!(target: TARGET, thread = caller.name(), "relocating thread parked");

        while state.suspended {
            if caller.should_terminate() {
                return Err(SyncError::ShuttingDown);
            }
            self.changed
                .wait_for(&mut state, self.shutdown_poll_interval);
        }
        state.active += 1;
        Ok(())
    }

    /// Ask every active worker to park and wait until they all have.
    ///
    /// # Panics
    ///
    /// If a suspension is already in effect.
    pub fn request_suspend(&self, caller: &CollectorThread) -> SyncResult<()> {
        let _blocked = caller.blocked_scope();
        let mut state = self.state.lock();
        assert!(!state.suspended, "relocation suspended twice");
        state.suspended = true;
        self.suspend_requested.store(true, Ordering::Release);

        while state.active > 0 {
            if caller.should_terminate() {
                return Err(SyncError::ShuttingDown);
            }
            tracing::trace!(target: TARGET, active = state.active, "waiting for relocating threads to park");
            self.changed
                .wait_for(&mut state, self.quiescence_poll_interval);
        }
        tracing::debug!(target: TARGET, "relocation suspended");
        Ok(())
    }

    /// Release every parked worker.
    ///
    /// # Panics
    ///
    /// If no suspension is in effect or a worker is still active.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        assert!(state.suspended, "relocation resumed without a suspension");
        assert_eq!(state.active, 0, "relocation resumed with active threads");
        state.suspended = false;
        self.suspend_requested.store(false, Ordering::Release);
        self.changed.notify_all();
        tracing::debug!(target: TARGET, "relocation resumed");
    }

    /// A worker finished relocating and leaves the active count.
    pub fn thread_done(&self) {
        let mut state = self.state.lock();
        assert!(state.active > 0, "relocating thread finished twice");
        state.active -= 1;
        if state.active == 0 {
            self.changed.notify_all();
        }
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn verify_no_active(&self) {
        let active = self.active();
        assert_eq!(active, 0, "{active} relocating threads still active");
    }

    pub fn verify_active(&self) {
        assert!(self.active() > 0, "no relocating threads active");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn gate() -> QuiescenceGate {
        QuiescenceGate::new(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn check_suspend_is_free_when_not_requested() {
        let gate = gate();
        let worker = CollectorThread::standalone("worker");
        gate.start(1, &worker).unwrap();
        gate.check_suspend(&worker).unwrap();
        assert_eq!(gate.active(), 1);
        gate.thread_done();
        gate.verify_no_active();
    }

    #[test]
    fn workers_park_and_resume() {
        let gate = Arc::new(gate());
        let collector = CollectorThread::standalone("collector");
        let stop = Arc::new(AtomicBool::new(false));
        let rounds = Arc::new(AtomicUsize::new(0));
        gate.start(2, &collector).unwrap();

        let workers: Vec<_> = (0..2)
            .map(|i| {
                let gate = Arc::clone(&gate);
                let stop = Arc::clone(&stop);
                let rounds = Arc::clone(&rounds);
                thread::spawn(move || {
                    let me = CollectorThread::standalone(format!("relocator-{i}"));
                    while !stop.load(Ordering::Acquire) {
                        gate.check_suspend(&me).unwrap();
                        rounds.fetch_add(1, Ordering::Relaxed);
                    }
                    gate.thread_done();
                })
            })
            .collect();

        gate.request_suspend(&collector).unwrap();
        assert_eq!(gate.active(), 0);
        let frozen = rounds.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(10));
        // Each worker may finish the round it was in when it parked.
        assert!(rounds.load(Ordering::Relaxed) <= frozen + 2);

        stop.store(true, Ordering::Release);
        gate.resume();
        for worker in workers {
            worker.join().unwrap();
        }
        gate.verify_no_active();
    }

    #[test]
    fn start_waits_out_a_suspension() {
        let gate = Arc::new(gate());
        let collector = CollectorThread::standalone("collector");
        gate.request_suspend(&collector).unwrap();

        let starter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let me = CollectorThread::standalone("starter");
                gate.start(3, &me).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!starter.is_finished());

        gate.resume();
        starter.join().unwrap();
        gate.verify_active();
        assert_eq!(gate.active(), 3);
    }

    #[test]
    fn shutdown_releases_waiting_collector() {
        let gate = gate();
        let collector = CollectorThread::standalone("collector");
        let worker = CollectorThread::standalone("worker");
        gate.start(1, &worker).unwrap();

        collector.request_terminate();
        assert!(matches!(
            gate.request_suspend(&collector),
            Err(SyncError::ShuttingDown)
        ));
    }

    #[test]
    #[should_panic(expected = "suspended twice")]
    fn double_suspend_panics() {
        let gate = gate();
        let collector = CollectorThread::standalone("collector");
        gate.request_suspend(&collector).unwrap();
        let _ = gate.request_suspend(&collector);
    }

    #[test]
    #[should_panic(expected = "active threads")]
    fn resume_with_active_threads_panics() {
        let gate = gate();
        let collector = CollectorThread::standalone("collector");
        let worker = CollectorThread::standalone("worker");
        gate.start(1, &worker).unwrap();
        collector.request_terminate();
        let _ = gate.request_suspend(&collector);
        gate.resume();
    }
}
