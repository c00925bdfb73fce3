//! Checkpoints: run a callback once on every mutator without stopping them all.
//!
//! Threads that are in native code get the callback executed on their behalf
//! by the initiator; threads running managed code pick it up at their next
//! poll. Stragglers are hurried along with a one-off priority boost.

use crate::thread::{MutatorInner, MutatorThread, SuspendFlags};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use super::{
    TARGET,
    events::SyncEvent,
    manager::{CheckpointClosure, SafepointManager},
    retry::PollLoop,
    state::EpisodeState,
    times::EpisodeTimes,
};

struct CheckpointProgress {
    pending: Vec<Arc<MutatorInner>>,
    self_checkpoints: usize,
    closure_time: Duration,
    priority_boosts: usize,
    priority_boosted: Option<Instant>,
}

impl SafepointManager {
    /// Run `callback` exactly once for every attached mutator.
    ///
    /// Returns when every thread has been handled. Called from a safepoint
    /// the caller already holds, the callback is applied to every thread
    /// directly and the returned times are empty.
    ///
    /// Must not be called by an attached mutator that holds its own lock.
    ///
    /// # Examples
    ///
    /// ```
    /// use pauseless_sync::safepoint::SafepointManager;
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let manager = SafepointManager::new_for_testing();
    /// let mutator = manager.attach("idle").unwrap();
    /// mutator.enter_native();
    ///
    /// let visits = Arc::new(AtomicUsize::new(0));
    /// let counter = Arc::clone(&visits);
    /// let times = manager.do_checkpoint(move |_thread| {
    ///     counter.fetch_add(1, Ordering::SeqCst);
    /// });
    ///
    /// assert_eq!(visits.load(Ordering::SeqCst), 1);
    /// assert_eq!(times.self_checkpoints, 0);
    /// mutator.leave_native();
    /// mutator.detach();
    /// ```
    pub fn do_checkpoint<F>(self: &Arc<Self>, callback: F) -> EpisodeTimes
    where
        F: Fn(&MutatorThread) + Send + Sync + 'static,
    {
        if self.is_at_safepoint() && self.coordination.is_held_by_current() {
            for inner in self.registry.snapshot() {
                callback(&MutatorThread::from_parts(inner, Arc::clone(self)));
            }
            tracing::debug!(target: TARGET, "checkpoint applied inside safepoint");
            return EpisodeTimes::empty();
        }

        let mut times = EpisodeTimes::starting_at(Instant::now());
        self.coordination.acquire();
        times.lock_acquired = Instant::now();
        assert_eq!(
            self.state(),
            EpisodeState::NotSynchronized,
            "checkpoint requested while another episode is in flight"
        );

        let closure = Arc::new(CheckpointClosure {
            callback: Box::new(callback),
        });
        self.checkpoint_callback.store(Some(Arc::clone(&closure)));
        self.priority_boosted.store(false, Ordering::Release);
        self.state.store(EpisodeState::Checkpointing);

        let threads = self.registry.snapshot();
        times.threads = threads.len();
        times.begin_notify = Instant::now();
        for thread in &threads {
            thread.set_suspend(SuspendFlags::CHECKPOINT);
        }
        times.all_notified = Instant::now();
        tracing::debug!(target: TARGET, threads = threads.len(), "checkpoint started");

        let policy = self.config.checkpoint_timeout;
        let boost_after = self.config.priority_boost_passes;
        let mut poll = PollLoop::new(policy.delay, self.config.safepoint_poll_interval);
        let mut progress = CheckpointProgress {
            pending: threads,
            self_checkpoints: 0,
            closure_time: Duration::ZERO,
            priority_boosts: 0,
            priority_boosted: None,
        };
        poll.run(
            &mut progress,
            |progress, pass| {
                let boosted = progress.priority_boosted.is_some();
                let CheckpointProgress {
                    pending,
                    self_checkpoints,
                    closure_time,
                    ..
                } = progress;
                pending.retain(|inner| {
                    !self.try_checkpoint(inner, &closure, boosted, self_checkpoints, closure_time)
                });

                if progress.pending.is_empty() {
                    return true;
                }
                if !boosted && pass + 1 >= boost_after {
                    self.boost_stragglers(progress);
                }
                false
            },
            |_, interval| thread::sleep(interval),
            |progress, elapsed| {
                self.report_timeout("checkpoint", &progress.pending, elapsed, policy)
            },
        );

        times.reached = Instant::now();
        times.cleanup_done = times.reached;
        times.work_done = times.reached;
        times.priority_boosted = progress.priority_boosted;
        times.priority_boosts = progress.priority_boosts;
        times.self_checkpoints = progress.self_checkpoints;
        times.closure_time = progress.closure_time;
        times.timed_out = poll.timed_out();

        self.checkpoint_callback.store(None);
        self.priority_boosted.store(false, Ordering::Release);
        self.state.store(EpisodeState::NotSynchronized);
        times.wakeup_done = Instant::now();

        times.log_checkpoint();
        self.summary.lock().record_checkpoint(&times);
        *self.last_times.lock() = Some(times);
        self.coordination.release();

        self.events.publish(SyncEvent::CheckpointCompleted {
            threads: times.threads,
            self_checkpoints: times.self_checkpoints,
            priority_boosts: times.priority_boosts,
        });
        times
    }

    /// One attempt at finishing `inner`'s checkpoint. Returns true once the
    /// thread no longer needs attention.
    fn try_checkpoint(
        self: &Arc<Self>,
        inner: &Arc<MutatorInner>,
        closure: &CheckpointClosure,
        boosted: bool,
        self_checkpoints: &mut usize,
        closure_time: &mut Duration,
    ) -> bool {
        let thread = MutatorThread::from_parts(Arc::clone(inner), Arc::clone(self));
        if inner.try_lock_controller() {
            if inner.test_clear_suspend(SuspendFlags::CHECKPOINT) {
                let started = Instant::now();
                (closure.callback)(&thread);
                *closure_time += started.elapsed();
            } else {
                *self_checkpoints += 1;
            }
            inner.unlock_controller();
        } else if !inner.suspend_flags().contains(SuspendFlags::CHECKPOINT) {
            *self_checkpoints += 1;
        } else {
            return false;
        }

        if boosted {
            self.scheduler.restore_priority(&thread, thread.priority());
        }
        true
    }

    fn boost_stragglers(self: &Arc<Self>, progress: &mut CheckpointProgress) {
        let priority = self.config.boost_priority;
        self.priority_boosted.store(true, Ordering::Release);
        for inner in &progress.pending {
            let thread = MutatorThread::from_parts(Arc::clone(inner), Arc::clone(self));
            self.scheduler.raise_priority(&thread, priority);
        }
        progress.priority_boosts += progress.pending.len();
        progress.priority_boosted = Some(Instant::now());
        tracing::debug!(
            target: TARGET,
            stragglers = progress.pending.len(),
            priority,
            "checkpoint boosted straggler priority"
        );
    }
}
