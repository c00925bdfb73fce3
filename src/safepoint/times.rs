//! Per-episode timing breakdown and the process-lifetime maxima.

use super::TARGET;
use std::time::{Duration, Instant};

/// Timestamps captured while a safepoint or checkpoint runs.
///
/// Every instant starts out equal to `acquire_lock` and is overwritten as
/// the episode progresses, so a phase that never ran reports zero.
#[derive(Debug, Clone, Copy)]
pub struct EpisodeTimes {
    pub acquire_lock: Instant,
    pub lock_acquired: Instant,
    pub begin_notify: Instant,
    pub all_notified: Instant,
    pub reached: Instant,
    pub cleanup_done: Instant,
    pub work_done: Instant,
    pub wakeup_done: Instant,
    /// When stragglers first got a priority boost
    pub priority_boosted: Option<Instant>,
    pub threads: usize,
    pub priority_boosts: usize,
    pub self_checkpoints: usize,
    /// Time spent running the checkpoint callback on behalf of threads
    pub closure_time: Duration,
    /// Stragglers outlived the timeout policy and were reported
    pub timed_out: bool,
}

impl EpisodeTimes {
    pub fn starting_at(acquire_lock: Instant) -> Self {
        Self {
            acquire_lock,
            lock_acquired: acquire_lock,
            begin_notify: acquire_lock,
            all_notified: acquire_lock,
            reached: acquire_lock,
            cleanup_done: acquire_lock,
            work_done: acquire_lock,
            wakeup_done: acquire_lock,
            priority_boosted: None,
            threads: 0,
            priority_boosts: 0,
            self_checkpoints: 0,
            closure_time: Duration::ZERO,
            timed_out: false,
        }
    }

    /// All-zero times, reported when no episode actually ran.
    pub fn empty() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn lock_time(&self) -> Duration {
        self.lock_acquired.saturating_duration_since(self.acquire_lock)
    }

    pub fn notify_time(&self) -> Duration {
        self.all_notified.saturating_duration_since(self.begin_notify)
    }

    pub fn wait_time(&self) -> Duration {
        self.reached.saturating_duration_since(self.all_notified)
    }

    pub fn cleanup_time(&self) -> Duration {
        self.cleanup_done.saturating_duration_since(self.reached)
    }

    pub fn op_time(&self) -> Duration {
        self.work_done.saturating_duration_since(self.cleanup_done)
    }

    pub fn wakeup_time(&self) -> Duration {
        self.wakeup_done.saturating_duration_since(self.work_done)
    }

    /// From asking for the lock until every thread stopped.
    pub fn time_to_safepoint(&self) -> Duration {
        self.reached.saturating_duration_since(self.acquire_lock)
    }

    pub fn total(&self) -> Duration {
        self.wakeup_done.saturating_duration_since(self.acquire_lock)
    }

    /// Wait between the boost and the last straggler checking in.
    pub fn boosted_wait(&self) -> Duration {
        self.priority_boosted
            .map(|boosted| self.reached.saturating_duration_since(boosted))
            .unwrap_or_default()
    }

    pub(super) fn log_safepoint(&self) {
        tracing::info!(
            target: TARGET,
            threads = self.threads,
            lock_us = self.lock_time().as_micros() as u64,
            notify_us = self.notify_time().as_micros() as u64,
            wait_us = self.wait_time().as_micros() as u64,
            cleanup_us = self.cleanup_time().as_micros() as u64,
            op_us = self.op_time().as_micros() as u64,
            wakeup_us = self.wakeup_time().as_micros() as u64,
            total_us = self.total().as_micros() as u64,
            timed_out = self.timed_out,
            "safepoint"
        );
    }

    pub(super) fn log_checkpoint(&self) {
        tracing::info!(
            target: TARGET,
            threads = self.threads,
            lock_us = self.lock_time().as_micros() as u64,
            notify_us = self.notify_time().as_micros() as u64,
            wait_us = self.wait_time().as_micros() as u64,
            boosted_wait_us = self.boosted_wait().as_micros() as u64,
            closure_us = self.closure_time.as_micros() as u64,
            total_us = self.total().as_micros() as u64,
            timed_out = self.timed_out,
            priority_boosts = self.priority_boosts,
            self_checkpoints = self.self_checkpoints,
            "checkpoint"
        );
    }
}

impl Default for EpisodeTimes {
    fn default() -> Self {
        Self::empty()
    }
}

/// Longest episodes observed since the runtime started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafepointSummary {
    pub safepoints: u64,
    pub checkpoints: u64,
    pub max_safepoint: Duration,
    pub max_time_to_safepoint: Duration,
    pub max_checkpoint: Duration,
}

impl SafepointSummary {
    pub(super) fn record_safepoint(&mut self, times: &EpisodeTimes) {
        self.safepoints += 1;
        self.max_safepoint = self.max_safepoint.max(times.total());
        self.max_time_to_safepoint = self.max_time_to_safepoint.max(times.time_to_safepoint());
    }

    pub(super) fn record_checkpoint(&mut self, times: &EpisodeTimes) {
        self.checkpoints += 1;
        self.max_checkpoint = self.max_checkpoint.max(times.total());
    }

    /// Emit the exit-time statistics line.
    pub fn log(&self) {
        tracing::info!(
            target: TARGET,
            safepoints = self.safepoints,
            checkpoints = self.checkpoints,
            max_safepoint_us = self.max_safepoint.as_micros() as u64,
            max_time_to_safepoint_us = self.max_time_to_safepoint.as_micros() as u64,
            max_checkpoint_us = self.max_checkpoint.as_micros() as u64,
            "safepoint summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_times_are_zero() {
        let times = EpisodeTimes::empty();
        assert_eq!(times.total(), Duration::ZERO);
        assert_eq!(times.boosted_wait(), Duration::ZERO);
    }

    #[test]
    fn phases_partition_the_total() {
        let start = Instant::now();
        let ms = Duration::from_millis;
        let times = EpisodeTimes {
            lock_acquired: start + ms(1),
            begin_notify: start + ms(1),
            all_notified: start + ms(2),
            reached: start + ms(5),
            cleanup_done: start + ms(6),
            work_done: start + ms(10),
            wakeup_done: start + ms(11),
            ..EpisodeTimes::starting_at(start)
        };
        assert_eq!(times.lock_time(), ms(1));
        assert_eq!(times.notify_time(), ms(1));
        assert_eq!(times.wait_time(), ms(3));
        assert_eq!(times.cleanup_time(), ms(1));
        assert_eq!(times.op_time(), ms(4));
        assert_eq!(times.wakeup_time(), ms(1));
        assert_eq!(times.time_to_safepoint(), ms(5));
        assert_eq!(times.total(), ms(11));
    }

    #[test]
    fn summary_tracks_maxima_separately() {
        let start = Instant::now();
        let slow_to_stop = EpisodeTimes {
            reached: start + Duration::from_millis(8),
            wakeup_done: start + Duration::from_millis(9),
            ..EpisodeTimes::starting_at(start)
        };
        let long_pause = EpisodeTimes {
            reached: start + Duration::from_millis(1),
            wakeup_done: start + Duration::from_millis(20),
            ..EpisodeTimes::starting_at(start)
        };

        let mut summary = SafepointSummary::default();
        summary.record_safepoint(&slow_to_stop);
        summary.record_safepoint(&long_pause);

        assert_eq!(summary.safepoints, 2);
        assert_eq!(summary.max_safepoint, Duration::from_millis(20));
        assert_eq!(summary.max_time_to_safepoint, Duration::from_millis(8));
    }
}
