//! Task worker threads.
//!
//! A worker sleeps on the manager's start monitor until the wakeup counter
//! moves past the value it last saw, drains the shared queue, then reports
//! completion on the notify monitor.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::manager::ManagerShared;

/// Entry and exit times of one executed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTimeStamp {
    pub name: String,
    pub entry: Instant,
    pub exit: Instant,
}

/// Per-worker bookkeeping readable by the manager.
#[derive(Debug, Default)]
pub(super) struct WorkerStats {
    pub(super) executed: AtomicU64,
    pub(super) timestamps: Mutex<VecDeque<TaskTimeStamp>>,
}

impl WorkerStats {
    fn record(&self, stamp: TaskTimeStamp, capacity: usize) {
        let mut stamps = self.timestamps.lock();
        if stamps.len() == capacity {
            stamps.pop_front();
        }
        stamps.push_back(stamp);
    }
}

pub(super) struct TaskWorker {
    index: usize,
    shared: Arc<ManagerShared>,
    cached_wakeup: u64,
}

impl TaskWorker {
    pub(super) fn new(index: usize, shared: Arc<ManagerShared>) -> Self {
        Self {
            index,
            shared,
            cached_wakeup: 0,
        }
    }

    pub(super) fn run(mut self) {
        tracing::trace!(target: super::TARGET, manager = %self.shared.name, worker = self.index, "task worker started");
        while self.wait_for_batch() {
            self.drain();
            self.shared.note_completion();
        }
        tracing::trace!(target: super::TARGET, manager = %self.shared.name, worker = self.index, "task worker exiting");
    }

    /// Returns false once the manager shuts down with no batch pending.
    fn wait_for_batch(&mut self) -> bool {
        let mut start = self.shared.start.lock();
        while start.wakeup == self.cached_wakeup {
            if start.shutdown {
                return false;
            }
            self.shared.start_signal.wait(&mut start);
        }
        self.cached_wakeup = start.wakeup;
        true
    }

    fn drain(&self) {
        let stats = &self.shared.workers[self.index];
        let record = self.shared.record_timestamps;
        let queue = self.shared.queue.read();
        while let Some(task) = queue.grab() {
            let entry = Instant::now();
            task.execute(self.index);
            let exit = Instant::now();

            self.shared.batch_completed.fetch_add(1, Ordering::AcqRel);
            stats.executed.fetch_add(1, Ordering::Relaxed);
            if record {
                stats.record(
                    TaskTimeStamp {
                        name: task.name().to_string(),
                        entry,
                        exit,
                    },
                    self.shared.timestamp_capacity,
                );
            }
        }
        self.shared.counters.queue_emptied.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timestamp_ring_drops_oldest() {
        let stats = WorkerStats::default();
        let now = Instant::now();
        for i in 0..5u64 {
            stats.record(
                TaskTimeStamp {
                    name: format!("t{i}"),
                    entry: now,
                    exit: now + Duration::from_micros(i),
                },
                3,
            );
        }
        let names: Vec<_> = stats
            .timestamps
            .lock()
            .iter()
            .map(|stamp| stamp.name.clone())
            .collect();
        assert_eq!(names, vec!["t2", "t3", "t4"]);
    }
}
