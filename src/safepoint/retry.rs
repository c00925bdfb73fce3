//! Bounded polling loop shared by the safepoint and checkpoint coordinators.

use std::time::{Duration, Instant};

/// Drives `attempt` until it reports completion.
///
/// Between passes the caller-provided `wait` runs with the configured
/// interval. `on_timeout` fires exactly once, on the first pass that ends
/// after the deadline; the loop carries on afterwards unless the callback
/// panics.
#[derive(Debug)]
pub(crate) struct PollLoop {
    started: Instant,
    timeout: Duration,
    interval: Duration,
    passes: u32,
    timed_out: bool,
}

impl PollLoop {
    pub(crate) fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            interval,
            passes: 0,
            timed_out: false,
        }
    }

    /// Completed passes that did not finish the job.
    pub(crate) fn passes(&self) -> u32 {
        self.passes
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub(crate) fn run<S>(
        &mut self,
        state: &mut S,
        mut attempt: impl FnMut(&mut S, u32) -> bool,
        mut wait: impl FnMut(&mut S, Duration),
        mut on_timeout: impl FnMut(&S, Duration),
    ) {
        loop {
            if attempt(state, self.passes) {
                return;
            }

            let elapsed = self.started.elapsed();
            if !self.timed_out && elapsed >= self.timeout {
                self.timed_out = true;
                on_timeout(state, elapsed);
            }

            wait(state, self.interval);
            self.passes += 1;
        }
    }
}
