//! Safepoints and checkpoints over the attached mutator threads.
//!
//! A *safepoint* stops every mutator: the coordinator steals each thread's
//! distributed lock, directly when the thread is in native code, or by
//! waiting for it to reach a poll point and park itself. A *checkpoint* is
//! lighter: each mutator runs a callback once, either on its own at a poll
//! point or executed on its behalf while it sits in native code.
//!
//! ## Architecture
//!
//! - **Mutators** poll a per-thread suspend bitmask; the fast path is a
//!   single load ([`MutatorThread::poll`](crate::thread::MutatorThread::poll))
//! - **Coordinator** holds one coordination lock for the whole episode,
//!   which also freezes thread attach and detach
//! - **Diagnostics** come out as `tracing` events and [`SyncEvent`]s
//!
//! ## Usage
//!
//! ```
//! use pauseless_sync::safepoint::SafepointManager;
//! use std::thread;
//!
//! let manager = SafepointManager::new_for_testing();
//! let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
//!
//! let mutator = {
//!     let manager = std::sync::Arc::clone(&manager);
//!     let stop = std::sync::Arc::clone(&stop);
//!     thread::spawn(move || {
//!         let me = manager.attach("loop").unwrap();
//!         while !stop.load(std::sync::atomic::Ordering::Acquire) {
//!             me.poll();
//!         }
//!         me.detach();
//!     })
//! };
//!
//! while manager.thread_count() == 0 {
//!     thread::yield_now();
//! }
//! let times = manager.begin();
//! assert_eq!(times.threads, 1);
//! manager.end();
//!
//! stop.store(true, std::sync::atomic::Ordering::Release);
//! mutator.join().unwrap();
//! ```

mod checkpoint;
mod coordination_lock;
mod events;
mod manager;
mod retry;
mod scheduler;
mod state;
mod times;


pub use events::SyncEvent;
pub use manager::{CheckpointCallback, CleanupHook, SafepointGuard, SafepointManager};
pub use scheduler::{NoopScheduler, SchedulerHints};
pub use state::EpisodeState;
pub use times::{EpisodeTimes, SafepointSummary};

const TARGET: &str = "pauseless_sync::safepoint";
