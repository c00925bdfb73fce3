//! Thread synchronization core for a pauseless garbage collector.
//!
//! The crate provides the machinery a concurrent collector uses to coordinate
//! with mutator threads and with its own helper threads:
//!
//! - [`safepoint`]: global safepoints and per-thread checkpoints over
//!   self-or-controller thread locks, with timeout reporting and priority
//!   boosting of stragglers.
//! - [`tasks`]: lock-free task queues drained by a fixed pool of workers.
//! - [`rendezvous`]: two-party barriers between the new- and old-generation
//!   collectors, plus the relocation quiescence gate.
//! - [`runtime`]: one context object tying the above together.
//!
//! # Examples
//!
//! ```
//! use pauseless_sync::{Runtime, SyncConfig};
//!
//! let runtime = Runtime::new(SyncConfig::default().with_worker_count(2)).unwrap();
//! let mutator = runtime.attach_mutator("main").unwrap();
//!
//! {
//!     let _safepoint = runtime.safepoints().synchronize();
//!     assert!(runtime.safepoints().is_at_safepoint());
//! }
//!
//! mutator.poll();
//! mutator.detach();
//! runtime.shutdown();
//! ```

pub mod collector_thread;
pub mod config;
pub mod error;
pub mod rendezvous;
pub mod runtime;
pub mod safepoint;
pub mod tasks;
pub mod test_utils;
pub mod thread;

pub use collector_thread::{CollectorThread, ShutdownSignal};
pub use config::{SyncConfig, TimeoutPolicy};
pub use error::{SyncError, SyncResult};
pub use rendezvous::{QuiescenceGate, Rendezvous, RendezvousPoint};
pub use runtime::Runtime;
pub use safepoint::{EpisodeState, EpisodeTimes, SafepointManager, SyncEvent};
pub use tasks::{Task, TaskManager, TaskQueue};
pub use thread::{MutatorThread, ThreadLockState};
