//! Parallel task execution for collector phases.
//!
//! A collector thread fills a [`TaskQueue`], hands it to a [`TaskManager`]
//! with [`add_list`](TaskManager::add_list), and blocks until every worker in
//! the pool has drained the shared queue. Only one batch is in flight per
//! manager at a time.

mod manager;
mod queue;
mod task;
mod worker;

#[cfg(test)]
mod tests;

pub use manager::{TaskManager, TaskPerfCounters};
pub use queue::TaskQueue;
pub use task::{FnTask, Task};
pub use worker::TaskTimeStamp;

const TARGET: &str = "pauseless_sync::tasks";
