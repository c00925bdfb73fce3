//! Tests for the task worker pool

use super::*;
use crate::collector_thread::CollectorThread;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::test_utils::{CountingTask, TEST_WORKER_COUNT, counting_batch};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn manager(workers: usize) -> TaskManager {
    TaskManager::new(&SyncConfig::default().with_worker_count(workers), "test-task").unwrap()
}

#[test]
fn every_task_runs_exactly_once() {
    let manager = manager(TEST_WORKER_COUNT);
    let caller = CollectorThread::standalone("gc");
    let counter = Arc::new(AtomicUsize::new(0));

    let mut batch = counting_batch(40, &counter);
    manager.add_list(&mut batch, &caller).unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 40);
    assert!(batch.is_empty());
    assert!(manager.is_idle());
    assert_eq!(manager.tasks_per_worker().iter().sum::<u64>(), 40);
}

#[test]
fn sequential_batches_reuse_the_pool() {
    let manager = manager(TEST_WORKER_COUNT);
    let caller = CollectorThread::standalone("gc");
    let counter = Arc::new(AtomicUsize::new(0));

    for round in 1..=5 {
        let mut batch = counting_batch(round * 3, &counter);
        manager.add_list(&mut batch, &caller).unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3 + 6 + 9 + 12 + 15);

    let counters = manager.perf_counters();
    assert_eq!(counters.lists_added, 5);
    assert_eq!(counters.tasks_delivered, 45);
    assert_eq!(counters.tasks_completed, 45);
    assert_eq!(counters.queue_emptied, 5 * TEST_WORKER_COUNT as u64);
}

#[test]
fn empty_batch_still_wakes_every_worker() {
    let manager = manager(3);
    let caller = CollectorThread::standalone("gc");
    let mut batch = TaskQueue::new();
    manager.add_list(&mut batch, &caller).unwrap();

    let counters = manager.perf_counters();
    assert_eq!(counters.lists_added, 1);
    assert_eq!(counters.tasks_completed, 0);
    assert_eq!(counters.queue_emptied, 3);
}

#[test]
fn slow_tasks_spread_across_workers() {
    let manager = manager(TEST_WORKER_COUNT);
    let caller = CollectorThread::standalone("gc");
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Arc<CountingTask>> = (0..16)
        .map(|i| {
            Arc::new(
                CountingTask::new(format!("slow-{i}"), Arc::clone(&counter))
                    .with_delay(Duration::from_millis(5)),
            )
        })
        .collect();

    let mut batch = TaskQueue::new();
    for task in &tasks {
        let task = Arc::clone(task);
        batch.enqueue(FnTask::new(task.name().to_string(), move |worker| {
            task.execute(worker)
        }));
    }
    manager.add_list(&mut batch, &caller).unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 16);
    let workers: HashSet<usize> = tasks.iter().filter_map(|task| task.last_worker()).collect();
    assert!(workers.len() > 1, "all slow tasks ran on one worker");
    assert!(workers.iter().all(|&worker| worker < TEST_WORKER_COUNT));
}

#[test]
fn reset_clears_counters_and_history() {
    let manager = TaskManager::new(
        &SyncConfig::default()
            .with_worker_count(2)
            .with_task_timestamps(true),
        "reset-task",
    )
    .unwrap();
    let caller = CollectorThread::standalone("gc");
    let counter = Arc::new(AtomicUsize::new(0));

    let mut batch = counting_batch(6, &counter);
    manager.add_list(&mut batch, &caller).unwrap();
    assert_ne!(manager.perf_counters(), TaskPerfCounters::default());

    manager.reset_perf_counters();
    assert_eq!(manager.perf_counters(), TaskPerfCounters::default());
    assert_eq!(manager.tasks_per_worker(), vec![0, 0]);
    assert!(manager.task_time_stamps().iter().all(Vec::is_empty));
}

#[test]
fn timestamps_recorded_only_when_enabled() {
    let caller = CollectorThread::standalone("gc");
    let counter = Arc::new(AtomicUsize::new(0));

    let quiet = manager(2);
    let mut batch = counting_batch(4, &counter);
    quiet.add_list(&mut batch, &caller).unwrap();
    assert!(quiet.task_time_stamps().iter().all(Vec::is_empty));

    let recording = TaskManager::new(
        &SyncConfig::default()
            .with_worker_count(2)
            .with_task_timestamps(true),
        "stamped-task",
    )
    .unwrap();
    let mut batch = counting_batch(4, &counter);
    recording.add_list(&mut batch, &caller).unwrap();

    let stamps: Vec<TaskTimeStamp> = recording.task_time_stamps().into_iter().flatten().collect();
    assert_eq!(stamps.len(), 4);
    assert!(stamps.iter().all(|stamp| stamp.exit >= stamp.entry));
    assert!(stamps.iter().all(|stamp| stamp.name.starts_with("count-")));
}

#[test]
fn terminated_caller_is_refused() {
    let manager = manager(2);
    let caller = CollectorThread::standalone("gc");
    caller.request_terminate();

    let counter = Arc::new(AtomicUsize::new(0));
    let mut batch = counting_batch(4, &counter);
    assert!(matches!(
        manager.add_list(&mut batch, &caller),
        Err(SyncError::ShuttingDown)
    ));
    assert_eq!(batch.len(), 4);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn termination_during_a_batch_unblocks_the_caller() {
    let manager = manager(1);
    let caller = Arc::new(CollectorThread::standalone("gc"));
    let counter = Arc::new(AtomicUsize::new(0));

    let mut batch = TaskQueue::new();
    batch.enqueue(
        CountingTask::new("long", Arc::clone(&counter)).with_delay(Duration::from_millis(300)),
    );

    let terminator = {
        let caller = Arc::clone(&caller);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            caller.request_terminate();
        })
    };
    let result = manager.add_list(&mut batch, &caller);
    terminator.join().unwrap();

    assert!(matches!(result, Err(SyncError::ShuttingDown)));
    assert!(!caller.is_blocked());
    // Shutdown still waits for the running task before joining.
    manager.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn caller_is_marked_blocked_while_waiting() {
    let manager = manager(1);
    let caller = Arc::new(CollectorThread::standalone("gc"));
    let seen_blocked = Arc::new(AtomicUsize::new(0));

    let mut batch = TaskQueue::new();
    {
        let caller = Arc::clone(&caller);
        let seen_blocked = Arc::clone(&seen_blocked);
        batch.enqueue(FnTask::new("check-blocked", move |_| {
            if caller.is_blocked() {
                seen_blocked.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    manager.add_list(&mut batch, &caller).unwrap();

    assert_eq!(seen_blocked.load(Ordering::SeqCst), 1);
    assert!(!caller.is_blocked());
}

#[test]
#[should_panic(expected = "in flight")]
fn overlapping_batches_panic() {
    let manager = Arc::new(manager(1));
    let counter = Arc::new(AtomicUsize::new(0));

    let first = {
        let manager = Arc::clone(&manager);
        let counter = Arc::clone(&counter);
        thread::spawn(move || {
            let caller = CollectorThread::standalone("first-gc");
            let mut batch = TaskQueue::new();
            batch.enqueue(
                CountingTask::new("slow", counter).with_delay(Duration::from_millis(300)),
            );
            manager.add_list(&mut batch, &caller)
        })
    };
    while manager.is_idle() {
        thread::yield_now();
    }

    let second = CollectorThread::standalone("second-gc");
    let mut batch = counting_batch(1, &counter);
    let _ = manager.add_list(&mut batch, &second);
    drop(first);
}

#[test]
fn zero_workers_is_a_config_error() {
    let result = TaskManager::new(&SyncConfig::default().with_worker_count(0), "none");
    assert!(matches!(result, Err(SyncError::NoWorkers)));
}

#[test]
fn shutdown_is_idempotent() {
    let manager = manager(2);
    manager.shutdown();
    manager.shutdown();
    assert!(manager.is_idle());
}

#[test]
fn workers_are_named_after_the_manager() {
    let manager = manager(2);
    let caller = CollectorThread::standalone("gc");
    let names = Arc::new(parking_lot::Mutex::new(HashSet::new()));

    let mut batch = TaskQueue::new();
    for _ in 0..8 {
        let names = Arc::clone(&names);
        batch.enqueue(FnTask::new("name", move |_| {
            if let Some(name) = thread::current().name() {
                names.lock().insert(name.to_string());
            }
            thread::sleep(Duration::from_millis(2));
        }));
    }
    manager.add_list(&mut batch, &caller).unwrap();

    let names = names.lock();
    assert!(!names.is_empty());
    assert!(names.iter().all(|name| name.starts_with("test-task-")));
}
