use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use pauseless_sync::collector_thread::CollectorThread;
use pauseless_sync::config::SyncConfig;
use pauseless_sync::safepoint::SafepointManager;
use pauseless_sync::tasks::{FnTask, TaskManager, TaskQueue};
use pauseless_sync::test_utils::{ScriptedMutator, counting_batch};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

fn bench_poll_fast_path(c: &mut Criterion) {
    let manager = SafepointManager::new_for_testing();
    let mutator = manager.attach("bench").unwrap();

    c.bench_function("poll_fast_path", |b| {
        b.iter(|| mutator.poll());
    });

    c.bench_function("native_transition", |b| {
        b.iter(|| mutator.run_native(|| std::hint::black_box(1)));
    });

    mutator.detach();
}

fn bench_safepoint_native_threads(c: &mut Criterion) {
    let manager = SafepointManager::new_for_testing();
    let natives: Vec<_> = (0..4)
        .map(|i| manager.attach(format!("native-{i}")).unwrap())
        .collect();
    for thread in &natives {
        thread.enter_native();
    }

    c.bench_function("safepoint_native_threads", |b| {
        b.iter(|| {
            let safepoint = manager.synchronize();
            std::hint::black_box(safepoint.times().threads);
        });
    });

    for thread in natives {
        thread.leave_native();
        thread.detach();
    }
}

fn bench_safepoint_polling_threads(c: &mut Criterion) {
    let manager = SafepointManager::new_for_testing();
    let pollers: Vec<_> = (0..4)
        .map(|i| ScriptedMutator::polling(&manager, &format!("poller-{i}")))
        .collect();

    c.bench_function("safepoint_polling_threads", |b| {
        b.iter(|| std::hint::black_box(manager.synchronize().times().time_to_safepoint()));
    });

    c.bench_function("checkpoint_polling_threads", |b| {
        b.iter(|| std::hint::black_box(manager.do_checkpoint(|thread| {
            std::hint::black_box(thread.id());
        })));
    });

    for poller in pollers {
        poller.stop();
    }
}

fn bench_task_batches(c: &mut Criterion) {
    let manager = TaskManager::new(&SyncConfig::default().with_worker_count(4), "bench-task").unwrap();
    let caller = CollectorThread::standalone("bench-gc");
    let counter = Arc::new(AtomicUsize::new(0));

    c.bench_function("task_batch_64", |b| {
        b.iter_batched(
            || counting_batch(64, &counter),
            |mut batch| manager.add_list(&mut batch, &caller).unwrap(),
            BatchSize::SmallInput,
        );
    });
}

fn bench_queue_grab(c: &mut Criterion) {
    fn noop(_worker: usize) {}

    c.bench_function("queue_grab_1024", |b| {
        b.iter_batched(
            || {
                let mut queue = TaskQueue::new();
                for _ in 0..1024 {
                    queue.enqueue(FnTask::new("noop", noop as fn(usize)));
                }
                queue
            },
            |queue| {
                while let Some(task) = queue.grab() {
                    task.execute(0);
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_poll_fast_path,
    bench_safepoint_native_threads,
    bench_safepoint_polling_threads,
    bench_task_batches,
    bench_queue_grab,
);
criterion_main!(benches);
