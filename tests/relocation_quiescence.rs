mod common;

use common::{fast_config, init_tracing};
use pauseless_sync::{CollectorThread, Rendezvous, SyncError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

struct Relocators {
    stop: Arc<AtomicBool>,
    work: Arc<Vec<AtomicU64>>,
    handles: Vec<thread::JoinHandle<Result<(), SyncError>>>,
}

fn spawn_relocators(rendezvous: &Arc<Rendezvous>, count: usize) -> Relocators {
    let collector = CollectorThread::standalone("relocation-init");
    rendezvous.start_relocating_threads(count, &collector).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let work = Arc::new((0..count).map(|_| AtomicU64::new(0)).collect::<Vec<_>>());
    let handles = (0..count)
        .map(|i| {
            let rendezvous = Arc::clone(rendezvous);
            let stop = Arc::clone(&stop);
            let work = Arc::clone(&work);
            thread::spawn(move || -> Result<(), SyncError> {
                let me = CollectorThread::standalone(format!("relocator-{i}"));
                while !stop.load(Ordering::Acquire) {
                    rendezvous.check_suspend_relocating(&me)?;
                    work[i].fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                }
                rendezvous.relocating_thread_done();
                Ok(())
            })
        })
        .collect();
    Relocators {
        stop,
        work,
        handles,
    }
}

fn snapshot(work: &[AtomicU64]) -> Vec<u64> {
    work.iter().map(|count| count.load(Ordering::Relaxed)).collect()
}

#[test]
fn suspension_parks_all_relocators_until_resume() {
    init_tracing();
    let rendezvous = Arc::new(Rendezvous::new(&fast_config(1)));
    let relocators = spawn_relocators(&rendezvous, 3);
    thread::sleep(Duration::from_millis(10));

    let collector = CollectorThread::standalone("old-gc");
    rendezvous.request_suspend_relocation(&collector).unwrap();
    rendezvous.verify_no_relocating_threads();

    let frozen = snapshot(&relocators.work);
    thread::sleep(Duration::from_millis(30));
    let still = snapshot(&relocators.work);
    for (before, after) in frozen.iter().zip(&still) {
        // A relocator may finish the unit it was in when it parked.
        assert!(after - before <= 1, "relocator kept working while suspended");
    }

    rendezvous.resume_relocation();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while snapshot(&relocators.work)
        .iter()
        .zip(&still)
        .any(|(now, then)| now <= then)
    {
        assert!(std::time::Instant::now() < deadline, "relocators did not resume");
        thread::yield_now();
    }
    rendezvous.verify_relocating_threads();

    relocators.stop.store(true, Ordering::Release);
    for handle in relocators.handles {
        handle.join().unwrap().unwrap();
    }
    rendezvous.verify_no_relocating_threads();
}

#[test]
fn repeated_suspensions() {
    let rendezvous = Arc::new(Rendezvous::new(&fast_config(1)));
    let relocators = spawn_relocators(&rendezvous, 4);
    let collector = CollectorThread::standalone("old-gc");

    for _ in 0..25 {
        rendezvous.request_suspend_relocation(&collector).unwrap();
        assert_eq!(rendezvous.quiescence_gate().active(), 0);
        rendezvous.resume_relocation();
    }

    relocators.stop.store(true, Ordering::Release);
    for handle in relocators.handles {
        handle.join().unwrap().unwrap();
    }
    rendezvous.verify_no_relocating_threads();
}

#[test]
fn terminated_relocator_leaves_the_gate() {
    let rendezvous = Arc::new(Rendezvous::new(&fast_config(1)));
    let collector = CollectorThread::standalone("old-gc");
    rendezvous.start_relocating_threads(1, &collector).unwrap();

    let relocator = Arc::new(CollectorThread::standalone("relocator"));
    let handle = {
        let rendezvous = Arc::clone(&rendezvous);
        let relocator = Arc::clone(&relocator);
        thread::spawn(move || -> Result<(), SyncError> {
            loop {
                rendezvous.check_suspend_relocating(&relocator)?;
                thread::yield_now();
            }
        })
    };

    rendezvous.request_suspend_relocation(&collector).unwrap();
    relocator.request_terminate();
    let result: Result<(), SyncError> = handle.join().unwrap();
    assert!(matches!(result, Err(SyncError::ShuttingDown)));

    rendezvous.resume_relocation();
    rendezvous.verify_no_relocating_threads();
}
