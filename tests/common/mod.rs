//! Shared setup for integration tests

use pauseless_sync::SyncConfig;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness; `RUST_LOG` selects.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short poll intervals so tests spend little time sleeping.
#[allow(dead_code)]
pub fn fast_config(workers: usize) -> SyncConfig {
    SyncConfig {
        safepoint_poll_interval: Duration::from_micros(200),
        quiescence_poll_interval: Duration::from_millis(1),
        shutdown_poll_interval: Duration::from_millis(5),
        ..SyncConfig::default().with_worker_count(workers)
    }
}
