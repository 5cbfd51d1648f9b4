//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use vmsync::config::VmConfig;
use vmsync::fatal::FatalAction;
use vmsync::policy::CollectorPolicy;
use vmsync::vm::Vm;

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config(policy: CollectorPolicy) -> VmConfig {
    VmConfig::default()
        .with_policy(policy)
        .with_carrier_threads(0)
        .with_fatal_action(FatalAction::Panic)
}

pub fn vm(policy: CollectorPolicy) -> Arc<Vm> {
    init_tracing();
    Vm::new(config(policy)).expect("vm should start")
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
