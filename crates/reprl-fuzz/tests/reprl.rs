//! Process-level scenarios: the real supervisor driving the stub engine.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use reprl_fuzz::host::{EngineHost, HostOptions};

const TIMEOUT: Duration = Duration::from_millis(1000);

// Hosts share the process-wide descriptor reservation, so the scenarios run
// one at a time.
static HOST_GATE: Mutex<()> = Mutex::new(());

fn stub_host(shm_id: u32) -> (MutexGuard<'static, ()>, EngineHost) {
    let gate = HOST_GATE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let options = HostOptions {
        args: Vec::new(),
        ..HostOptions::default()
    };
    let host = EngineHost::initialize(
        Path::new(env!("CARGO_BIN_EXE_reprl_stub")),
        shm_id,
        options,
    )
    .expect("initializing host");
    (gate, host)
}

#[test]
fn echo_sanity() {
    let (_gate, mut host) = stub_host(31);
    let result = host.execute_script(b"1;", TIMEOUT).expect("executing");
    assert!(result.status.exited());
    assert_eq!(result.status.exit_code(), 0);
    assert_eq!(result.fuzz_out, "ok\n");
    assert!(result.execution_time > Duration::ZERO);
    assert!(result.engine_was_restarted);

    // The second run reuses the same engine instance.
    let result = host.execute_script(b"2;", TIMEOUT).expect("executing");
    assert!(!result.engine_was_restarted);
    assert_eq!(result.fuzz_out, "ok\n");
    host.shutdown().expect("shutdown");
}

#[test]
fn timeout_kills_the_engine_and_the_next_run_respawns() {
    let (_gate, mut host) = stub_host(32);
    let timeout = Duration::from_millis(100);
    let result = host
        .execute_script(b"sleep; while(1){}", timeout)
        .expect("executing");
    assert!(result.status.timed_out());
    assert_eq!(result.status.raw(), 0x10000);
    assert!(result.execution_time >= timeout);

    let result = host.execute_script(b"1;", TIMEOUT).expect("executing");
    assert!(result.engine_was_restarted);
    assert!(result.status.exited());
    host.shutdown().expect("shutdown");
}

#[test]
fn crash_reports_the_signal_and_sanitized_stderr() {
    let (_gate, mut host) = stub_host(33);
    let result = host.execute_script(b"crash();", TIMEOUT).expect("executing");
    assert!(result.status.signaled());
    assert_eq!(result.status.signal(), libc::SIGSEGV as u32);
    assert!(result.stderr.contains("Fatal error: segmentation fault"));
    // Output sanitization: nothing ≥ 0x80 survives.
    assert!(result.stderr.bytes().all(|byte| byte < 0x80));

    // The crashed engine is replaced on the next run.
    let result = host.execute_script(b"1;", TIMEOUT).expect("executing");
    assert!(result.engine_was_restarted);
    assert!(result.status.exited());
    host.shutdown().expect("shutdown");
}

#[test]
fn fresh_instance_replaces_a_live_engine() {
    let (_gate, mut host) = stub_host(37);
    let first = host.execute_script(b"pid", TIMEOUT).expect("first run");
    assert!(first.engine_was_restarted);
    assert!(!first.fuzz_out.is_empty());

    // A fresh execution tears the live engine down and brings up a new one.
    let fresh = host
        .execute_script_fresh(b"pid", TIMEOUT)
        .expect("fresh run");
    assert!(fresh.engine_was_restarted);
    assert_ne!(fresh.fuzz_out, first.fuzz_out);

    // The replacement instance then serves ordinary runs.
    let repeat = host.execute_script(b"pid", TIMEOUT).expect("repeat run");
    assert!(!repeat.engine_was_restarted);
    assert_eq!(repeat.fuzz_out, fresh.fuzz_out);
    host.shutdown().expect("shutdown");
}

#[test]
fn coverage_over_a_live_engine() {
    let (_gate, mut host) = stub_host(34);
    host.execute_script(b"1;", TIMEOUT).expect("first run");
    assert_eq!(host.finish_initialization().expect("edge count"), 16);

    host.execute_script(b"cov 5", TIMEOUT).expect("cov run");
    let delta = host.evaluate_coverage();
    assert_eq!((delta.new_edges, delta.total_edges), (1, 1));

    // A run hitting nothing new reports nothing.
    host.execute_script(b"1;", TIMEOUT).expect("idle run");
    let delta = host.evaluate_coverage();
    assert_eq!((delta.new_edges, delta.total_edges), (0, 0));
    host.shutdown().expect("shutdown");
}

#[test]
fn two_phase_query_confirms_reproducible_coverage() {
    let (_gate, mut host) = stub_host(35);
    host.execute_script(b"1;", TIMEOUT).expect("first run");
    host.finish_initialization().expect("edge count");

    host.execute_script(b"cov 3 7", TIMEOUT).expect("query run");
    assert_eq!(host.evaluate_coverage_step1_check(), 2);
    // The rerun reproduces one of the edges, which is enough to accept the
    // first run's coverage wholesale.
    host.execute_script(b"cov 7", TIMEOUT).expect("rerun");
    let delta = host.evaluate_coverage_step2_confirm();
    assert_eq!((delta.new_edges, delta.total_edges), (2, 2));
    host.shutdown().expect("shutdown");
}

#[test]
fn two_phase_query_absorbs_flaky_coverage() {
    let (_gate, mut host) = stub_host(36);
    host.execute_script(b"1;", TIMEOUT).expect("first run");
    host.finish_initialization().expect("edge count");

    host.execute_script(b"cov 9", TIMEOUT).expect("query run");
    assert_eq!(host.evaluate_coverage_step1_check(), 1);
    // The rerun reproduces nothing: the candidate is rejected...
    host.execute_script(b"1;", TIMEOUT).expect("rerun");
    let delta = host.evaluate_coverage_step2_confirm();
    assert_eq!((delta.new_edges, delta.total_edges), (0, 0));
    // ...but still absorbed, so the flaky edge is never reported again.
    host.execute_script(b"cov 9", TIMEOUT).expect("repeat");
    assert_eq!(host.evaluate_coverage_step1_check(), 0);
    host.shutdown().expect("shutdown");
}
