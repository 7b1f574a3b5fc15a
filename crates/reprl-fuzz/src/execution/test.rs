#![cfg(test)]

use std::time::Duration;

use super::ReprlContext;
use crate::channel::REPRL_MAX_DATA_SIZE;
use crate::coverage::CoverageEngine;
use crate::errors::Error;

#[test]
fn oversized_scripts_are_rejected_before_anything_runs() {
    let mut coverage = CoverageEngine::initialize(9100).expect("coverage init");
    let mut context = ReprlContext::new(
        vec!["/nonexistent/engine".into()],
        Vec::new(),
        false,
        false,
    )
    .expect("context");
    let script = vec![b' '; REPRL_MAX_DATA_SIZE + 1];
    let result = context.execute(&mut coverage, &script, Duration::from_millis(100), false);
    assert!(matches!(result, Err(Error::ScriptTooLarge(_))));
    // Nothing was spawned on the way to the rejection.
    assert!(!context.child_alive());
    coverage.shutdown().expect("shm unlink");
}

#[test]
fn empty_argv_is_rejected() {
    assert!(matches!(
        ReprlContext::new(Vec::new(), Vec::new(), false, false),
        Err(Error::ChildSpawnFailed(_))
    ));
}
