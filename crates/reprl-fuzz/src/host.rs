//! The driver-facing façade over execution and coverage.
//!
//! The driver (out of tree; typically a script-generation process) holds one
//! [`EngineHost`] per fuzzed target and talks only to this surface.

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::coverage::{CoverageDelta, CoverageEngine, CoverageShmem};
use crate::errors::Error;
use crate::execution::ReprlContext;
use crate::execution::status::ExecutionStatus;
use crate::fuzz_target::TargetBinaryInfo;
use crate::scanner;

/// Engine flags selecting a deterministic, fuzz-friendly configuration.
/// Callers fuzzing a different target supply their own via [`HostOptions`].
pub const DEFAULT_ENGINE_FLAGS: [&str; 6] = [
    "--expose-gc",
    "--omit-quit",
    "--allow-natives-syntax",
    "--fuzzing",
    "--future",
    "--single-threaded",
];

/// Configuration for [`EngineHost::initialize`].
#[derive(Debug)]
pub struct HostOptions {
    /// Arguments placed after the target path. Defaults to
    /// [`DEFAULT_ENGINE_FLAGS`].
    pub args: Vec<OsString>,
    /// Extra child environment on top of the inherited one. `SHM_ID` is
    /// always appended.
    pub env: Vec<(OsString, OsString)>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            args: DEFAULT_ENGINE_FLAGS.iter().map(OsString::from).collect(),
            env: Vec::new(),
            capture_stdout: false,
            capture_stderr: true,
        }
    }
}

/// What one script execution produced, ready for the driver.
#[derive(Debug)]
pub struct ScriptResult {
    pub status: ExecutionStatus,
    pub execution_time: Duration,
    /// Engine-to-fuzzer side channel, sanitized to ASCII.
    pub fuzz_out: String,
    /// Captured stderr, empty when not capturing; sanitized to ASCII.
    pub stderr: String,
    /// Whether this call had to (re)spawn the engine.
    pub engine_was_restarted: bool,
}

/// Explicit handle over one fuzzed engine: a REPRL context plus its
/// coverage accounting.
#[derive(Debug)]
pub struct EngineHost {
    reprl: ReprlContext,
    coverage: CoverageEngine,
}

impl EngineHost {
    /// Sets up the data channels, the coverage region and the child
    /// description; no child is spawned yet.
    ///
    /// Also initializes the process locale from the environment — the
    /// delimiter scanner depends on it for multi-byte lengths — reserves
    /// the well-known child descriptors and flips SIGPIPE to ignored,
    /// process-wide. Hosts must not be created concurrently from several
    /// threads.
    pub fn initialize(target: &Path, shm_id: u32, options: HostOptions) -> Result<Self, Error> {
        scanner::init_locale();
        let mut argv: Vec<OsString> = Vec::with_capacity(options.args.len() + 1);
        argv.push(target.into());
        argv.extend(options.args);
        let mut env = options.env;
        env.push(("SHM_ID".into(), CoverageShmem::region_name(shm_id).into()));
        // The context goes first: it parks /dev/null on the well-known child
        // descriptors, and no other descriptor may be allocated before that
        // reservation is in place.
        let reprl = ReprlContext::new(argv, env, options.capture_stdout, options.capture_stderr)?;
        match TargetBinaryInfo::scan(target) {
            Ok(info) if !info.reads_coverage_shmem => {
                warn!(path = %target.display(), "target never references SHM_ID; is it instrumented?");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "could not inspect the target binary"),
        }
        let coverage = CoverageEngine::initialize(shm_id)?;
        Ok(Self { reprl, coverage })
    }

    /// Brings the engine up now instead of lazily on the first execution.
    pub fn spawn_child(&mut self) -> Result<(), Error> {
        self.reprl.spawn_child_with_retry()
    }

    /// Kills the current engine child, if any. The next execution respawns.
    pub fn kill_child(&mut self) {
        self.reprl.terminate_child();
    }

    /// Runs one script in the engine. Timeouts and crashes come back as
    /// statuses, not errors.
    pub fn execute_script(
        &mut self,
        script: &[u8],
        timeout: Duration,
    ) -> Result<ScriptResult, Error> {
        self.execute_script_inner(script, timeout, false)
    }

    /// Like [`EngineHost::execute_script`], but tears down any live engine
    /// first so the script runs in a pristine instance.
    pub fn execute_script_fresh(
        &mut self,
        script: &[u8],
        timeout: Duration,
    ) -> Result<ScriptResult, Error> {
        self.execute_script_inner(script, timeout, true)
    }

    fn execute_script_inner(
        &mut self,
        script: &[u8],
        timeout: Duration,
        fresh: bool,
    ) -> Result<ScriptResult, Error> {
        let execution = self
            .reprl
            .execute(&mut self.coverage, script, timeout, fresh)?;
        let fuzz_out = sanitize_output(self.reprl.fetch_fuzz_out()?);
        let stderr = sanitize_output(self.reprl.fetch_stderr()?);
        Ok(ScriptResult {
            status: execution.status,
            execution_time: execution.execution_time,
            fuzz_out,
            stderr,
            engine_was_restarted: execution.child_respawned,
        })
    }

    /// Captured stdout of the last run, sanitized; empty when the host was
    /// created without stdout capture.
    pub fn fetch_stdout(&mut self) -> Result<String, Error> {
        Ok(sanitize_output(self.reprl.fetch_stdout()?))
    }

    /// Sizes the coverage bitmaps from the edge count the instrumentation
    /// published during the first execution. Call once, after that
    /// execution.
    pub fn finish_initialization(&mut self) -> Result<u32, Error> {
        self.coverage.finish_initialization()
    }

    /// One-shot query: count and absorb the new edges of the last run.
    pub fn evaluate_coverage(&mut self) -> CoverageDelta {
        self.coverage.evaluate()
    }

    /// First half of the anti-flake query; see
    /// [`CoverageEngine::evaluate_step1_check`].
    pub fn evaluate_coverage_step1_check(&mut self) -> u32 {
        self.coverage.evaluate_step1_check()
    }

    /// Second half of the anti-flake query; see
    /// [`CoverageEngine::evaluate_step2_confirm`].
    pub fn evaluate_coverage_step2_confirm(&mut self) -> CoverageDelta {
        self.coverage.evaluate_step2_confirm()
    }

    pub fn save_coverage_map(&self, path: &Path) -> Result<(), Error> {
        self.coverage.save_virgin(path)
    }

    pub fn load_coverage_map(&mut self, path: &Path) -> Result<u32, Error> {
        self.coverage.load_virgin(path)
    }

    pub fn backup_coverage_map(&mut self) {
        self.coverage.backup_virgin()
    }

    pub fn restore_coverage_map(&mut self) {
        self.coverage.restore_virgin()
    }

    /// Logical index of the next `symbol` outside strings, comments and
    /// nested bracket groups; see
    /// [`scanner::next_symbol_outside_strings`].
    pub fn next_symbol_outside_strings(
        &self,
        content: &[u8],
        symbol: u8,
    ) -> Result<Option<usize>, Error> {
        scanner::next_symbol_outside_strings(content, symbol)
    }

    /// 1-based line number of a logical offset; see
    /// [`scanner::line_number_of_offset`].
    pub fn line_number_of_offset(&self, content: &[u8], offset: usize) -> Option<usize> {
        scanner::line_number_of_offset(content, offset)
    }

    /// Tears down the child and unlinks the coverage region. A host with
    /// the same id can be created again afterwards.
    pub fn shutdown(mut self) -> Result<(), Error> {
        self.reprl.terminate_child();
        self.coverage.shutdown()
    }
}

/// Replaces every byte ≥ 0x80 with a space. Fuzzer-generated scripts emit
/// invalid UTF-8 at will and the driver must never trip over it.
fn sanitize_output(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&byte| if byte < 0x80 { byte as char } else { ' ' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizer_replaces_high_bytes_with_spaces() {
        assert_eq!(sanitize_output(b"ok\n"), "ok\n");
        assert_eq!(sanitize_output(b"a\xffb\x80c"), "a b c");
        assert_eq!(sanitize_output("caf\u{e9}".as_bytes()), "caf  ");
        assert!(sanitize_output(&[0u8, 0x7f, 0x80, 0xff]).bytes().all(|b| b < 0x80));
    }

    #[test]
    fn default_options_capture_stderr_only() {
        let options = HostOptions::default();
        assert!(!options.capture_stdout);
        assert!(options.capture_stderr);
        assert_eq!(options.args.len(), DEFAULT_ENGINE_FLAGS.len());
    }
}
