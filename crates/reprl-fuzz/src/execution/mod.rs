//! The REPRL execution engine: one long-lived engine child, many scripts.
//!
//! Spawning a JavaScript engine per script would dominate the fuzzing loop,
//! so the engine is patched to run a read-eval-print-reset loop: the
//! supervisor writes a script into a shared data channel, signals `exec` on
//! a control pipe, and the child replies with a 4-byte status word when the
//! script finishes. Crashes and timeouts are detected here and folded into
//! the same status encoding.

mod child;
pub mod status;
mod test;

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::process::Child;
use std::time::{Duration, Instant};

use nix::sys::select::{FdSet, pselect};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::time::TimeSpec;
use os_pipe::{PipeReader, PipeWriter};

use crate::channel::{DataChannel, REPRL_MAX_DATA_SIZE};
use crate::coverage::CoverageEngine;
use crate::errors::Error;
use status::ExecutionStatus;

/// How long to keep retrying a WNOHANG reap after the status pipe closed
/// without a word. A crashed child becomes waitable almost immediately;
/// anything longer than this means it is still alive and misbehaving.
const REAP_RETRY_BUDGET: Duration = Duration::from_millis(1);
const REAP_RETRY_INTERVAL: Duration = Duration::from_micros(10);

#[derive(Debug)]
struct CtrlPipes {
    rx: PipeReader,
    tx: PipeWriter,
}

/// One REPRL context: a target description, the shared data channels, and
/// at most one live engine child.
///
/// Single-threaded-cooperative: the owner issues one execution at a time and
/// blocks until its status arrives. Contexts must not be shared across
/// threads without external serialization.
#[derive(Debug)]
pub struct ReprlContext {
    argv: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    /// Script bytes, parent → child (the child's `DATA_IN`).
    script_in: DataChannel,
    /// Fuzz output, child → parent (the child's `DATA_OUT`).
    fuzz_out: DataChannel,
    stdout: Option<DataChannel>,
    stderr: Option<DataChannel>,
    /// Valid exactly while a child is alive.
    ctrl: Option<CtrlPipes>,
    child: Option<Child>,
}

/// Outcome of one execute round-trip.
#[derive(Debug, Clone, Copy)]
pub struct Execution {
    pub status: ExecutionStatus,
    pub execution_time: Duration,
    /// Whether this call had to spawn a (new) engine child.
    pub child_respawned: bool,
}

impl ReprlContext {
    /// Builds a context for the given child command line. Reserves the
    /// well-known child descriptors and sets the process-wide SIGPIPE
    /// disposition, so concurrent context creation must be serialized
    /// externally.
    pub fn new(
        argv: Vec<OsString>,
        env: Vec<(OsString, OsString)>,
        capture_stdout: bool,
        capture_stderr: bool,
    ) -> Result<Self, Error> {
        if argv.is_empty() {
            return Err(Error::ChildSpawnFailed("empty argv".into()));
        }
        child::reserve_child_fds()?;
        child::ignore_sigpipe()?;
        Ok(Self {
            argv,
            env,
            script_in: DataChannel::create("data_in")?,
            fuzz_out: DataChannel::create("data_out")?,
            stdout: capture_stdout
                .then(|| DataChannel::create("stdout"))
                .transpose()?,
            stderr: capture_stderr
                .then(|| DataChannel::create("stderr"))
                .transpose()?,
            ctrl: None,
            child: None,
        })
    }

    pub fn child_alive(&self) -> bool {
        self.child.is_some()
    }

    /// Executes `script` in the engine, spawning a child first if none is
    /// alive (or if `fresh_instance` demands one), and decodes the status.
    ///
    /// Timeouts and crashes are statuses, not errors. The coverage bitmap
    /// is cleared right before the `exec` command goes out — the child
    /// clears its own map too, but an instrumentation that forgot to must
    /// not poison the evaluation.
    pub fn execute(
        &mut self,
        coverage: &mut CoverageEngine,
        script: &[u8],
        timeout: Duration,
        fresh_instance: bool,
    ) -> Result<Execution, Error> {
        if script.len() > REPRL_MAX_DATA_SIZE {
            return Err(Error::ScriptTooLarge(script.len()));
        }
        if fresh_instance && self.child.is_some() {
            self.terminate_child();
        }
        self.rewind_channels()?;
        let child_respawned = self.child.is_none();
        if child_respawned {
            self.spawn_child_with_retry()?;
        }
        self.script_in.write(script)?;
        coverage.clear_bitmap();

        // The script length travels on the control pipe; the data channel
        // carries only the raw bytes.
        let mut command = [0u8; 12];
        command[..4].copy_from_slice(b"exec");
        command[4..].copy_from_slice(&(script.len() as u64).to_ne_bytes());

        let start = Instant::now();
        if let Err(err) = self.ctrl_write(&command) {
            return Err(self.died_between_runs(err));
        }

        let readable = match self.wait_ctrl_readable(timeout) {
            Ok(readable) => readable,
            Err(err) => {
                self.terminate_child();
                return Err(err);
            }
        };
        let execution_time = start.elapsed();

        if !readable {
            self.terminate_child();
            return Ok(Execution {
                status: ExecutionStatus::TIMED_OUT,
                execution_time,
                child_respawned,
            });
        }

        let mut word = [0u8; 4];
        let status = match self.ctrl_read(&mut word) {
            Ok(()) => ExecutionStatus::from_raw(u32::from_ne_bytes(word) & 0xffff),
            // The pipe closed without a status: the engine crashed before
            // writing one.
            Err(_) => self.reap_crashed_child()?,
        };
        Ok(Execution {
            status,
            execution_time,
            child_respawned,
        })
    }

    /// Bytes the engine wrote to the fuzz-out channel during the last run.
    pub fn fetch_fuzz_out(&mut self) -> Result<&[u8], Error> {
        Ok(self.fuzz_out.read_back()?)
    }

    /// Captured stdout of the last run; empty when not capturing.
    pub fn fetch_stdout(&mut self) -> Result<&[u8], Error> {
        match self.stdout.as_mut() {
            Some(channel) => Ok(channel.read_back()?),
            None => Ok(&[]),
        }
    }

    /// Captured stderr of the last run; empty when not capturing.
    pub fn fetch_stderr(&mut self) -> Result<&[u8], Error> {
        match self.stderr.as_mut() {
            Some(channel) => Ok(channel.read_back()?),
            None => Ok(&[]),
        }
    }

    fn rewind_channels(&mut self) -> Result<(), Error> {
        self.script_in.rewind()?;
        self.fuzz_out.rewind()?;
        if let Some(channel) = self.stdout.as_mut() {
            channel.rewind()?;
        }
        if let Some(channel) = self.stderr.as_mut() {
            channel.rewind()?;
        }
        Ok(())
    }

    pub(crate) fn truncate_channels(&mut self) -> Result<(), Error> {
        self.script_in.truncate()?;
        self.fuzz_out.truncate()?;
        if let Some(channel) = self.stdout.as_mut() {
            channel.truncate()?;
        }
        if let Some(channel) = self.stderr.as_mut() {
            channel.truncate()?;
        }
        Ok(())
    }

    fn ctrl_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.ctrl.as_mut() {
            Some(ctrl) => ctrl.tx.write_all(bytes),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no control pipe",
            )),
        }
    }

    fn ctrl_read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.ctrl.as_mut() {
            Some(ctrl) => ctrl.rx.read_exact(buf),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no control pipe",
            )),
        }
    }

    /// Waits for the status side of the control pipe to become readable,
    /// bounded by `timeout`. Interruptible by SIGINT so the driver can shut
    /// down while an execution is pending.
    fn wait_ctrl_readable(&self, timeout: Duration) -> Result<bool, Error> {
        let Some(ctrl) = self.ctrl.as_ref() else {
            return Err(Error::ReprlFailure("no control pipe".into()));
        };
        // SAFETY: the descriptor stays open for the duration of the call.
        let status_fd = unsafe { BorrowedFd::borrow_raw(ctrl.rx.as_raw_fd()) };
        let mut readfds = FdSet::new();
        readfds.insert(&status_fd);
        let mut sigset = SigSet::empty();
        sigset.add(Signal::SIGINT);
        let timeout = TimeSpec::from_duration(timeout);
        let ready = pselect(None, &mut readfds, None, None, Some(&timeout), Some(&sigset))
            .map_err(|err| Error::ReprlFailure(format!("waiting for engine status: {err}")))?;
        Ok(ready > 0)
    }

    /// A failed `exec` write means the previous child is gone. Reap it and
    /// synthesize the detail the driver will see.
    fn died_between_runs(&mut self, err: io::Error) -> Error {
        use std::os::unix::process::ExitStatusExt;
        let exit = self
            .child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten());
        match exit {
            Some(status) => {
                self.child = None;
                self.ctrl = None;
                match status.signal() {
                    Some(signal) => Error::ChildDiedBetweenRuns(format!(
                        "killed by signal {signal} between executions"
                    )),
                    None => Error::ChildDiedBetweenRuns(format!(
                        "exited with code {} between executions",
                        status.code().unwrap_or(0)
                    )),
                }
            }
            None => {
                self.terminate_child();
                Error::ReprlFailure(format!("writing exec command: {err}"))
            }
        }
    }

    /// The status pipe closed without a word. Give the kernel a moment to
    /// make the child waitable, then encode what killed it.
    fn reap_crashed_child(&mut self) -> Result<ExecutionStatus, Error> {
        use std::os::unix::process::ExitStatusExt;
        let exit = {
            let Some(child) = self.child.as_mut() else {
                return Err(Error::ReprlFailure("status pipe closed with no child".into()));
            };
            let started = Instant::now();
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => break Ok(Some(status)),
                    Ok(None) if started.elapsed() < REAP_RETRY_BUDGET => {
                        std::thread::sleep(REAP_RETRY_INTERVAL);
                    }
                    Ok(None) => break Ok(None),
                    Err(err) => break Err(err),
                }
            }
        };
        match exit {
            Ok(Some(status)) => {
                self.child = None;
                self.ctrl = None;
                Ok(match status.signal() {
                    Some(signal) => ExecutionStatus::from_signal(signal),
                    None => ExecutionStatus::from_exit_code(status.code().unwrap_or(0)),
                })
            }
            Ok(None) => {
                self.terminate_child();
                Err(Error::ReprlFailure(
                    "engine closed its status pipe while still running".into(),
                ))
            }
            Err(err) => {
                self.terminate_child();
                Err(Error::ReprlFailure(format!("reaping crashed engine: {err}")))
            }
        }
    }
}

impl Drop for ReprlContext {
    fn drop(&mut self) {
        self.terminate_child();
    }
}
