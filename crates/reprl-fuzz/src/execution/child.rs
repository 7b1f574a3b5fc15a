//! Spawning and tearing down the engine child.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{SigHandler, Signal, signal};
use tracing::{debug, warn};

use super::{CtrlPipes, ReprlContext};
use crate::errors::Error;

/// Descriptor numbers the engine expects; fixed by the REPRL protocol.
pub(crate) mod child_fd {
    /// Child reads control commands here.
    pub const CTRL_IN: i32 = 100;
    /// Child writes HELO and status words here.
    pub const CTRL_OUT: i32 = 101;
    /// Child reads script bytes here.
    pub const DATA_IN: i32 = 102;
    /// Child writes fuzz output here.
    pub const DATA_OUT: i32 = 103;
}

const HANDSHAKE: &[u8; 4] = b"HELO";
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(5);

impl ReprlContext {
    pub(crate) fn spawn_child(&mut self) -> Result<(), Error> {
        // A previous child may have written past the mapping; cap the
        // backing files again before handing them out.
        self.truncate_channels()?;

        // Control pipes: child→parent for HELO and status words,
        // parent→child for commands. The parent ends stay close-on-exec
        // (os_pipe default); the child side is installed by dup2 below.
        let (ctrl_rx, child_ctrl_tx) = os_pipe::pipe()?;
        let (child_ctrl_rx, ctrl_tx) = os_pipe::pipe()?;

        let mut command = Command::new(&self.argv[0]);
        command.args(&self.argv[1..]);
        command.envs(self.env.iter().map(|(key, value)| (key, value)));
        command.stdin(Stdio::null());
        command.stdout(match &self.stdout {
            Some(channel) => Stdio::from(channel.duplicate_handle()?),
            None => Stdio::null(),
        });
        command.stderr(match &self.stderr {
            Some(channel) => Stdio::from(channel.duplicate_handle()?),
            None => Stdio::null(),
        });

        let sources = [
            (child_ctrl_rx.as_raw_fd(), child_fd::CTRL_IN),
            (child_ctrl_tx.as_raw_fd(), child_fd::CTRL_OUT),
            (self.script_in.raw_fd(), child_fd::DATA_IN),
            (self.fuzz_out.raw_fd(), child_fd::DATA_OUT),
        ];
        let bind_reprl_fds = move || {
            use nix::unistd::{close, dup2};
            for (source, target) in sources {
                dup2(source, target).map_err(io::Error::from)?;
            }
            // dup2 cleared close-on-exec on the targets, so they survive
            // execve. The memfd sources are close-on-exec; the pipe ends we
            // close eagerly.
            close(sources[0].0).map_err(io::Error::from)?;
            close(sources[1].0).map_err(io::Error::from)?;
            Ok(())
        };
        // SAFETY: runs post-fork in the child; only dup2/close, no
        // allocation.
        unsafe { command.pre_exec(bind_reprl_fds) };

        let child = command
            .spawn()
            .map_err(|err| Error::ChildSpawnFailed(format!("spawning {:?}: {err}", self.argv[0])))?;
        drop(child_ctrl_rx);
        drop(child_ctrl_tx);

        let pid = child.id();
        self.child = Some(child);
        let mut ctrl = CtrlPipes {
            rx: ctrl_rx,
            tx: ctrl_tx,
        };
        if let Err(err) = handshake(&mut ctrl) {
            self.terminate_child();
            return Err(err);
        }
        self.ctrl = Some(ctrl);
        debug!(pid, "engine child ready");
        Ok(())
    }

    /// Spawns the engine, retrying once after a pause: a transient failure
    /// (fd pressure, OOM kill during startup) deserves a second chance
    /// before the run is declared dead.
    pub(crate) fn spawn_child_with_retry(&mut self) -> Result<(), Error> {
        let first = match self.spawn_child() {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        warn!(%first, "engine spawn failed, retrying once in 5s");
        thread::sleep(SPAWN_RETRY_DELAY);
        self.spawn_child()
    }

    /// SIGKILL plus a blocking reap. The data channels stay alive for the
    /// next child; the control pipes die with this one.
    pub fn terminate_child(&mut self) {
        self.ctrl = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                warn!(%err, "failed to deliver SIGKILL to engine");
            }
            match child.wait() {
                Ok(status) => debug!(%status, "engine child reaped"),
                Err(err) => warn!(%err, "waitpid on engine child failed"),
            }
        }
    }
}

fn handshake(ctrl: &mut CtrlPipes) -> Result<(), Error> {
    let mut greeting = [0u8; 4];
    ctrl.rx
        .read_exact(&mut greeting)
        .map_err(|err| Error::ChildSpawnFailed(format!("engine never sent HELO: {err}")))?;
    if &greeting != HANDSHAKE {
        return Err(Error::ChildSpawnFailed(format!(
            "unexpected handshake {greeting:?}"
        )));
    }
    ctrl.tx
        .write_all(HANDSHAKE)
        .map_err(|err| Error::ChildSpawnFailed(format!("echoing HELO: {err}")))?;
    Ok(())
}

/// Parks /dev/null on the well-known descriptor numbers so nothing else in
/// the process can claim them before the first child is spawned.
pub(crate) fn reserve_child_fds() -> Result<(), Error> {
    let devnull = File::open("/dev/null")?;
    for fd in [
        child_fd::CTRL_IN,
        child_fd::CTRL_OUT,
        child_fd::DATA_IN,
        child_fd::DATA_OUT,
    ] {
        nix::unistd::dup2(devnull.as_raw_fd(), fd)
            .map_err(|err| Error::ReprlFailure(format!("reserving fd {fd}: {err}")))?;
    }
    Ok(())
}

/// A write into a dead child's pipe must surface as EPIPE, not kill the
/// process.
pub(crate) fn ignore_sigpipe() -> Result<(), Error> {
    // SAFETY: SigIgn installs no handler code.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .map_err(|err| Error::ReprlFailure(format!("ignoring SIGPIPE: {err}")))?;
    Ok(())
}
