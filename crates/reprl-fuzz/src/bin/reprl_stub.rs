//! Minimal engine stand-in speaking the child side of the REPRL protocol.
//!
//! Exists for the integration tests: it performs the HELO handshake on the
//! well-known descriptors, then serves `exec` commands. Behavior is selected
//! by the script text — `sleep` blocks past any reasonable timeout, `crash`
//! dies from SIGSEGV after writing a diagnostic, `cov <bits…>` marks edge
//! bits in the shared coverage region, `pid` reports the process id so a
//! test can tell engine instances apart. Everything else answers `ok\n` on
//! the fuzz-out channel with a clean status.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::process::exit;
use std::thread;
use std::time::Duration;

use memmap2::MmapMut;
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;

const CTRL_IN: i32 = 100;
const CTRL_OUT: i32 = 101;
const DATA_IN: i32 = 102;
const DATA_OUT: i32 = 103;

const SHM_HEADER_SIZE: usize = 4;
/// Edge count this fake engine claims to be instrumented with.
const FAKE_NUM_EDGES: u32 = 16;

fn main() {
    // SAFETY: the supervisor installed these descriptors before exec.
    let mut ctrl_in = unsafe { File::from_raw_fd(CTRL_IN) };
    let mut ctrl_out = unsafe { File::from_raw_fd(CTRL_OUT) };
    let mut data_in = unsafe { File::from_raw_fd(DATA_IN) };
    let mut data_out = unsafe { File::from_raw_fd(DATA_OUT) };

    let mut coverage = attach_coverage();
    if let Some(region) = coverage.as_mut() {
        // A real engine publishes its edge count when the instrumentation
        // comes up.
        region[..SHM_HEADER_SIZE].copy_from_slice(&FAKE_NUM_EDGES.to_ne_bytes());
    }

    ctrl_out.write_all(b"HELO").expect("greeting the supervisor");
    let mut echo = [0u8; 4];
    ctrl_in.read_exact(&mut echo).expect("reading the HELO echo");
    if &echo != b"HELO" {
        exit(1);
    }

    loop {
        let mut command = [0u8; 12];
        if ctrl_in.read_exact(&mut command).is_err() {
            // Supervisor went away.
            break;
        }
        if &command[..4] != b"exec" {
            exit(2);
        }
        let length = u64::from_ne_bytes(command[4..].try_into().expect("8 length bytes")) as usize;
        let mut script = vec![0u8; length];
        data_in.read_exact(&mut script).expect("reading the script");
        let script = String::from_utf8_lossy(&script).into_owned();

        if script.starts_with("sleep") {
            thread::sleep(Duration::from_secs(5));
        } else if script.starts_with("crash") {
            // The multi-byte suffix is on purpose: the supervisor must
            // sanitize it out of the captured diagnostic.
            eprintln!("Fatal error: segmentation fault ☠");
            // A genuine wild write; raise(SIGSEGV) would be swallowed by the
            // runtime's stack-overflow handler.
            unsafe { std::ptr::null_mut::<u8>().write_volatile(1) };
        } else if script.starts_with("pid") {
            data_out
                .write_all(std::process::id().to_string().as_bytes())
                .expect("writing fuzz output");
        } else if let Some(bits) = script.strip_prefix("cov ") {
            if let Some(region) = coverage.as_mut() {
                for bit in bits.split_whitespace().filter_map(|b| b.parse::<usize>().ok()) {
                    region[SHM_HEADER_SIZE + bit / 8] |= 1 << (bit % 8);
                }
            }
            data_out.write_all(b"ok\n").expect("writing fuzz output");
        } else {
            data_out.write_all(b"ok\n").expect("writing fuzz output");
        }
        ctrl_out
            .write_all(&0u32.to_ne_bytes())
            .expect("writing the status word");
    }
}

fn attach_coverage() -> Option<MmapMut> {
    let name = std::env::var("SHM_ID").ok()?;
    let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty()).ok()?;
    let file = File::from(fd);
    // SAFETY: the supervisor sized the region and reads it only between
    // runs.
    unsafe { MmapMut::map_mut(&file) }.ok()
}
