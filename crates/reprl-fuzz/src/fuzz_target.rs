//! Static preflight inspection of the engine binary.

use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;

/// Instrumented REPRL builds reference the shm environment variable by name.
const SHM_ENV_SIGNATURE: &[u8] = b"SHM_ID";
/// And they carry the handshake token they emit on startup.
const HANDSHAKE_SIGNATURE: &[u8] = b"HELO";

/// What a byte-level scan of the target binary reveals. Best effort: a hit
/// is strong evidence, a miss only a warning sign.
#[derive(Debug)]
pub struct TargetBinaryInfo {
    /// The binary references the coverage shm environment variable.
    pub reads_coverage_shmem: bool,
    /// The binary carries the REPRL handshake token.
    pub speaks_reprl: bool,
}

impl TargetBinaryInfo {
    pub fn scan(binary: &Path) -> io::Result<Self> {
        let binary_file = File::open(binary)?;
        // SAFETY: We are assuming that the file is not touched externally
        let file_slice = unsafe { Mmap::map(&binary_file) }?;
        Ok(Self {
            reads_coverage_shmem: kmp::kmp_find(SHM_ENV_SIGNATURE, &file_slice).is_some(),
            speaks_reprl: kmp::kmp_find(HANDSHAKE_SIGNATURE, &file_slice).is_some(),
        })
    }
}
