//! Bulk-data channels shared with the engine child.
//!
//! Each channel is an anonymous in-memory file of fixed size. The parent
//! accesses it through a writable mapping; the child gets a duplicate of the
//! descriptor at a well-known number and uses ordinary stream I/O. Both sides
//! share one open-file description, so rewinding the parent's handle also
//! resets the child's position, and the child's position after a run tells
//! the parent how many bytes were produced.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Seek};
use std::os::fd::{AsRawFd, RawFd};

use memmap2::{MmapMut, MmapOptions};
use nix::sys::memfd::{MemFdCreateFlag, memfd_create};

use crate::errors::Error;

/// Maximum number of bytes transferred through one channel per execution.
/// This also caps the size of scripts handed to the engine; a larger script
/// would outrun any reasonable timeout anyway.
pub const REPRL_MAX_DATA_SIZE: usize = 16 << 20;

#[derive(Debug)]
pub struct DataChannel {
    file: File,
    mapping: MmapMut,
}

impl DataChannel {
    /// Creates a channel backed by a close-on-exec memfd of exactly
    /// [`REPRL_MAX_DATA_SIZE`] bytes.
    pub fn create(tag: &str) -> Result<Self, Error> {
        let name = CString::new(format!("reprl_{tag}"))
            .map_err(|_| Error::ResourceExhausted(format!("channel tag {tag:?} contains NUL")))?;
        let fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|err| Error::ResourceExhausted(format!("memfd_create({tag}): {err}")))?;
        let file = File::from(fd);
        file.set_len(REPRL_MAX_DATA_SIZE as u64)
            .map_err(|err| Error::ResourceExhausted(format!("sizing channel {tag}: {err}")))?;
        // SAFETY: the child writes the same file, but only between the
        // control-pipe handoffs that serialize access to the channel.
        let mapping = unsafe { MmapOptions::new().len(REPRL_MAX_DATA_SIZE).map_mut(&file) }
            .map_err(|err| Error::ResourceExhausted(format!("mapping channel {tag}: {err}")))?;
        Ok(Self { file, mapping })
    }

    /// The descriptor the supervisor installs into the child.
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// A duplicate handle sharing the same open-file description, for wiring
    /// the channel up as the child's stdout or stderr.
    pub(crate) fn duplicate_handle(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Seeks the shared open-file description back to offset zero. The
    /// child's descriptor is a duplicate, so its position resets as well.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.rewind()
    }

    /// Re-truncates the backing file to its fixed capacity. Done at every
    /// spawn so a child that wrote past the mapping cannot grow the file
    /// without bound.
    pub fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(REPRL_MAX_DATA_SIZE as u64)
    }

    /// Copies `bytes` into the channel at offset zero.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() > REPRL_MAX_DATA_SIZE {
            return Err(Error::ScriptTooLarge(bytes.len()));
        }
        self.mapping[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Returns the bytes the child wrote during the last run.
    ///
    /// The child's stream position is the byte count, capped at capacity − 1.
    /// A NUL is written into the mapping at that offset first, so the region
    /// can also be handed to C-string consumers.
    pub fn read_back(&mut self) -> io::Result<&[u8]> {
        let written = self.file.stream_position()? as usize;
        let end = written.min(REPRL_MAX_DATA_SIZE - 1);
        self.mapping[end] = 0;
        Ok(&self.mapping[..end])
    }
}
