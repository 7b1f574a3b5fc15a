//! The shared region the instrumented engine writes its edge bitmap into.
//!
//! Layout, fixed by the instrumentation patch:
//!
//! ```text
//! offset 0 : u32  num_edges
//! offset 4 : u8[] edges      (one bit per edge, LSB first, 1 = hit this run)
//! ```
//!
//! The region is a named POSIX shm object; the child finds it through the
//! `SHM_ID` environment variable and attaches on startup.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use static_assertions::const_assert;

use crate::errors::Error;

/// Size of the shared region. Must be big enough for the edge count of the
/// target engine build.
pub const SHM_SIZE: usize = 0x100000;

/// Bytes taken by the `num_edges` header at the start of the region.
pub const SHM_HEADER_SIZE: usize = 4;

/// Upper bound on the edge count the region can describe.
pub const MAX_EDGES: usize = (SHM_SIZE - SHM_HEADER_SIZE) * 8;

const_assert!(SHM_SIZE > SHM_HEADER_SIZE);

#[derive(Debug)]
pub struct CoverageShmem {
    name: String,
    mapping: MmapMut,
    _file: File,
}

impl CoverageShmem {
    /// The region name for a context id, exactly as exported to the child
    /// via `SHM_ID`. Discriminated by the parent pid so concurrent fuzzer
    /// processes never collide.
    pub fn region_name(id: u32) -> String {
        format!("shm_id_{}_{}", std::process::id(), id)
    }

    /// Creates (or re-opens) and maps the region. Idempotent after a prior
    /// [`CoverageShmem::unlink`] of the same id.
    pub fn open(id: u32) -> Result<Self, Error> {
        let name = Self::region_name(id);
        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|err| Error::ResourceExhausted(format!("shm_open({name}): {err}")))?;
        let file = File::from(fd);
        file.set_len(SHM_SIZE as u64)
            .map_err(|err| Error::ResourceExhausted(format!("sizing {name}: {err}")))?;
        // SAFETY: the child writes the region only while the parent is
        // blocked waiting for the execution status.
        let mapping = unsafe { MmapOptions::new().len(SHM_SIZE).map_mut(&file) }
            .map_err(|err| Error::ResourceExhausted(format!("mapping {name}: {err}")))?;
        Ok(Self {
            name,
            mapping,
            _file: file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Edge count published by the engine's instrumentation on startup.
    /// Zero until the first child has run.
    pub fn num_edges(&self) -> u32 {
        let mut header = [0u8; SHM_HEADER_SIZE];
        header.copy_from_slice(&self.mapping[..SHM_HEADER_SIZE]);
        u32::from_ne_bytes(header)
    }

    pub(crate) fn edges(&self, bitmap_size: usize) -> &[u8] {
        &self.mapping[SHM_HEADER_SIZE..SHM_HEADER_SIZE + bitmap_size]
    }

    pub(crate) fn edges_mut(&mut self, bitmap_size: usize) -> &mut [u8] {
        &mut self.mapping[SHM_HEADER_SIZE..SHM_HEADER_SIZE + bitmap_size]
    }

    /// Zeroes the live edge map.
    pub(crate) fn clear(&mut self, bitmap_size: usize) {
        self.edges_mut(bitmap_size).fill(0);
    }

    /// Removes the region name. The mapping stays valid until drop.
    pub fn unlink(&self) -> Result<(), Error> {
        shm_unlink(self.name.as_str())
            .map_err(|err| Error::ReprlFailure(format!("shm_unlink({}): {err}", self.name)))
    }

    #[cfg(test)]
    pub(crate) fn set_num_edges(&mut self, num_edges: u32) {
        self.mapping[..SHM_HEADER_SIZE].copy_from_slice(&num_edges.to_ne_bytes());
    }
}
