//! Edge-coverage accounting over the shared bitmap.
//!
//! The engine keeps a parent-owned *virgin* bitmap: bit = 1 means the edge
//! has never been seen, bit = 0 means discovered. The live map written by
//! the child uses the opposite polarity (bit = 1 means hit this run).
//! Finding new coverage is a word-wise AND of the two; only words that
//! signal a candidate are inspected bit by bit.
//!
//! Coverage of fuzzer-generated scripts flakes: JIT tiers, GC timing and
//! background compilation make some edges appear in one run and not in an
//! identical rerun. The two-phase query ([`CoverageEngine::evaluate_step1_check`]
//! then [`CoverageEngine::evaluate_step2_confirm`] after the driver reruns
//! the same script) only reports edges the rerun could reproduce, while
//! still absorbing both runs into the virgin map so a flake is never
//! reported twice.

pub mod shmem;

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::errors::Error;

pub use shmem::{CoverageShmem, MAX_EDGES, SHM_SIZE};

/// What one coverage query found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoverageDelta {
    /// Edges never seen before this execution.
    pub new_edges: u32,
    /// Popcount of the whole live map; only computed when `new_edges > 0`.
    pub total_edges: u32,
}

#[derive(Debug)]
pub struct CoverageEngine {
    shmem: CoverageShmem,
    num_edges: u32,
    bitmap_size: usize,
    virgin_bits: Vec<u8>,
    virgin_bits_backup: Vec<u8>,
    coverage_map_backup: Vec<u8>,
}

impl CoverageEngine {
    /// Opens the shared region for the given context id. The bitmaps are not
    /// sized yet; that needs the edge count the first child publishes, see
    /// [`CoverageEngine::finish_initialization`].
    pub fn initialize(id: u32) -> Result<Self, Error> {
        let shmem = CoverageShmem::open(id)?;
        debug!(region = shmem.name(), "coverage region mapped");
        Ok(Self {
            shmem,
            num_edges: 0,
            bitmap_size: 0,
            virgin_bits: Vec::new(),
            virgin_bits_backup: Vec::new(),
            coverage_map_backup: Vec::new(),
        })
    }

    /// The region name the child must receive in `SHM_ID`.
    pub fn region_name(&self) -> &str {
        self.shmem.name()
    }

    /// Sizes the bitmaps from the edge count the instrumentation wrote
    /// during the first execution. Call exactly once, after that execution.
    /// Every edge starts out undiscovered.
    pub fn finish_initialization(&mut self) -> Result<u32, Error> {
        let num_edges = self.shmem.num_edges();
        if num_edges == 0 {
            return Err(Error::ReprlFailure(
                "engine never published its edge count".into(),
            ));
        }
        if num_edges as usize > MAX_EDGES {
            return Err(Error::ResourceExhausted(format!(
                "engine reports {num_edges} edges, the shared region fits {MAX_EDGES}"
            )));
        }
        self.num_edges = num_edges;
        self.bitmap_size = (num_edges as usize).div_ceil(8);
        self.virgin_bits = vec![0xff; self.bitmap_size];
        self.virgin_bits_backup = self.virgin_bits.clone();
        self.coverage_map_backup = vec![0; self.bitmap_size];
        info!(num_edges, "coverage instrumentation ready");
        Ok(num_edges)
    }

    pub fn num_edges(&self) -> u32 {
        self.num_edges
    }

    pub fn bitmap_size(&self) -> usize {
        self.bitmap_size
    }

    /// Zeroes the live edge map. Called before every execution; a no-op
    /// until the bitmaps are sized.
    pub fn clear_bitmap(&mut self) {
        self.shmem.clear(self.bitmap_size);
    }

    /// Destructive single-pass diff of the live map against virgin: counts
    /// the new edges and marks them discovered. `total_edges` is only
    /// computed when something new was found.
    pub fn evaluate(&mut self) -> CoverageDelta {
        let live = self.shmem.edges(self.bitmap_size);
        let new_edges = absorb(live, &mut self.virgin_bits);
        if new_edges == 0 {
            return CoverageDelta::default();
        }
        CoverageDelta {
            new_edges,
            total_edges: popcount(live),
        }
    }

    /// First half of the two-phase query: counts candidate new edges without
    /// touching virgin. When the count is positive the live map is
    /// snapshotted so [`CoverageEngine::evaluate_step2_confirm`] can compare
    /// against the rerun.
    pub fn evaluate_step1_check(&mut self) -> u32 {
        let live = self.shmem.edges(self.bitmap_size);
        let candidates = count_fresh(live, &self.virgin_bits);
        if candidates > 0 {
            self.coverage_map_backup.copy_from_slice(live);
        }
        candidates
    }

    /// Second half of the two-phase query, after the driver reran the same
    /// script. Folds first the backed-up run and then the rerun into virgin.
    /// The first run's numbers are reported only if the rerun also produced
    /// new coverage; an unreproducible first run yields `(0, 0)` but is
    /// still absorbed, so the flake is never reported again.
    pub fn evaluate_step2_confirm(&mut self) -> CoverageDelta {
        let rerun_fresh = {
            let live = self.shmem.edges(self.bitmap_size);
            count_fresh(live, &self.virgin_bits)
        };
        let first_new = absorb(&self.coverage_map_backup, &mut self.virgin_bits);
        let first_total = popcount(&self.coverage_map_backup);
        let live = self.shmem.edges(self.bitmap_size);
        absorb(live, &mut self.virgin_bits);
        if rerun_fresh > 0 {
            CoverageDelta {
                new_edges: first_new,
                total_edges: first_total,
            }
        } else {
            debug!(first_new, "coverage did not reproduce, absorbed as flake");
            CoverageDelta::default()
        }
    }

    /// Snapshots virgin so a speculative exploration can be undone.
    pub fn backup_virgin(&mut self) {
        self.virgin_bits_backup.copy_from_slice(&self.virgin_bits);
    }

    /// Rolls virgin back to the last snapshot.
    pub fn restore_virgin(&mut self) {
        self.virgin_bits.copy_from_slice(&self.virgin_bits_backup);
    }

    /// Writes the virgin map as raw bytes, no header. A dump only makes
    /// sense for the engine build that produced it.
    pub fn save_virgin(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, &self.virgin_bits)?;
        Ok(())
    }

    /// Loads a virgin map saved by [`CoverageEngine::save_virgin`]. The
    /// loaded state is snapshotted into the backup slot and the live bitmap
    /// is cleared. Returns the number of already-discovered edges.
    pub fn load_virgin(&mut self, path: &Path) -> Result<u32, Error> {
        let bytes = fs::read(path)?;
        if bytes.len() != self.bitmap_size {
            return Err(Error::IncompatibleMap {
                expected: self.bitmap_size,
                actual: bytes.len(),
            });
        }
        self.virgin_bits.copy_from_slice(&bytes);
        self.virgin_bits_backup.copy_from_slice(&bytes);
        self.clear_bitmap();
        let discovered = self.bitmap_size as u32 * 8 - popcount(&self.virgin_bits);
        info!(discovered, "coverage map loaded");
        Ok(discovered)
    }

    /// Removes the shared region's name.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.shmem.unlink()
    }

    #[cfg(test)]
    pub(crate) fn poke_test_edges(&mut self, num_edges: u32, bits: &[usize]) {
        self.shmem.set_num_edges(num_edges);
        if self.bitmap_size > 0 {
            let map = self.shmem.edges_mut(self.bitmap_size);
            map.fill(0);
            for &bit in bits {
                map[bit / 8] |= 1 << (bit % 8);
            }
        }
    }
}

fn word(chunk: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..chunk.len()].copy_from_slice(chunk);
    u64::from_ne_bytes(buf)
}

/// Counts live bits that are still virgin, leaving virgin untouched.
fn count_fresh(map: &[u8], virgin: &[u8]) -> u32 {
    map.chunks(8)
        .zip(virgin.chunks(8))
        .map(|(m, v)| (word(m) & word(v)).count_ones())
        .sum()
}

/// Marks every live bit discovered, returning how many were still virgin.
/// Only words that signal a candidate are touched byte by byte.
fn absorb(map: &[u8], virgin: &mut [u8]) -> u32 {
    let mut new_edges = 0;
    for (map_chunk, virgin_chunk) in map.chunks(8).zip(virgin.chunks_mut(8)) {
        if word(map_chunk) & word(virgin_chunk) == 0 {
            continue;
        }
        for (map_byte, virgin_byte) in map_chunk.iter().zip(virgin_chunk.iter_mut()) {
            let fresh = map_byte & *virgin_byte;
            if fresh != 0 {
                new_edges += fresh.count_ones();
                *virgin_byte &= !fresh;
            }
        }
    }
    new_edges
}

fn popcount(map: &[u8]) -> u32 {
    map.chunks(8).map(|chunk| word(chunk).count_ones()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Region ids in tests are unique per test function: the name embeds the
    // process id, so only in-process collisions matter.
    fn engine(id: u32, num_edges: u32, bits: &[usize]) -> CoverageEngine {
        let mut engine = CoverageEngine::initialize(id).expect("coverage init");
        engine.poke_test_edges(num_edges, &[]);
        engine.finish_initialization().expect("finish init");
        engine.poke_test_edges(num_edges, bits);
        engine
    }

    fn ones(engine: &CoverageEngine) -> u32 {
        popcount(&engine.virgin_bits)
    }

    #[test]
    fn single_new_edge_then_nothing() {
        let mut engine = engine(9001, 16, &[5]);
        assert_eq!(
            engine.evaluate(),
            CoverageDelta {
                new_edges: 1,
                total_edges: 1
            }
        );
        // Same map again: the edge is no longer virgin.
        assert_eq!(engine.evaluate(), CoverageDelta::default());
        engine.shutdown().unwrap();
    }

    #[test]
    fn evaluate_shrinks_virgin_by_exactly_the_new_edges() {
        let mut engine = engine(9002, 64, &[0, 3, 42]);
        let before = ones(&engine);
        let delta = engine.evaluate();
        assert_eq!(delta.new_edges, 3);
        assert_eq!(ones(&engine), before - 3);
        engine.shutdown().unwrap();
    }

    #[test]
    fn total_edges_counts_the_whole_live_map() {
        let mut engine = engine(9003, 32, &[1, 2]);
        engine.evaluate();
        // Edge 9 is new, 1 and 2 are already discovered but still hit.
        engine.poke_test_edges(32, &[1, 2, 9]);
        assert_eq!(
            engine.evaluate(),
            CoverageDelta {
                new_edges: 1,
                total_edges: 3
            }
        );
        engine.shutdown().unwrap();
    }

    #[test]
    fn step1_is_non_destructive() {
        let mut engine = engine(9004, 16, &[3, 7]);
        let before = ones(&engine);
        assert_eq!(engine.evaluate_step1_check(), 2);
        assert_eq!(ones(&engine), before);
        // Re-checking gives the same answer.
        assert_eq!(engine.evaluate_step1_check(), 2);
        engine.shutdown().unwrap();
    }

    #[test]
    fn step2_confirms_when_the_rerun_reproduces() {
        let mut engine = engine(9005, 16, &[3, 7]);
        assert_eq!(engine.evaluate_step1_check(), 2);
        // Rerun only hits edge 7.
        engine.poke_test_edges(16, &[7]);
        assert_eq!(
            engine.evaluate_step2_confirm(),
            CoverageDelta {
                new_edges: 2,
                total_edges: 2
            }
        );
        // Both runs were folded: nothing is new anymore.
        engine.poke_test_edges(16, &[3, 7]);
        assert_eq!(engine.evaluate_step1_check(), 0);
        engine.shutdown().unwrap();
    }

    #[test]
    fn step2_rejects_an_unreproduced_run_but_still_absorbs_it() {
        let mut engine = engine(9006, 16, &[3, 7]);
        assert_eq!(engine.evaluate_step1_check(), 2);
        // Rerun hits nothing at all.
        engine.poke_test_edges(16, &[]);
        assert_eq!(engine.evaluate_step2_confirm(), CoverageDelta::default());
        // The flaky edges were absorbed regardless and are not re-reported.
        engine.poke_test_edges(16, &[3, 7]);
        assert_eq!(engine.evaluate_step1_check(), 0);
        engine.shutdown().unwrap();
    }

    #[test]
    fn backup_restore_is_identity() {
        let mut engine = engine(9007, 32, &[4, 5, 6]);
        engine.backup_virgin();
        let saved = engine.virgin_bits.clone();
        engine.evaluate();
        assert_ne!(engine.virgin_bits, saved);
        engine.restore_virgin();
        assert_eq!(engine.virgin_bits, saved);
        engine.shutdown().unwrap();
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("virgin.bin");
        let mut engine = engine(9008, 64, &[10, 20, 30]);
        engine.evaluate();
        let saved = engine.virgin_bits.clone();
        engine.save_virgin(&path).unwrap();
        // Wipe and reload.
        engine.virgin_bits.fill(0xff);
        let discovered = engine.load_virgin(&path).unwrap();
        assert_eq!(engine.virgin_bits, saved);
        assert_eq!(discovered, 3);
        engine.shutdown().unwrap();
    }

    #[test]
    fn load_rejects_a_map_of_the_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.bin");
        std::fs::write(&path, [0xffu8; 3]).unwrap();
        let mut engine = engine(9009, 64, &[]);
        assert!(matches!(
            engine.load_virgin(&path),
            Err(Error::IncompatibleMap {
                expected: 8,
                actual: 3
            })
        ));
        engine.shutdown().unwrap();
    }

    #[test]
    fn clear_bitmap_zeroes_the_live_map() {
        let mut engine = engine(9010, 16, &[0, 15]);
        engine.clear_bitmap();
        assert!(engine.shmem.edges(engine.bitmap_size).iter().all(|&b| b == 0));
        engine.shutdown().unwrap();
    }

    #[test]
    fn too_many_edges_is_rejected() {
        let mut engine = CoverageEngine::initialize(9011).expect("coverage init");
        engine.poke_test_edges(MAX_EDGES as u32 + 1, &[]);
        assert!(matches!(
            engine.finish_initialization(),
            Err(Error::ResourceExhausted(_))
        ));
        engine.shutdown().unwrap();
    }
}
