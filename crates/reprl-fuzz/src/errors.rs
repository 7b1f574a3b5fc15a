//! Error kinds surfaced to the fuzzing driver.
//!
//! Timeouts and crashes of the engine are *not* errors — fuzzing expects
//! them — and are reported through [`crate::execution::status::ExecutionStatus`]
//! instead.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A memfd/mmap/shm allocation failed, or the engine reports more edges
    /// than the shared region can describe.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Fork/exec or the HELO handshake failed.
    #[error("failed to spawn the engine: {0}")]
    ChildSpawnFailed(String),

    /// The script does not fit into the data channel. The context stays
    /// healthy; smaller scripts keep working.
    #[error("script of {0} bytes exceeds the data channel capacity")]
    ScriptTooLarge(usize),

    /// A control-pipe read/write, select, or waitpid anomaly not explained
    /// by the engine dying. The context is left childless so the next
    /// execution respawns.
    #[error("REPRL channel failure: {0}")]
    ReprlFailure(String),

    /// The previous child was found dead while sending the next `exec`
    /// command. Recoverable: the next execution respawns.
    #[error("engine died between executions: {0}")]
    ChildDiedBetweenRuns(String),

    /// A persisted coverage map does not match the current target build.
    #[error("coverage map holds {actual} bytes, expected {expected}")]
    IncompatibleMap { expected: usize, actual: usize },

    /// The delimiter scanner cannot track this symbol.
    #[error("symbol {0:?} is not supported by the scanner")]
    UnsupportedSymbol(char),

    #[error(transparent)]
    Io(#[from] io::Error),
}
