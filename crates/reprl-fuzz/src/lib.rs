#![warn(missing_debug_implementations, rust_2018_idioms)]

//! Native core of a coverage-guided JavaScript-engine fuzzer: a REPRL
//! (read-eval-print-reset-loop) child supervisor, shared-memory
//! edge-coverage accounting with an anti-flake confirmation protocol, and a
//! string-aware delimiter scanner for script surgery. Script generation,
//! corpus management and mutation live in the driver on top of this crate.
//!
//! POSIX only: the channels ride on memfds and the coverage map on a named
//! shm object.

pub mod channel;
pub mod coverage;
pub mod errors;
pub mod execution;
pub mod fuzz_target;
pub mod host;
pub mod scanner;

pub use errors::Error;
pub use host::{EngineHost, HostOptions};
