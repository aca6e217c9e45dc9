//! Library side of the `helios` binary.
pub mod report;
pub mod setup;
