//! Evaluation engines over block-structured octrees.
pub mod eval;
pub mod helpers;
pub mod kernel;
#[cfg(feature = "mpi")]
pub mod partition;
pub mod tasks;
pub mod types;
