//! Block-structured octrees over Morton-indexed particle data.
pub mod constants;
pub mod domain;
pub mod helpers;
pub mod morton;
#[cfg(feature = "mpi")]
pub mod multi_node;
pub mod single_node;
pub mod types;
