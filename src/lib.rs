//! # Grouped-octree Fast Multipole Method engine
//!
//! A block-structured ("grouped") octree and the multi-pass FMM algorithm
//! engines that walk it. Cells and particles are packed per level into
//! contiguous blocks of a few hundred entries, amortizing per-cell overhead
//! and giving the parallel engines block-granular dependencies.
//!
//! Notable features of this library are:
//! * Three interchangeable engines over the same structure: a sequential
//!   reference, a shared-memory task-graph engine on rayon, and an
//!   MPI-distributed variant (feature `mpi`).
//! * A trait-based kernel interface: the engines drive the six FMM
//!   operators (P2M, M2M, M2L, L2L, L2P, P2P) and a per-level transfer
//!   hook, kernels supply the expansion types and arithmetic.
//! * Exact traversal validation through an interaction-counting kernel:
//!   after a run over N particles every particle's counter equals N - 1.
#![cfg_attr(feature = "strict", deny(warnings))]
#![warn(missing_docs)]

pub mod fmm;
pub mod traits;
pub mod tree;

// Public API
#[doc(inline)]
pub use fmm::eval::sequential::SequentialFmm;
#[doc(inline)]
pub use fmm::eval::task_parallel::TaskParallelFmm;
#[doc(inline)]
pub use fmm::kernel::CountKernel;
#[doc(inline)]
pub use traits::fmm::FmmEngine;
#[doc(inline)]
pub use traits::kernel::FmmKernel;
#[doc(inline)]
pub use traits::types::FmmOperations;
#[doc(inline)]
pub use tree::domain::Domain;
#[doc(inline)]
pub use tree::morton::MortonIndex;
#[doc(inline)]
pub use tree::types::GroupedTree;

#[cfg(feature = "mpi")]
#[doc(inline)]
pub use fmm::eval::multi_node::MultiNodeFmm;
#[cfg(feature = "mpi")]
#[doc(inline)]
pub use fmm::partition::balanced_partition;
