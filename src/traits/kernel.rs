//! The operator contract implemented by numerical kernels.
use num::Float;

use crate::tree::types::{CellSymbolic, LeafParticleRefs, LeafParticleRefsMut};

/// The five-operator contract of a fast multipole kernel.
///
/// The engines own the traversal, the dependency ordering and all storage;
/// a kernel only computes. Expansion payloads are chosen by the kernel via
/// the associated types and default-initialized by the tree, so `Default`
/// must produce the neutral expansion.
///
/// Operator methods take `&mut self` so implementations may keep scratch
/// buffers. Parallel engines clone one kernel per worker, a kernel is never
/// called concurrently from two threads.
pub trait FmmKernel<T>: Clone + Send
where
    T: Float,
{
    /// Multipole expansion payload.
    type Multipole: Default + Clone + Send + Sync;

    /// Local expansion payload.
    type Local: Default + Clone + Send + Sync;

    /// Form the multipole expansion of a leaf from its particles.
    fn p2m(
        &mut self,
        multipole: &mut Self::Multipole,
        cell: &CellSymbolic,
        particles: &LeafParticleRefs<'_, T>,
    );

    /// Accumulate child multipole expansions into a parent, octant order,
    /// absent children are `None`.
    fn m2m(
        &mut self,
        multipole: &mut Self::Multipole,
        cell: &CellSymbolic,
        children: &[Option<(&CellSymbolic, &Self::Multipole)>; 8],
    );

    /// Accumulate far-field sources into a cell's local expansion.
    ///
    /// `sources` is the compacted interaction list, `positions` tags each
    /// entry with its relative offset in the 7x7x7 scheme.
    fn m2l(
        &mut self,
        local: &mut Self::Local,
        cell: &CellSymbolic,
        sources: &[(&CellSymbolic, &Self::Multipole)],
        positions: &[usize],
    );

    /// Called once per level after every multipole-to-local translation at
    /// that level has completed, before any at the next finer level.
    ///
    /// Implementations must restrict themselves to kernel-local bookkeeping;
    /// cell and particle data must not be touched.
    fn finished_level_m2l(&mut self, _level: usize) {}

    /// Push a parent's local expansion down to its children, octant order,
    /// absent children are `None`.
    fn l2l(
        &mut self,
        local: &Self::Local,
        cell: &CellSymbolic,
        children: &mut [Option<(&CellSymbolic, &mut Self::Local)>; 8],
    );

    /// Evaluate a leaf's local expansion at its particles.
    fn l2p(
        &mut self,
        local: &Self::Local,
        cell: &CellSymbolic,
        particles: &mut LeafParticleRefsMut<'_, T>,
    );

    /// Direct interactions of a leaf, applied mutually.
    ///
    /// `neighbors` holds only the adjacent leaves this call is responsible
    /// for; the implementation must update both sides of each pair as well
    /// as the interactions of the target leaf with itself. `positions` tags
    /// each neighbor with its offset in the 26-slot scheme.
    fn p2p(
        &mut self,
        cell: &CellSymbolic,
        targets: &mut LeafParticleRefsMut<'_, T>,
        neighbors: &mut [(&CellSymbolic, LeafParticleRefsMut<'_, T>)],
        positions: &[usize],
    );

    /// Direct interactions with read-only neighbor leaves, applied one-sided.
    ///
    /// Used for neighbors whose particle data is not writable from this
    /// shard; only the target leaf accumulates, and the target's interactions
    /// with itself are not recomputed.
    fn p2p_remote(
        &mut self,
        cell: &CellSymbolic,
        targets: &mut LeafParticleRefsMut<'_, T>,
        neighbors: &[(&CellSymbolic, LeafParticleRefs<'_, T>)],
        positions: &[usize],
    );
}
