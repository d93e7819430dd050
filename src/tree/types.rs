//! Data structures for block-structured octrees.
use std::fmt;

use num::Float;

use crate::tree::{
    domain::Domain,
    morton::{MortonIndex, TreeCoordinate},
};

/// Read-only description of a cell, fixed at tree construction.
#[derive(Clone, Copy, Debug, Default)]
pub struct CellSymbolic {
    /// Morton index of the cell.
    pub morton: MortonIndex,

    /// Index coordinate of the cell.
    pub coordinate: TreeCoordinate,

    /// Level of the cell, the root is at level 0.
    pub level: usize,
}

/// A block of cells of one level, contiguous in Morton order.
///
/// Covers the inclusive index range `[range_start, range_end]` and tolerates
/// gaps, absent indices are simply not stored. Cell data is kept in three
/// parallel arrays so each pass addresses exactly one piece per cell: the
/// symbolic description, the multipole expansion and the local expansion.
/// Block topology is immutable after construction, only the expansion
/// payloads are mutated in place.
#[derive(Clone, Debug, Default)]
pub struct CellGroup<M, L> {
    /// Level of every cell in this block.
    pub level: usize,

    /// Morton index of the first cell.
    pub range_start: MortonIndex,

    /// Morton index of the last cell, inclusive.
    pub range_end: MortonIndex,

    /// Symbolic descriptions, sorted by Morton index.
    pub symbolics: Vec<CellSymbolic>,

    /// Multipole expansions, parallel to `symbolics`.
    pub multipoles: Vec<M>,

    /// Local expansions, parallel to `symbolics`.
    pub locals: Vec<L>,
}

impl<M, L> CellGroup<M, L> {
    /// Number of cells stored in this block.
    pub fn n_cells(&self) -> usize {
        self.symbolics.len()
    }

    /// Whether an index falls within this block's covered range.
    pub fn covers(&self, morton: MortonIndex) -> bool {
        self.range_start <= morton && morton <= self.range_end
    }

    /// Position of a cell within the block, `None` if absent.
    pub fn cell_index(&self, morton: MortonIndex) -> Option<usize> {
        self.symbolics
            .binary_search_by_key(&morton, |symbolic| symbolic.morton)
            .ok()
    }
}

/// Borrowed view of one leaf's particle data.
#[derive(Debug)]
pub struct LeafParticleRefs<'a, T> {
    /// Particle positions.
    pub positions: &'a [[T; 3]],

    /// Particle charges.
    pub charges: &'a [T],

    /// Accumulated potentials.
    pub potentials: &'a [T],

    /// Accumulated forces.
    pub forces: &'a [[T; 3]],

    /// Original input index of each particle.
    pub global_indices: &'a [usize],
}

impl<T> LeafParticleRefs<'_, T> {
    /// Number of particles in the leaf.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the leaf holds no particles.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Mutable view of one leaf's particle data, outputs writable.
#[derive(Debug)]
pub struct LeafParticleRefsMut<'a, T> {
    /// Particle positions.
    pub positions: &'a [[T; 3]],

    /// Particle charges.
    pub charges: &'a [T],

    /// Accumulated potentials.
    pub potentials: &'a mut [T],

    /// Accumulated forces.
    pub forces: &'a mut [[T; 3]],
}

impl<T> LeafParticleRefsMut<'_, T> {
    /// Number of particles in the leaf.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the leaf holds no particles.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Particle data of one leaf-level block, stored structure-of-arrays.
///
/// Mirrors the leaf partition of the corresponding leaf-level [`CellGroup`]
/// exactly, leaf `i` of the cell block owns the particle range
/// `leaf_offsets[i]..leaf_offsets[i + 1]`.
#[derive(Clone, Debug, Default)]
pub struct ParticleGroup<T> {
    /// Morton index of each leaf in this block.
    pub leaf_mortons: Vec<MortonIndex>,

    /// Particle range bounds per leaf, length `n_leaves + 1`.
    pub leaf_offsets: Vec<usize>,

    /// Particle positions.
    pub positions: Vec<[T; 3]>,

    /// Particle charges.
    pub charges: Vec<T>,

    /// Accumulated potentials.
    pub potentials: Vec<T>,

    /// Accumulated forces.
    pub forces: Vec<[T; 3]>,

    /// Original input index of each particle.
    pub global_indices: Vec<usize>,
}

impl<T> ParticleGroup<T> {
    /// Number of leaves in this block.
    pub fn n_leaves(&self) -> usize {
        self.leaf_mortons.len()
    }

    /// Number of particles in this block.
    pub fn n_particles(&self) -> usize {
        self.positions.len()
    }

    /// Particle range of the `i`-th leaf.
    pub fn leaf_range(&self, i: usize) -> std::ops::Range<usize> {
        self.leaf_offsets[i]..self.leaf_offsets[i + 1]
    }

    /// Borrowed view of the `i`-th leaf's particles.
    pub fn leaf_particles(&self, i: usize) -> LeafParticleRefs<'_, T> {
        let range = self.leaf_range(i);
        LeafParticleRefs {
            positions: &self.positions[range.clone()],
            charges: &self.charges[range.clone()],
            potentials: &self.potentials[range.clone()],
            forces: &self.forces[range.clone()],
            global_indices: &self.global_indices[range],
        }
    }

    /// Mutable view of the `i`-th leaf's particles.
    pub fn leaf_particles_mut(&mut self, i: usize) -> LeafParticleRefsMut<'_, T> {
        let range = self.leaf_range(i);
        LeafParticleRefsMut {
            positions: &self.positions[range.clone()],
            charges: &self.charges[range.clone()],
            potentials: &mut self.potentials[range.clone()],
            forces: &mut self.forces[range],
        }
    }
}

/// A block-structured octree over 3D particle data.
///
/// Cells of each level are stored as an ordered sequence of [`CellGroup`]
/// blocks, leaf-level blocks are paired one-to-one with [`ParticleGroup`]
/// blocks holding the enclosed particles. The structure is built once from
/// the full particle set, passes mutate expansion and particle payloads in
/// place, cells and particles are never inserted or removed afterwards.
#[derive(Clone, Default)]
pub struct GroupedTree<T, M, L>
where
    T: Float,
{
    /// Number of levels, the leaf level is `height - 1`.
    pub height: usize,

    /// Box enclosing all particles.
    pub domain: Domain<T>,

    /// Target number of leaves per block.
    pub group_size: usize,

    /// Cell blocks per level, `levels[0]` holds the root.
    pub levels: Vec<Vec<CellGroup<M, L>>>,

    /// Particle blocks, parallel to the leaf-level cell blocks.
    pub particle_groups: Vec<ParticleGroup<T>>,
}

/// Per-level block statistics, for diagnostics.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockInfo {
    /// Level described by this entry.
    pub level: usize,

    /// Number of blocks at this level.
    pub n_blocks: usize,

    /// Number of cells at this level.
    pub n_cells: usize,

    /// Smallest block size at this level.
    pub min_cells: usize,

    /// Largest block size at this level.
    pub max_cells: usize,
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "level {}: {} blocks, {} cells, block sizes {}..={}",
            self.level, self.n_blocks, self.n_cells, self.min_cells, self.max_cells
        )
    }
}
