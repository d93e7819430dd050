//! Shared storage types used by the evaluation engines.
use num::Float;

use crate::tree::{
    morton::MortonIndex,
    types::{CellSymbolic, GroupedTree, LeafParticleRefs, LeafParticleRefsMut},
};

/// Raw read pointer into tree storage, shareable across the worker pool.
///
/// Dereferencing requires that no mutable claim on the pointee is live;
/// the engines' declared read/write sets uphold this.
#[derive(Clone, Copy, Debug)]
pub struct SendPtr<T> {
    /// The pointee.
    pub raw: *const T,
}

/// Raw write pointer into tree storage, shareable across the worker pool.
///
/// Dereferencing requires an exclusive claim on the pointee; the engines'
/// declared read/write sets uphold this.
#[derive(Clone, Copy, Debug)]
pub struct SendPtrMut<T> {
    /// The pointee.
    pub raw: *mut T,
}

unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}
unsafe impl<T> Send for SendPtrMut<T> {}
unsafe impl<T> Sync for SendPtrMut<T> {}

impl<T> Default for SendPtr<T> {
    fn default() -> Self {
        SendPtr {
            raw: std::ptr::null(),
        }
    }
}

impl<T> Default for SendPtrMut<T> {
    fn default() -> Self {
        SendPtrMut {
            raw: std::ptr::null_mut(),
        }
    }
}

/// Flat per-level pointer tables over a tree's cell storage.
///
/// Built once at engine construction while the engine holds the tree
/// exclusively; the tree's block topology never changes afterwards, so the
/// pointers stay valid for the engine's lifetime. Every pass addresses cell
/// pieces through these tables, the dependency discipline of the engine
/// guarantees that no piece is aliased mutably.
pub struct CellRefTables<M, L> {
    /// Morton indices per level, sorted, parallel to the pointer tables.
    pub mortons: Vec<Vec<MortonIndex>>,

    /// Symbolic descriptions per level.
    pub symbolics: Vec<Vec<SendPtr<CellSymbolic>>>,

    /// Multipole expansions per level.
    pub multipoles: Vec<Vec<SendPtrMut<M>>>,

    /// Local expansions per level.
    pub locals: Vec<Vec<SendPtrMut<L>>>,

    /// Flat index at which each block starts, per level, with an end
    /// sentinel.
    pub block_starts: Vec<Vec<usize>>,
}

impl<M, L> CellRefTables<M, L> {
    /// Build the tables over a tree.
    pub fn new<T: Float + Default>(tree: &mut GroupedTree<T, M, L>) -> Self
    where
        M: Default + Clone,
        L: Default + Clone,
    {
        let height = tree.height;
        let mut mortons = Vec::with_capacity(height);
        let mut symbolics = Vec::with_capacity(height);
        let mut multipoles = Vec::with_capacity(height);
        let mut locals = Vec::with_capacity(height);
        let mut block_starts = Vec::with_capacity(height);

        for level in 0..height {
            let n_cells = tree.n_cells(level);
            let mut level_mortons = Vec::with_capacity(n_cells);
            let mut level_symbolics = Vec::with_capacity(n_cells);
            let mut level_multipoles = Vec::with_capacity(n_cells);
            let mut level_locals = Vec::with_capacity(n_cells);
            let mut starts = Vec::with_capacity(tree.levels[level].len() + 1);

            for group in tree.levels[level].iter_mut() {
                starts.push(level_mortons.len());
                for i in 0..group.symbolics.len() {
                    level_mortons.push(group.symbolics[i].morton);
                    level_symbolics.push(SendPtr {
                        raw: &group.symbolics[i] as *const CellSymbolic,
                    });
                    level_multipoles.push(SendPtrMut {
                        raw: &mut group.multipoles[i] as *mut M,
                    });
                    level_locals.push(SendPtrMut {
                        raw: &mut group.locals[i] as *mut L,
                    });
                }
            }
            starts.push(level_mortons.len());

            mortons.push(level_mortons);
            symbolics.push(level_symbolics);
            multipoles.push(level_multipoles);
            locals.push(level_locals);
            block_starts.push(starts);
        }

        CellRefTables {
            mortons,
            symbolics,
            multipoles,
            locals,
            block_starts,
        }
    }

    /// Number of cells at a level.
    pub fn n_cells(&self, level: usize) -> usize {
        self.mortons[level].len()
    }

    /// Number of blocks at a level.
    pub fn n_blocks(&self, level: usize) -> usize {
        self.block_starts[level].len() - 1
    }

    /// Flat cell range of a block.
    pub fn block_range(&self, level: usize, block: usize) -> std::ops::Range<usize> {
        self.block_starts[level][block]..self.block_starts[level][block + 1]
    }

    /// Block holding the given flat cell index.
    pub fn block_of(&self, level: usize, flat: usize) -> usize {
        self.block_starts[level].partition_point(|&start| start <= flat) - 1
    }

    /// Flat index of a cell, `None` if absent.
    pub fn find(&self, level: usize, morton: MortonIndex) -> Option<usize> {
        self.mortons[level].binary_search(&morton).ok()
    }

    /// Blocks whose cells fall in the inclusive index range `[lo, hi]`.
    pub fn blocks_in_range(
        &self,
        level: usize,
        lo: MortonIndex,
        hi: MortonIndex,
    ) -> std::ops::Range<usize> {
        let mortons = &self.mortons[level];
        let first = mortons.partition_point(|&m| m < lo);
        let last = mortons.partition_point(|&m| m <= hi);
        if first == last {
            return 0..0;
        }
        self.block_of(level, first)..self.block_of(level, last - 1) + 1
    }
}

/// Flat pointer table over one leaf's particle storage.
#[derive(Clone, Copy)]
pub struct LeafPtrs<T> {
    /// Particle positions.
    pub positions: SendPtr<[T; 3]>,

    /// Particle charges.
    pub charges: SendPtr<T>,

    /// Accumulated potentials.
    pub potentials: SendPtrMut<T>,

    /// Accumulated forces.
    pub forces: SendPtrMut<[T; 3]>,

    /// Original input indices.
    pub global_indices: SendPtr<usize>,

    /// Number of particles in the leaf.
    pub len: usize,
}

impl<T> LeafPtrs<T> {
    /// Materialize a read-only particle view.
    ///
    /// # Safety
    /// No mutable view of the same leaf may be live.
    pub unsafe fn as_refs<'a>(&self) -> LeafParticleRefs<'a, T> {
        LeafParticleRefs {
            positions: std::slice::from_raw_parts(self.positions.raw, self.len),
            charges: std::slice::from_raw_parts(self.charges.raw, self.len),
            potentials: std::slice::from_raw_parts(self.potentials.raw, self.len),
            forces: std::slice::from_raw_parts(self.forces.raw, self.len),
            global_indices: std::slice::from_raw_parts(self.global_indices.raw, self.len),
        }
    }

    /// Materialize a mutable particle view.
    ///
    /// # Safety
    /// No other view of the same leaf may be live.
    pub unsafe fn as_refs_mut<'a>(&self) -> LeafParticleRefsMut<'a, T> {
        LeafParticleRefsMut {
            positions: std::slice::from_raw_parts(self.positions.raw, self.len),
            charges: std::slice::from_raw_parts(self.charges.raw, self.len),
            potentials: std::slice::from_raw_parts_mut(self.potentials.raw, self.len),
            forces: std::slice::from_raw_parts_mut(self.forces.raw, self.len),
        }
    }
}

/// Flat pointer tables over a tree's leaf particle storage.
///
/// Leaf entries align index-for-index with the leaf level of the
/// corresponding [`CellRefTables`].
pub struct LeafRefTables<T> {
    /// Morton index of each leaf, sorted.
    pub mortons: Vec<MortonIndex>,

    /// Particle views per leaf.
    pub views: Vec<LeafPtrs<T>>,

    /// Flat index at which each block starts, with an end sentinel.
    pub block_starts: Vec<usize>,
}

impl<T> LeafRefTables<T> {
    /// Build the tables over a tree.
    pub fn new<M, L>(tree: &mut GroupedTree<T, M, L>) -> Self
    where
        T: Float,
    {
        let mut mortons = Vec::new();
        let mut views = Vec::new();
        let mut block_starts = Vec::new();

        for group in tree.particle_groups.iter_mut() {
            block_starts.push(mortons.len());
            for i in 0..group.n_leaves() {
                let range = group.leaf_range(i);
                mortons.push(group.leaf_mortons[i]);
                views.push(LeafPtrs {
                    positions: SendPtr {
                        raw: group.positions.as_ptr().wrapping_add(range.start),
                    },
                    charges: SendPtr {
                        raw: group.charges.as_ptr().wrapping_add(range.start),
                    },
                    potentials: SendPtrMut {
                        raw: group.potentials.as_mut_ptr().wrapping_add(range.start),
                    },
                    forces: SendPtrMut {
                        raw: group.forces.as_mut_ptr().wrapping_add(range.start),
                    },
                    global_indices: SendPtr {
                        raw: group.global_indices.as_ptr().wrapping_add(range.start),
                    },
                    len: range.len(),
                });
            }
        }
        block_starts.push(mortons.len());

        LeafRefTables {
            mortons,
            views,
            block_starts,
        }
    }

    /// Number of leaves.
    pub fn n_leaves(&self) -> usize {
        self.mortons.len()
    }

    /// Number of blocks.
    pub fn n_blocks(&self) -> usize {
        self.block_starts.len() - 1
    }

    /// Flat leaf range of a block.
    pub fn block_range(&self, block: usize) -> std::ops::Range<usize> {
        self.block_starts[block]..self.block_starts[block + 1]
    }

    /// Block holding the given flat leaf index.
    pub fn block_of(&self, flat: usize) -> usize {
        self.block_starts.partition_point(|&start| start <= flat) - 1
    }

    /// Flat index of a leaf, `None` if absent.
    pub fn find(&self, morton: MortonIndex) -> Option<usize> {
        self.mortons.binary_search(&morton).ok()
    }
}
