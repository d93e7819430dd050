//! Distributed engine over MPI-partitioned trees.
//!
//! Each process runs the five passes over its own contiguous Morton range,
//! multi-threaded through the rayon pool, and exchanges exactly the data
//! that crosses rank boundaries:
//!
//! - the single cell per level shared between neighboring ranks (the
//!   ancestor of the predecessor's last leaf) is computed by its owner, the
//!   predecessor; child multipoles flow left along a rank ring before M2M,
//!   the completed local flows right before L2L;
//! - interaction-list sources and near-field neighbor leaves held by other
//!   ranks are fetched per level as read-only ghosts through collective
//!   request/response exchanges.
//!
//! All ranks must call [`FmmEngine::execute_operations`] with the same
//! operation mask; ranks with no work at a level skip local computation but
//! still join that level's collectives.
use std::collections::{BTreeSet, HashMap};

use itertools::Itertools;
use mpi::{
    collective::SystemOperation,
    traits::{Communicator, CommunicatorCollectives, Destination, Equivalence, Source},
    Count,
};
use num::Float;
use rayon::iter::{IntoParallelIterator, IntoParallelRefIterator, ParallelIterator};

use crate::fmm::eval::{gather_child_locals, gather_child_multipoles, worker_kernel};
use crate::fmm::helpers::optionally_time;
use crate::fmm::partition::{exchange_varcount, owned_interval, WorkingInterval};
use crate::fmm::types::{CellRefTables, LeafRefTables, SendPtrMut};
use crate::traits::{
    fmm::FmmEngine,
    kernel::FmmKernel,
    types::{FmmError, FmmOperations, FmmOperatorTime, FmmOperatorType},
};
use crate::tree::{
    constants::{N_SHAPES, UPPER_WORKING_LEVEL},
    morton::{interaction_neighbors, leaf_neighbors, MortonIndex},
    types::{CellSymbolic, GroupedTree, LeafParticleRefs},
};

fn cell_symbolic(morton: MortonIndex, level: usize) -> CellSymbolic {
    CellSymbolic {
        morton,
        coordinate: morton.coordinate(),
        level,
    }
}

fn owner_of(
    intervals: &[Option<(MortonIndex, MortonIndex)>],
    morton: MortonIndex,
) -> Option<usize> {
    intervals.iter().position(|interval| {
        interval.map_or(false, |(first, last)| first <= morton && morton <= last)
    })
}

// Particle data of a leaf owned by another rank, near-field read side only.
struct GhostLeaf<T> {
    symbolic: CellSymbolic,
    positions: Vec<[T; 3]>,
    charges: Vec<T>,
    potentials: Vec<T>,
    forces: Vec<[T; 3]>,
    global_indices: Vec<usize>,
}

impl<T> GhostLeaf<T> {
    fn particles(&self) -> LeafParticleRefs<'_, T> {
        LeafParticleRefs {
            positions: &self.positions,
            charges: &self.charges,
            potentials: &self.potentials,
            forces: &self.forces,
            global_indices: &self.global_indices,
        }
    }
}

/// Executes the passes over one rank's shard of a distributed tree.
///
/// The tree must have been built with
/// [`GroupedTree::from_distributed`](crate::tree::types::GroupedTree::from_distributed)
/// or equivalently from [`balanced_partition`](crate::fmm::partition::balanced_partition)
/// output, so that no leaf's particles straddle ranks and blocks never span
/// the ownership boundary. The union of all ranks' potentials equals a
/// sequential run over the union of all particles.
pub struct MultiNodeFmm<'a, T, K, C>
where
    T: Float,
    K: FmmKernel<T>,
    C: Communicator,
{
    communicator: &'a C,
    rank: i32,
    size: i32,
    tree: &'a mut GroupedTree<T, K::Multipole, K::Local>,
    kernels: Vec<K>,
    cells: CellRefTables<K::Multipole, K::Local>,
    leaves: LeafRefTables<T>,
    left_boundary: Option<MortonIndex>,
    leaf_separation_criterion: usize,
    timed: bool,
    operator_times: Vec<FmmOperatorTime>,
}

impl<'a, T, K, C> MultiNodeFmm<'a, T, K, C>
where
    T: Float + Default + Equivalence + Send + Sync,
    K: FmmKernel<T> + Sync,
    K::Multipole: Equivalence + Send + Sync,
    K::Local: Equivalence + Send + Sync,
    C: Communicator,
{
    /// Create an engine over this rank's tree, cloning one kernel per
    /// worker.
    ///
    /// `left_boundary` is the predecessor's last leaf as returned by the
    /// partitioner; it determines cell ownership at every level.
    pub fn new(
        communicator: &'a C,
        tree: &'a mut GroupedTree<T, K::Multipole, K::Local>,
        kernel: K,
        left_boundary: Option<MortonIndex>,
    ) -> Self {
        let cells = CellRefTables::new(tree);
        let leaves = LeafRefTables::new(tree);
        let kernels = (0..rayon::current_num_threads())
            .map(|_| kernel.clone())
            .collect();
        Self {
            communicator,
            rank: communicator.rank(),
            size: communicator.size(),
            tree,
            kernels,
            cells,
            leaves,
            left_boundary,
            leaf_separation_criterion: 1,
            timed: false,
            operator_times: Vec::new(),
        }
    }

    /// Override the separation criterion applied at the leaf level.
    ///
    /// # Panics
    /// If `criterion` is 3 or larger.
    pub fn with_leaf_separation_criterion(mut self, criterion: usize) -> Self {
        assert!(criterion < 3, "separation criterion must be less than 3");
        self.leaf_separation_criterion = criterion;
        self
    }

    /// Enable per-operator timing.
    pub fn timed(mut self, timed: bool) -> Self {
        self.timed = timed;
        self
    }

    /// The tree this engine evaluates over.
    pub fn tree(&self) -> &GroupedTree<T, K::Multipole, K::Local> {
        self.tree
    }

    /// The per-worker kernel clones.
    pub fn kernels(&self) -> &[K] {
        &self.kernels
    }

    /// The Morton range this rank computes at a level, `None` without work.
    pub fn working_interval(&self, level: usize) -> Option<WorkingInterval> {
        let mortons = &self.cells.mortons[level];
        let span = Some((*mortons.first()?, *mortons.last()?));
        owned_interval(self.left_boundary, span, self.tree.leaf_level(), level)
    }

    /// Whether this rank owns any cell at a level.
    pub fn has_work_at_level(&self, level: usize) -> bool {
        self.working_interval(level).is_some()
    }

    // Flat index of the first owned cell; 0 or 1, since at most the single
    // cell on the boundary's ancestor chain precedes the owned range.
    fn owned_start(&self, level: usize) -> usize {
        match self.left_boundary {
            Some(boundary) => {
                let boundary = boundary.ancestor(self.tree.leaf_level() - level);
                self.cells.mortons[level].partition_point(|&m| m <= boundary)
            }
            None => 0,
        }
    }

    fn gather_owned_intervals(&self, level: usize) -> Vec<Option<(MortonIndex, MortonIndex)>> {
        let local = match self.working_interval(level) {
            Some(interval) => [1u64, interval.first.0, interval.last.0],
            None => [0u64, 0, 0],
        };
        let mut gathered = vec![0u64; 3 * self.size as usize];
        self.communicator.all_gather_into(&local[..], &mut gathered[..]);
        gathered
            .chunks_exact(3)
            .map(|chunk| (chunk[0] != 0).then(|| (MortonIndex(chunk[1]), MortonIndex(chunk[2]))))
            .collect()
    }

    fn p2m(&self, kernel_ptrs: &[SendPtrMut<K>]) {
        let leaf_level = self.tree.leaf_level();
        let cells = &self.cells;
        let leaves = &self.leaves;
        (0..leaves.n_blocks()).into_par_iter().for_each(|block| {
            let kernel = worker_kernel(kernel_ptrs);
            for flat in leaves.block_range(block) {
                let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
                let multipole = unsafe { &mut *cells.multipoles[leaf_level][flat].raw };
                let particles = unsafe { leaves.views[flat].as_refs() };
                kernel.p2m(multipole, symbolic, &particles);
            }
        });
    }

    fn m2m(&self, level: usize, kernel_ptrs: &[SendPtrMut<K>]) {
        let leaf_level = self.tree.leaf_level();
        let child_level = level + 1;

        // Child multipoles of my last cell held by the successor. The ring
        // resolves right to left, so forwarded contributions are already
        // folded in when a message arrives.
        let ghosts: Vec<(CellSymbolic, K::Multipole)> = if self.rank < self.size - 1 {
            let successor = self.communicator.process_at_rank(self.rank + 1);
            let (mortons, _status) = successor.receive_vec::<u64>();
            let (values, _status) = successor.receive_vec::<K::Multipole>();
            mortons
                .iter()
                .zip(values)
                .map(|(&m, value)| (cell_symbolic(MortonIndex(m), child_level), value))
                .collect()
        } else {
            Vec::new()
        };

        let owned_start = self.owned_start(level);
        let n_cells = self.cells.n_cells(level);

        if owned_start < n_cells {
            let cells = &self.cells;
            let ghosts = &ghosts;
            let last_flat = n_cells - 1;
            let first_block = cells.block_of(level, owned_start);
            (first_block..cells.n_blocks(level))
                .into_par_iter()
                .for_each(|block| {
                    let kernel = worker_kernel(kernel_ptrs);
                    for flat in cells.block_range(level, block) {
                        let symbolic = unsafe { &*cells.symbolics[level][flat].raw };
                        let multipole = unsafe { &mut *cells.multipoles[level][flat].raw };
                        let mut children =
                            gather_child_multipoles(cells, child_level, symbolic.morton);
                        if flat == last_flat {
                            for (ghost_symbolic, ghost_value) in ghosts {
                                children[ghost_symbolic.morton.octant()] =
                                    Some((ghost_symbolic, ghost_value));
                            }
                        }
                        kernel.m2m(multipole, symbolic, &children);
                    }
                });
        }

        // Hand the shared cell's child multipoles to its owner on the left.
        if self.rank > 0 {
            let mut send_mortons: Vec<u64> = Vec::new();
            let mut send_values: Vec<K::Multipole> = Vec::new();
            if let Some(boundary) = self.left_boundary {
                let parent = boundary.ancestor(leaf_level - level);
                if self.cells.mortons[level].first() == Some(&parent) && owned_start > 0 {
                    // My completed children of the shared cell are the
                    // leading prefix of the owned range one level down.
                    for flat in self.owned_start(child_level)..self.cells.n_cells(child_level) {
                        let morton = self.cells.mortons[child_level][flat];
                        if morton.parent() != parent {
                            break;
                        }
                        send_mortons.push(morton.0);
                        send_values.push(unsafe {
                            (*self.cells.multipoles[child_level][flat].raw).clone()
                        });
                    }
                }
            }
            // Contributions aimed at a cell I don't own pass through,
            // including across ranks holding nothing at this level.
            if owned_start >= n_cells {
                for (ghost_symbolic, ghost_value) in &ghosts {
                    send_mortons.push(ghost_symbolic.morton.0);
                    send_values.push(ghost_value.clone());
                }
            }
            let predecessor = self.communicator.process_at_rank(self.rank - 1);
            predecessor.send(&send_mortons[..]);
            predecessor.send(&send_values[..]);
        }
    }

    // Request the interaction-list sources this rank does not hold with
    // full data, answered by their owners. Collective at every level.
    fn fetch_ghost_multipoles(
        &self,
        level: usize,
        criterion: usize,
    ) -> HashMap<MortonIndex, (CellSymbolic, K::Multipole)> {
        let size = self.size as usize;
        let intervals = self.gather_owned_intervals(level);
        let owned_start = self.owned_start(level);

        let mut needed = BTreeSet::new();
        for flat in owned_start..self.cells.n_cells(level) {
            let symbolic = unsafe { &*self.cells.symbolics[level][flat].raw };
            for (morton, _) in interaction_neighbors(&symbolic.coordinate, level, criterion) {
                match self.cells.find(level, morton) {
                    Some(found) if found >= owned_start => {}
                    _ => {
                        needed.insert(morton);
                    }
                }
            }
        }

        let mut queries = vec![Vec::new(); size];
        for morton in needed {
            if let Some(owner) = owner_of(&intervals, morton) {
                if owner != self.rank as usize {
                    queries[owner].push(morton.0);
                }
            }
        }
        let query_counts = queries.iter().map(|q| q.len() as Count).collect_vec();
        let flat_queries = queries.concat();
        let (received_queries, received_counts) =
            exchange_varcount(&flat_queries, &query_counts, self.communicator);

        // Answer with the requested cells that exist here; queried indices
        // lie in this rank's working interval, so any hit is owned.
        let mut response_mortons: Vec<u64> = Vec::new();
        let mut response_values: Vec<K::Multipole> = Vec::new();
        let mut response_counts = Vec::with_capacity(size);
        let mut offset = 0;
        for &count in &received_counts {
            let mut found_here = 0 as Count;
            for &query in &received_queries[offset..offset + count as usize] {
                if let Some(flat) = self.cells.find(level, MortonIndex(query)) {
                    response_mortons.push(query);
                    response_values
                        .push(unsafe { (*self.cells.multipoles[level][flat].raw).clone() });
                    found_here += 1;
                }
            }
            response_counts.push(found_here);
            offset += count as usize;
        }
        let (ghost_mortons, _) =
            exchange_varcount(&response_mortons, &response_counts, self.communicator);
        let (ghost_values, _) =
            exchange_varcount(&response_values, &response_counts, self.communicator);

        ghost_mortons
            .iter()
            .zip(ghost_values)
            .map(|(&m, value)| {
                let morton = MortonIndex(m);
                (morton, (cell_symbolic(morton, level), value))
            })
            .collect()
    }

    fn m2l(&self, level: usize, kernel_ptrs: &[SendPtrMut<K>]) {
        let criterion = if level == self.tree.leaf_level() {
            self.leaf_separation_criterion
        } else {
            1
        };
        let ghosts = self.fetch_ghost_multipoles(level, criterion);
        let owned_start = self.owned_start(level);
        let n_cells = self.cells.n_cells(level);

        if owned_start < n_cells {
            let cells = &self.cells;
            let ghosts = &ghosts;
            let first_block = cells.block_of(level, owned_start);
            (first_block..cells.n_blocks(level))
                .into_par_iter()
                .for_each(|block| {
                    let kernel = worker_kernel(kernel_ptrs);
                    for flat in cells.block_range(level, block) {
                        let symbolic = unsafe { &*cells.symbolics[level][flat].raw };
                        let local = unsafe { &mut *cells.locals[level][flat].raw };
                        let mut sources = Vec::new();
                        let mut positions = Vec::new();
                        for (morton, position) in
                            interaction_neighbors(&symbolic.coordinate, level, criterion)
                        {
                            let resolved = match cells.find(level, morton) {
                                Some(found) if found >= owned_start => Some(unsafe {
                                    (
                                        &*cells.symbolics[level][found].raw,
                                        &*cells.multipoles[level][found].raw,
                                    )
                                }),
                                _ => ghosts.get(&morton).map(|(s, v)| (s, v)),
                            };
                            if let Some(source) = resolved {
                                sources.push(source);
                                positions.push(position);
                            }
                        }
                        if !sources.is_empty() {
                            kernel.m2l(local, symbolic, &sources, &positions);
                        }
                    }
                });
        }

        for ptr in kernel_ptrs {
            unsafe { (&mut *ptr.raw).finished_level_m2l(level) };
        }
    }

    fn l2l(&self, level: usize, kernel_ptrs: &[SendPtrMut<K>]) {
        let child_level = level + 1;
        let n_cells = self.cells.n_cells(level);
        let owned_start = self.owned_start(level);

        // The boundary cell's completed local arrives from its owner; the
        // ring resolves left to right, forwarding through empty ranks.
        let received: Option<(CellSymbolic, K::Local)> = if self.rank > 0 {
            let predecessor = self.communicator.process_at_rank(self.rank - 1);
            let (flags, _status) = predecessor.receive_vec::<u64>();
            let (values, _status) = predecessor.receive_vec::<K::Local>();
            (flags[0] != 0).then(|| {
                (
                    cell_symbolic(MortonIndex(flags[1]), level),
                    values.into_iter().next().unwrap(),
                )
            })
        } else {
            None
        };

        if self.rank < self.size - 1 {
            // The ancestor of my last leaf: my last cell when owned here,
            // otherwise exactly the cell just received.
            let payload: Option<(u64, K::Local)> = if owned_start < n_cells {
                let last = n_cells - 1;
                Some((self.cells.mortons[level][last].0, unsafe {
                    (*self.cells.locals[level][last].raw).clone()
                }))
            } else {
                received
                    .as_ref()
                    .map(|(symbolic, value)| (symbolic.morton.0, value.clone()))
            };
            let flags = match &payload {
                Some((morton, _)) => [1u64, *morton],
                None => [0u64, 0],
            };
            let values = payload.map(|(_, value)| vec![value]).unwrap_or_default();
            let successor = self.communicator.process_at_rank(self.rank + 1);
            successor.send(&flags[..]);
            successor.send(&values[..]);
        }

        if owned_start < n_cells {
            let cells = &self.cells;
            let first_block = cells.block_of(level, owned_start);
            (first_block..cells.n_blocks(level))
                .into_par_iter()
                .for_each(|block| {
                    let kernel = worker_kernel(kernel_ptrs);
                    for flat in cells.block_range(level, block) {
                        let symbolic = unsafe { &*cells.symbolics[level][flat].raw };
                        let local = unsafe { &*cells.locals[level][flat].raw };
                        let mut children =
                            gather_child_locals(cells, child_level, symbolic.morton);
                        kernel.l2l(local, symbolic, &mut children);
                    }
                });
        }

        // Push the received boundary cell into my owned children of it.
        if let Some((symbolic, local)) = received {
            let owned_child_start = self.owned_start(child_level);
            let mut children: [Option<(&CellSymbolic, &mut K::Local)>; 8] =
                core::array::from_fn(|octant| {
                    self.cells
                        .find(child_level, symbolic.morton.child(octant))
                        .filter(|&flat| flat >= owned_child_start)
                        .map(|flat| unsafe {
                            (
                                &*self.cells.symbolics[child_level][flat].raw,
                                &mut *self.cells.locals[child_level][flat].raw,
                            )
                        })
                });
            if children.iter().any(Option::is_some) {
                worker_kernel(kernel_ptrs).l2l(&local, &symbolic, &mut children);
            }
        }
    }

    // Request the neighbor leaves held by other ranks, with their particle
    // data. Collective.
    fn fetch_ghost_leaves(&self) -> HashMap<MortonIndex, GhostLeaf<T>> {
        let leaf_level = self.tree.leaf_level();
        let size = self.size as usize;
        let intervals = self.gather_owned_intervals(leaf_level);

        let mut needed = BTreeSet::new();
        for flat in 0..self.leaves.n_leaves() {
            let symbolic = unsafe { &*self.cells.symbolics[leaf_level][flat].raw };
            for (morton, _) in leaf_neighbors(&symbolic.coordinate, leaf_level) {
                if self.leaves.find(morton).is_none() {
                    needed.insert(morton);
                }
            }
        }

        let mut queries = vec![Vec::new(); size];
        for morton in needed {
            if let Some(owner) = owner_of(&intervals, morton) {
                if owner != self.rank as usize {
                    queries[owner].push(morton.0);
                }
            }
        }
        let query_counts = queries.iter().map(|q| q.len() as Count).collect_vec();
        let flat_queries = queries.concat();
        let (received_queries, received_counts) =
            exchange_varcount(&flat_queries, &query_counts, self.communicator);

        let mut response_mortons: Vec<u64> = Vec::new();
        let mut response_sizes: Vec<u64> = Vec::new();
        let mut response_coords: Vec<T> = Vec::new();
        let mut response_charges: Vec<T> = Vec::new();
        let mut leaf_counts = Vec::with_capacity(size);
        let mut coord_counts = Vec::with_capacity(size);
        let mut charge_counts = Vec::with_capacity(size);
        let mut offset = 0;
        for &count in &received_counts {
            let mut leaves_here = 0 as Count;
            let mut particles_here = 0 as Count;
            for &query in &received_queries[offset..offset + count as usize] {
                if let Some(flat) = self.leaves.find(MortonIndex(query)) {
                    let particles = unsafe { self.leaves.views[flat].as_refs() };
                    response_mortons.push(query);
                    response_sizes.push(particles.len() as u64);
                    for position in particles.positions {
                        response_coords.extend_from_slice(position);
                    }
                    response_charges.extend_from_slice(particles.charges);
                    leaves_here += 1;
                    particles_here += particles.len() as Count;
                }
            }
            leaf_counts.push(leaves_here);
            coord_counts.push(3 * particles_here);
            charge_counts.push(particles_here);
            offset += count as usize;
        }

        let (ghost_mortons, _) =
            exchange_varcount(&response_mortons, &leaf_counts, self.communicator);
        let (ghost_sizes, _) = exchange_varcount(&response_sizes, &leaf_counts, self.communicator);
        let (ghost_coords, _) =
            exchange_varcount(&response_coords, &coord_counts, self.communicator);
        let (ghost_charges, _) =
            exchange_varcount(&response_charges, &charge_counts, self.communicator);

        let mut ghosts = HashMap::new();
        let mut particle_offset = 0;
        for (&morton, &n_particles) in ghost_mortons.iter().zip(&ghost_sizes) {
            let n_particles = n_particles as usize;
            let positions = ghost_coords[3 * particle_offset..3 * (particle_offset + n_particles)]
                .chunks_exact(3)
                .map(|chunk| [chunk[0], chunk[1], chunk[2]])
                .collect_vec();
            let charges =
                ghost_charges[particle_offset..particle_offset + n_particles].to_vec();
            particle_offset += n_particles;
            let morton = MortonIndex(morton);
            ghosts.insert(
                morton,
                GhostLeaf {
                    symbolic: cell_symbolic(morton, leaf_level),
                    positions,
                    charges,
                    potentials: vec![T::zero(); n_particles],
                    forces: vec![[T::zero(); 3]; n_particles],
                    global_indices: vec![0; n_particles],
                },
            );
        }
        ghosts
    }

    fn p2p(&self, kernel_ptrs: &[SendPtrMut<K>]) {
        let leaf_level = self.tree.leaf_level();
        let ghosts = self.fetch_ghost_leaves();
        let cells = &self.cells;
        let leaves = &self.leaves;

        // Mutual updates between local leaves, coloured by coordinate
        // mod 3: same-shape leaves never neighbor each other nor share a
        // neighbor, so each phase writes without conflicts.
        let mut shapes: Vec<Vec<usize>> = vec![Vec::new(); N_SHAPES];
        for flat in 0..leaves.n_leaves() {
            let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
            shapes[symbolic.coordinate.shape_index()].push(flat);
        }
        for shape in &shapes {
            shape.par_iter().for_each(|&flat| {
                let kernel = worker_kernel(kernel_ptrs);
                let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
                let mut targets = unsafe { leaves.views[flat].as_refs_mut() };
                let mut neighbors = Vec::new();
                let mut positions = Vec::new();
                for (morton, position) in leaf_neighbors(&symbolic.coordinate, leaf_level) {
                    // The smaller member of each pair applies the mutual
                    // update.
                    if morton <= symbolic.morton {
                        continue;
                    }
                    if let Some(neighbor) = leaves.find(morton) {
                        neighbors.push((
                            unsafe { &*cells.symbolics[leaf_level][neighbor].raw },
                            unsafe { leaves.views[neighbor].as_refs_mut() },
                        ));
                        positions.push(position);
                    }
                }
                kernel.p2p(symbolic, &mut targets, &mut neighbors, &positions);
            });
        }

        // One-sided contributions from leaves owned elsewhere; the owning
        // rank applies the reverse direction symmetrically.
        if !ghosts.is_empty() {
            let ghosts = &ghosts;
            (0..leaves.n_blocks()).into_par_iter().for_each(|block| {
                let kernel = worker_kernel(kernel_ptrs);
                for flat in leaves.block_range(block) {
                    let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
                    let mut neighbors = Vec::new();
                    let mut positions = Vec::new();
                    for (morton, position) in leaf_neighbors(&symbolic.coordinate, leaf_level) {
                        if let Some(ghost) = ghosts.get(&morton) {
                            neighbors.push((&ghost.symbolic, ghost.particles()));
                            positions.push(position);
                        }
                    }
                    if !neighbors.is_empty() {
                        let mut targets = unsafe { leaves.views[flat].as_refs_mut() };
                        kernel.p2p_remote(symbolic, &mut targets, &neighbors, &positions);
                    }
                }
            });
        }
    }

    fn l2p(&self, kernel_ptrs: &[SendPtrMut<K>]) {
        let leaf_level = self.tree.leaf_level();
        let cells = &self.cells;
        let leaves = &self.leaves;
        (0..leaves.n_blocks()).into_par_iter().for_each(|block| {
            let kernel = worker_kernel(kernel_ptrs);
            for flat in leaves.block_range(block) {
                let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
                let local = unsafe { &*cells.locals[leaf_level][flat].raw };
                let mut particles = unsafe { leaves.views[flat].as_refs_mut() };
                kernel.l2p(local, symbolic, &mut particles);
            }
        });
    }
}

impl<T, K, C> FmmEngine for MultiNodeFmm<'_, T, K, C>
where
    T: Float + Default + Equivalence + Send + Sync,
    K: FmmKernel<T> + Sync,
    K::Multipole: Equivalence + Send + Sync,
    K::Local: Equivalence + Send + Sync,
    C: Communicator,
{
    fn execute_operations(&mut self, operations: FmmOperations) -> Result<(), FmmError> {
        self.operator_times.clear();

        // Every rank must run the same operator set, otherwise the
        // per-level collectives below desynchronize. Min and max are
        // global, so all ranks take the same branch here.
        let mut mask_min = 0u32;
        let mut mask_max = 0u32;
        self.communicator
            .all_reduce_into(&operations.0, &mut mask_min, SystemOperation::min());
        self.communicator
            .all_reduce_into(&operations.0, &mut mask_max, SystemOperation::max());
        if mask_min != mask_max {
            return Err(FmmError::Failed(format!(
                "operation mask differs across ranks, {:#x}..{:#x}",
                mask_min, mask_max
            )));
        }

        let leaf_level = self.tree.leaf_level();
        let timed = self.timed;

        let kernel_ptrs: Vec<SendPtrMut<K>> = self
            .kernels
            .iter_mut()
            .map(|kernel| SendPtrMut { raw: kernel as *mut K })
            .collect();

        if operations.contains(FmmOperations::P2M) {
            let (_, duration) = optionally_time(timed, || self.p2m(&kernel_ptrs));
            if let Some(d) = duration {
                self.operator_times
                    .push(FmmOperatorTime::from_duration(FmmOperatorType::P2M, d));
            }
        }

        if operations.contains(FmmOperations::M2M) {
            for level in (UPPER_WORKING_LEVEL..leaf_level).rev() {
                let (_, duration) = optionally_time(timed, || self.m2m(level, &kernel_ptrs));
                if let Some(d) = duration {
                    self.operator_times.push(FmmOperatorTime::from_duration(
                        FmmOperatorType::M2M(level),
                        d,
                    ));
                }
            }
        }

        if operations.contains(FmmOperations::M2L) {
            for level in UPPER_WORKING_LEVEL..=leaf_level {
                let (_, duration) = optionally_time(timed, || self.m2l(level, &kernel_ptrs));
                if let Some(d) = duration {
                    self.operator_times.push(FmmOperatorTime::from_duration(
                        FmmOperatorType::M2L(level),
                        d,
                    ));
                }
            }
        }

        if operations.contains(FmmOperations::L2L) {
            for level in UPPER_WORKING_LEVEL..leaf_level {
                let (_, duration) = optionally_time(timed, || self.l2l(level, &kernel_ptrs));
                if let Some(d) = duration {
                    self.operator_times.push(FmmOperatorTime::from_duration(
                        FmmOperatorType::L2L(level),
                        d,
                    ));
                }
            }
        }

        if operations.contains(FmmOperations::P2P) {
            let (_, duration) = optionally_time(timed, || self.p2p(&kernel_ptrs));
            if let Some(d) = duration {
                self.operator_times
                    .push(FmmOperatorTime::from_duration(FmmOperatorType::P2P, d));
            }
        }

        if operations.contains(FmmOperations::L2P) {
            let (_, duration) = optionally_time(timed, || self.l2p(&kernel_ptrs));
            if let Some(d) = duration {
                self.operator_times
                    .push(FmmOperatorTime::from_duration(FmmOperatorType::L2P, d));
            }
        }

        Ok(())
    }

    fn operator_times(&self) -> &[FmmOperatorTime] {
        &self.operator_times
    }

    fn name(&self) -> &'static str {
        "multi-node"
    }
}
