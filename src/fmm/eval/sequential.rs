//! Single-threaded reference engine.
use num::Float;

use crate::fmm::eval::{gather_child_locals, gather_child_multipoles};
use crate::fmm::helpers::optionally_time;
use crate::fmm::types::{CellRefTables, LeafRefTables};
use crate::traits::{
    fmm::FmmEngine,
    kernel::FmmKernel,
    types::{FmmError, FmmOperations, FmmOperatorTime, FmmOperatorType},
};
use crate::tree::{
    constants::UPPER_WORKING_LEVEL,
    morton::{interaction_neighbors, leaf_neighbors},
    types::GroupedTree,
};

/// Runs all five passes in order on a single thread.
///
/// Serves as the reference for the parallel engines: the operator
/// application order is deterministic, and near-field pairs are assigned to
/// the pair member with the smaller Morton index exactly as in the parallel
/// engines, so results agree bit-for-bit wherever kernel arithmetic is
/// order-independent.
pub struct SequentialFmm<'a, T, K>
where
    T: Float,
    K: FmmKernel<T>,
{
    tree: &'a mut GroupedTree<T, K::Multipole, K::Local>,
    kernel: K,
    cells: CellRefTables<K::Multipole, K::Local>,
    leaves: LeafRefTables<T>,
    leaf_separation_criterion: usize,
    timed: bool,
    operator_times: Vec<FmmOperatorTime>,
}

impl<'a, T, K> SequentialFmm<'a, T, K>
where
    T: Float + Default,
    K: FmmKernel<T>,
{
    /// Create an engine over a built tree.
    pub fn new(tree: &'a mut GroupedTree<T, K::Multipole, K::Local>, kernel: K) -> Self {
        let cells = CellRefTables::new(tree);
        let leaves = LeafRefTables::new(tree);
        Self {
            tree,
            kernel,
            cells,
            leaves,
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

    /// The kernel driven by this engine.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    fn p2m(&mut self) {
        let leaf_level = self.tree.leaf_level();
        for flat in 0..self.cells.n_cells(leaf_level) {
            let symbolic = unsafe { &*self.cells.symbolics[leaf_level][flat].raw };
            let multipole = unsafe { &mut *self.cells.multipoles[leaf_level][flat].raw };
            let particles = unsafe { self.leaves.views[flat].as_refs() };
            self.kernel.p2m(multipole, symbolic, &particles);
        }
    }

    fn m2m(&mut self, level: usize) {
        for flat in 0..self.cells.n_cells(level) {
            let symbolic = unsafe { &*self.cells.symbolics[level][flat].raw };
            let multipole = unsafe { &mut *self.cells.multipoles[level][flat].raw };
            let children = gather_child_multipoles(&self.cells, level + 1, symbolic.morton);
            self.kernel.m2m(multipole, symbolic, &children);
        }
    }

    fn m2l(&mut self, level: usize) {
        let criterion = if level == self.tree.leaf_level() {
            self.leaf_separation_criterion
        } else {
            1
        };
        for flat in 0..self.cells.n_cells(level) {
            let symbolic = unsafe { &*self.cells.symbolics[level][flat].raw };
            let local = unsafe { &mut *self.cells.locals[level][flat].raw };
            let mut sources = Vec::new();
            let mut positions = Vec::new();
            for (morton, position) in interaction_neighbors(&symbolic.coordinate, level, criterion)
            {
                if let Some(source) = self.cells.find(level, morton) {
                    sources.push(unsafe {
                        (
                            &*self.cells.symbolics[level][source].raw,
                            &*self.cells.multipoles[level][source].raw,
                        )
                    });
                    positions.push(position);
                }
            }
            if !sources.is_empty() {
                self.kernel.m2l(local, symbolic, &sources, &positions);
            }
        }
        self.kernel.finished_level_m2l(level);
    }

    fn l2l(&mut self, level: usize) {
        for flat in 0..self.cells.n_cells(level) {
            let symbolic = unsafe { &*self.cells.symbolics[level][flat].raw };
            let local = unsafe { &*self.cells.locals[level][flat].raw };
            let mut children = gather_child_locals(&self.cells, level + 1, symbolic.morton);
            self.kernel.l2l(local, symbolic, &mut children);
        }
    }

    fn p2p(&mut self) {
        let leaf_level = self.tree.leaf_level();
        for flat in 0..self.leaves.n_leaves() {
            let symbolic = unsafe { &*self.cells.symbolics[leaf_level][flat].raw };
            let mut targets = unsafe { self.leaves.views[flat].as_refs_mut() };
            let mut neighbors = Vec::new();
            let mut positions = Vec::new();
            for (morton, position) in leaf_neighbors(&symbolic.coordinate, leaf_level) {
                // The smaller member of each pair applies the mutual update.
                if morton <= symbolic.morton {
                    continue;
                }
                if let Some(neighbor) = self.leaves.find(morton) {
                    neighbors.push((
                        unsafe { &*self.cells.symbolics[leaf_level][neighbor].raw },
                        unsafe { self.leaves.views[neighbor].as_refs_mut() },
                    ));
                    positions.push(position);
                }
            }
            self.kernel
                .p2p(symbolic, &mut targets, &mut neighbors, &positions);
        }
    }

    fn l2p(&mut self) {
        let leaf_level = self.tree.leaf_level();
        for flat in 0..self.leaves.n_leaves() {
            let symbolic = unsafe { &*self.cells.symbolics[leaf_level][flat].raw };
            let local = unsafe { &*self.cells.locals[leaf_level][flat].raw };
            let mut particles = unsafe { self.leaves.views[flat].as_refs_mut() };
            self.kernel.l2p(local, symbolic, &mut particles);
        }
    }
}

impl<T, K> FmmEngine for SequentialFmm<'_, T, K>
where
    T: Float + Default,
    K: FmmKernel<T>,
{
    fn execute_operations(&mut self, operations: FmmOperations) -> Result<(), FmmError> {
        self.operator_times.clear();
        let leaf_level = self.tree.leaf_level();
        let timed = self.timed;

        if operations.contains(FmmOperations::P2M) {
            let (_, duration) = optionally_time(timed, || self.p2m());
            if let Some(d) = duration {
                self.operator_times
                    .push(FmmOperatorTime::from_duration(FmmOperatorType::P2M, d));
            }
        }

        if operations.contains(FmmOperations::M2M) {
            for level in (UPPER_WORKING_LEVEL..leaf_level).rev() {
                let (_, duration) = optionally_time(timed, || self.m2m(level));
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
                let (_, duration) = optionally_time(timed, || self.m2l(level));
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
                let (_, duration) = optionally_time(timed, || self.l2l(level));
                if let Some(d) = duration {
                    self.operator_times.push(FmmOperatorTime::from_duration(
                        FmmOperatorType::L2L(level),
                        d,
                    ));
                }
            }
        }

        if operations.contains(FmmOperations::P2P) {
            let (_, duration) = optionally_time(timed, || self.p2p());
            if let Some(d) = duration {
                self.operator_times
                    .push(FmmOperatorTime::from_duration(FmmOperatorType::P2P, d));
            }
        }

        if operations.contains(FmmOperations::L2P) {
            let (_, duration) = optionally_time(timed, || self.l2p());
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
        "sequential"
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fmm::kernel::{CountKernel, ParticleCount};
    use crate::tree::{domain::Domain, helpers::points_fixture};

    fn count_tree(
        n_points: usize,
        height: usize,
        group_size: usize,
    ) -> GroupedTree<f64, ParticleCount, ParticleCount> {
        let points = points_fixture::<f64>(n_points, Some(0));
        let charges = vec![1.0; n_points];
        GroupedTree::new(
            &points,
            &charges,
            height,
            Domain::new([0.5, 0.5, 0.5], 1.0),
            group_size,
        )
    }

    #[test]
    fn test_all_interactions_counted_once() {
        let n_points = 2000;
        let mut tree = count_tree(n_points, 5, 60);
        let mut engine = SequentialFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();

        tree.for_each_leaf(|_, multipole, _, particles| {
            assert_eq!(multipole.value, particles.len() as u64);
            for &potential in particles.potentials {
                assert_eq!(potential as u64, (n_points - 1) as u64);
            }
        });
    }

    #[test]
    fn test_multipoles_count_enclosed_particles() {
        let mut tree = count_tree(1500, 4, 40);
        let mut engine = SequentialFmm::new(&mut tree, CountKernel::new());
        engine
            .execute_operations(FmmOperations::P2M | FmmOperations::M2M)
            .unwrap();

        // Every cell's multipole holds the particle count of its subtree.
        for level in crate::tree::constants::UPPER_WORKING_LEVEL..tree.height {
            let mut total = 0;
            tree.for_each_cell_with_level(level, |_, multipole, _| total += multipole.value);
            assert_eq!(total, tree.n_particles() as u64);
        }
    }

    #[test]
    fn test_level_hook_fires_in_order() {
        let mut tree = count_tree(500, 5, 30);
        let mut engine = SequentialFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();
        assert_eq!(engine.kernel().finished_levels, vec![2, 3, 4]);
    }

    #[test]
    fn test_near_field_only_two_levels() {
        // With height 2 every pair of leaves is adjacent, the far field is
        // empty and the direct pass alone accounts for all interactions.
        let n_points = 300;
        let mut tree = count_tree(n_points, 2, 10);
        let mut engine = SequentialFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();
        tree.for_each_leaf(|_, _, _, particles| {
            for &potential in particles.potentials {
                assert_eq!(potential as u64, (n_points - 1) as u64);
            }
        });
    }

    #[test]
    fn test_empty_tree_executes() {
        let mut tree: GroupedTree<f64, ParticleCount, ParticleCount> = GroupedTree::new(
            &[],
            &[],
            4,
            Domain::new([0.5, 0.5, 0.5], 1.0),
            10,
        );
        let mut engine = SequentialFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();
    }

    #[test]
    fn test_single_particle() {
        let points = vec![[0.3f64, 0.4, 0.5]];
        let charges = vec![1.0];
        let mut tree: GroupedTree<f64, ParticleCount, ParticleCount> =
            GroupedTree::new(&points, &charges, 4, Domain::new([0.5, 0.5, 0.5], 1.0), 10);
        let mut engine = SequentialFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();
        tree.for_each_leaf(|_, _, _, particles| {
            assert_eq!(particles.potentials[0], 0.0);
        });
    }

    #[test]
    fn test_operator_times_recorded() {
        let mut tree = count_tree(400, 4, 20);
        let leaf_level = tree.leaf_level();
        let mut engine = SequentialFmm::new(&mut tree, CountKernel::new()).timed(true);
        engine.execute().unwrap();
        let times = engine.operator_times();
        assert!(times.iter().any(|t| t.operator == FmmOperatorType::P2M));
        assert!(times
            .iter()
            .any(|t| t.operator == FmmOperatorType::M2L(leaf_level)));
    }

    #[test]
    #[should_panic(expected = "separation criterion")]
    fn test_invalid_separation_criterion() {
        let mut tree = count_tree(10, 3, 10);
        let _ = SequentialFmm::new(&mut tree, CountKernel::new())
            .with_leaf_separation_criterion(3);
    }
}
