//! Shared-memory engine driven by a block-level task graph.
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use num::Float;

use crate::fmm::eval::{gather_child_locals, gather_child_multipoles, worker_kernel};
use crate::fmm::helpers::optionally_time;
use crate::fmm::tasks::{DataRef, TaskGraph};
use crate::fmm::types::{CellRefTables, LeafRefTables, SendPtrMut};
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

/// Executes the passes as one task per (pass, block) on the rayon pool.
///
/// Tasks declare the blocks they read and write; the task graph serializes
/// conflicting tasks and lets everything else overlap, so near-field work
/// runs concurrently with the upward and transfer passes. Each worker owns
/// a private clone of the kernel, identified by its rayon thread index, so
/// kernels are never shared across threads.
///
/// Block topology, operator application per cell and the near-field pair
/// assignment match the sequential engine, results agree exactly wherever
/// kernel arithmetic is order-independent.
pub struct TaskParallelFmm<'a, T, K>
where
    T: Float,
    K: FmmKernel<T>,
{
    tree: &'a mut GroupedTree<T, K::Multipole, K::Local>,
    kernels: Vec<K>,
    cells: CellRefTables<K::Multipole, K::Local>,
    leaves: LeafRefTables<T>,
    leaf_separation_criterion: usize,
    timed: bool,
    operator_times: Vec<FmmOperatorTime>,
}

impl<'a, T, K> TaskParallelFmm<'a, T, K>
where
    T: Float + Default + Send + Sync,
    K: FmmKernel<T> + Sync,
    K::Multipole: Send + Sync,
    K::Local: Send + Sync,
{
    /// Create an engine over a built tree, cloning one kernel per worker.
    pub fn new(tree: &'a mut GroupedTree<T, K::Multipole, K::Local>, kernel: K) -> Self {
        let cells = CellRefTables::new(tree);
        let leaves = LeafRefTables::new(tree);
        let kernels = (0..rayon::current_num_threads())
            .map(|_| kernel.clone())
            .collect();
        Self {
            tree,
            kernels,
            cells,
            leaves,
            leaf_separation_criterion: 1,
            timed: false,
            operator_times: Vec::new(),
        }
    }

    /// Enable per-phase timing.
    ///
    /// Operators interleave inside one task graph, so only the near-field
    /// and far-field phases are attributable; a timed run executes them as
    /// separate graphs, giving up their overlap.
    pub fn timed(mut self, timed: bool) -> Self {
        self.timed = timed;
        self
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

    /// The tree this engine evaluates over.
    pub fn tree(&self) -> &GroupedTree<T, K::Multipole, K::Local> {
        self.tree
    }

    /// The per-worker kernel clones.
    pub fn kernels(&self) -> &[K] {
        &self.kernels
    }

    fn run_graph(&mut self, operations: FmmOperations) {
        let leaf_level = self.tree.leaf_level();
        let leaf_criterion = self.leaf_separation_criterion;

        let kernel_ptrs: Vec<SendPtrMut<K>> = self
            .kernels
            .iter_mut()
            .map(|kernel| SendPtrMut { raw: kernel as *mut K })
            .collect();
        // End-of-level hook progress per worker, advanced lazily by the
        // worker itself before it starts transfer work of a finer level.
        let progress: Vec<AtomicUsize> = kernel_ptrs
            .iter()
            .map(|_| AtomicUsize::new(UPPER_WORKING_LEVEL))
            .collect();

        let cells = &self.cells;
        let leaves = &self.leaves;
        let kernel_ptrs = &kernel_ptrs;
        let progress = &progress;

        let mut graph = TaskGraph::new();

        if operations.contains(FmmOperations::P2M) {
            for block in 0..leaves.n_blocks() {
                graph.add_task(
                    &[DataRef::Particles { block }],
                    &[DataRef::Multipole {
                        level: leaf_level,
                        block,
                    }],
                    move || {
                        let kernel = worker_kernel(kernel_ptrs);
                        for flat in leaves.block_range(block) {
                            let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
                            let multipole_ptr = cells.multipoles[leaf_level][flat].raw;
                            let multipole = unsafe { &mut *multipole_ptr };
                            let particles = unsafe { leaves.views[flat].as_refs() };
                            kernel.p2m(multipole, symbolic, &particles);
                        }
                    },
                );
            }
        }

        if operations.contains(FmmOperations::P2P) {
            for block in 0..leaves.n_blocks() {
                let mut writes = vec![DataRef::Particles { block }];
                let mut touched = BTreeSet::new();
                for flat in leaves.block_range(block) {
                    let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
                    for (morton, _) in leaf_neighbors(&symbolic.coordinate, leaf_level) {
                        if morton <= symbolic.morton {
                            continue;
                        }
                        if let Some(neighbor) = leaves.find(morton) {
                            touched.insert(leaves.block_of(neighbor));
                        }
                    }
                }
                touched.remove(&block);
                writes.extend(touched.into_iter().map(|block| DataRef::Particles { block }));

                graph.add_task(&[], &writes, move || {
                    let kernel = worker_kernel(kernel_ptrs);
                    for flat in leaves.block_range(block) {
                        let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
                        let mut targets = unsafe { leaves.views[flat].as_refs_mut() };
                        let mut neighbors = Vec::new();
                        let mut positions = Vec::new();
                        for (morton, position) in
                            leaf_neighbors(&symbolic.coordinate, leaf_level)
                        {
                            // The smaller member of each pair applies the
                            // mutual update.
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
                    }
                });
            }
        }

        if operations.contains(FmmOperations::M2M) {
            for level in (UPPER_WORKING_LEVEL..leaf_level).rev() {
                for block in 0..cells.n_blocks(level) {
                    let range = cells.block_range(level, block);
                    let first = cells.mortons[level][range.start];
                    let last = cells.mortons[level][range.end - 1];
                    let reads: Vec<DataRef> = cells
                        .blocks_in_range(level + 1, first.child(0), last.child(7))
                        .map(|child_block| DataRef::Multipole {
                            level: level + 1,
                            block: child_block,
                        })
                        .collect();

                    graph.add_task(
                        &reads,
                        &[DataRef::Multipole { level, block }],
                        move || {
                            let kernel = worker_kernel(kernel_ptrs);
                            for flat in cells.block_range(level, block) {
                                let symbolic = unsafe { &*cells.symbolics[level][flat].raw };
                                let multipole_ptr = cells.multipoles[level][flat].raw;
                                let multipole = unsafe { &mut *multipole_ptr };
                                let children =
                                    gather_child_multipoles(cells, level + 1, symbolic.morton);
                                kernel.m2m(multipole, symbolic, &children);
                            }
                        },
                    );
                }
            }
        }

        if operations.contains(FmmOperations::M2L) {
            for level in UPPER_WORKING_LEVEL..=leaf_level {
                let criterion = if level == leaf_level { leaf_criterion } else { 1 };
                for block in 0..cells.n_blocks(level) {
                    let mut reads = vec![DataRef::M2lEpoch { level }];
                    let mut sources = BTreeSet::new();
                    for flat in cells.block_range(level, block) {
                        let symbolic = unsafe { &*cells.symbolics[level][flat].raw };
                        for (morton, _) in
                            interaction_neighbors(&symbolic.coordinate, level, criterion)
                        {
                            if let Some(source) = cells.find(level, morton) {
                                sources.insert(cells.block_of(level, source));
                            }
                        }
                    }
                    reads.extend(
                        sources
                            .into_iter()
                            .map(|block| DataRef::Multipole { level, block }),
                    );

                    graph.add_task(&reads, &[DataRef::Local { level, block }], move || {
                        let worker = rayon::current_thread_index().unwrap_or(0);
                        let kernel = worker_kernel(kernel_ptrs);
                        // Close out coarser levels on this worker's kernel;
                        // the epoch barrier guarantees their transfer work
                        // has completed.
                        let done = progress[worker].load(Ordering::Relaxed);
                        for finished in done..level {
                            kernel.finished_level_m2l(finished);
                        }
                        progress[worker].store(level.max(done), Ordering::Relaxed);

                        for flat in cells.block_range(level, block) {
                            let symbolic = unsafe { &*cells.symbolics[level][flat].raw };
                            let local_ptr = cells.locals[level][flat].raw;
                            let local = unsafe { &mut *local_ptr };
                            let mut sources = Vec::new();
                            let mut positions = Vec::new();
                            for (morton, position) in
                                interaction_neighbors(&symbolic.coordinate, level, criterion)
                            {
                                if let Some(source) = cells.find(level, morton) {
                                    sources.push(unsafe {
                                        (
                                            &*cells.symbolics[level][source].raw,
                                            &*cells.multipoles[level][source].raw,
                                        )
                                    });
                                    positions.push(position);
                                }
                            }
                            if !sources.is_empty() {
                                kernel.m2l(local, symbolic, &sources, &positions);
                            }
                        }
                    });
                }

                // Close the level: runs after all transfer work above, and
                // gates the transfer work of the next finer level.
                graph.add_task(
                    &[],
                    &[
                        DataRef::M2lEpoch { level },
                        DataRef::M2lEpoch { level: level + 1 },
                    ],
                    || {},
                );
            }
        }

        if operations.contains(FmmOperations::L2L) {
            for level in UPPER_WORKING_LEVEL..leaf_level {
                for block in 0..cells.n_blocks(level) {
                    let range = cells.block_range(level, block);
                    let first = cells.mortons[level][range.start];
                    let last = cells.mortons[level][range.end - 1];
                    let writes: Vec<DataRef> = cells
                        .blocks_in_range(level + 1, first.child(0), last.child(7))
                        .map(|child_block| DataRef::Local {
                            level: level + 1,
                            block: child_block,
                        })
                        .collect();

                    graph.add_task(&[DataRef::Local { level, block }], &writes, move || {
                        let kernel = worker_kernel(kernel_ptrs);
                        for flat in cells.block_range(level, block) {
                            let symbolic = unsafe { &*cells.symbolics[level][flat].raw };
                            let local = unsafe { &*cells.locals[level][flat].raw };
                            let mut children =
                                gather_child_locals(cells, level + 1, symbolic.morton);
                            kernel.l2l(local, symbolic, &mut children);
                        }
                    });
                }
            }
        }

        if operations.contains(FmmOperations::L2P) {
            for block in 0..leaves.n_blocks() {
                graph.add_task(
                    &[DataRef::Local {
                        level: leaf_level,
                        block,
                    }],
                    &[DataRef::Particles { block }],
                    move || {
                        let kernel = worker_kernel(kernel_ptrs);
                        for flat in leaves.block_range(block) {
                            let symbolic = unsafe { &*cells.symbolics[leaf_level][flat].raw };
                            let local = unsafe { &*cells.locals[leaf_level][flat].raw };
                            let mut particles = unsafe { leaves.views[flat].as_refs_mut() };
                            kernel.l2p(local, symbolic, &mut particles);
                        }
                    },
                );
            }
        }

        graph.execute();

        if operations.contains(FmmOperations::M2L) {
            // Close out remaining levels on workers that ran no transfer
            // task at the finest levels.
            for (kernel, progress) in self.kernels.iter_mut().zip(progress.iter()) {
                for level in progress.load(Ordering::Relaxed)..=leaf_level {
                    kernel.finished_level_m2l(level);
                }
            }
        }
    }
}

impl<T, K> FmmEngine for TaskParallelFmm<'_, T, K>
where
    T: Float + Default + Send + Sync,
    K: FmmKernel<T> + Sync,
    K::Multipole: Send + Sync,
    K::Local: Send + Sync,
{
    fn execute_operations(&mut self, operations: FmmOperations) -> Result<(), FmmError> {
        self.operator_times.clear();
        if !self.timed {
            self.run_graph(operations);
            return Ok(());
        }

        // Timed runs execute the near and far field as separate graphs so
        // each phase's elapsed time is attributable to it.
        for (phase, operator) in [
            (operations & FmmOperations::NEAR_FIELD, FmmOperatorType::NearField),
            (operations & FmmOperations::FAR_FIELD, FmmOperatorType::FarField),
        ] {
            if phase.is_empty() {
                continue;
            }
            let (_, duration) = optionally_time(true, || self.run_graph(phase));
            if let Some(d) = duration {
                self.operator_times
                    .push(FmmOperatorTime::from_duration(operator, d));
            }
        }
        Ok(())
    }

    fn operator_times(&self) -> &[FmmOperatorTime] {
        &self.operator_times
    }

    fn name(&self) -> &'static str {
        "task-parallel"
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fmm::eval::sequential::SequentialFmm;
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
        let n_points = 3000;
        let mut tree = count_tree(n_points, 5, 50);
        let mut engine = TaskParallelFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();

        tree.for_each_leaf(|_, multipole, _, particles| {
            assert_eq!(multipole.value, particles.len() as u64);
            for &potential in particles.potentials {
                assert_eq!(potential as u64, (n_points - 1) as u64);
            }
        });
    }

    #[test]
    fn test_matches_sequential_engine() {
        let n_points = 2500;
        let mut parallel_tree = count_tree(n_points, 5, 40);
        let mut sequential_tree = count_tree(n_points, 5, 40);

        TaskParallelFmm::new(&mut parallel_tree, CountKernel::new())
            .execute()
            .unwrap();
        SequentialFmm::new(&mut sequential_tree, CountKernel::new())
            .execute()
            .unwrap();

        assert_eq!(
            parallel_tree.gather_potentials(),
            sequential_tree.gather_potentials()
        );
    }

    #[test]
    fn test_level_hook_once_per_level_per_worker() {
        let mut tree = count_tree(1000, 5, 30);
        let leaf_level = tree.leaf_level();
        let mut engine = TaskParallelFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();

        let expected: Vec<usize> = (UPPER_WORKING_LEVEL..=leaf_level).collect();
        for kernel in engine.kernels() {
            assert_eq!(kernel.finished_levels, expected);
        }
    }

    #[test]
    fn test_near_field_only_run() {
        let n_points = 800;
        let mut tree = count_tree(n_points, 4, 25);
        let mut engine = TaskParallelFmm::new(&mut tree, CountKernel::new());
        engine
            .execute_operations(FmmOperations::NEAR_FIELD)
            .unwrap();
        // Multipoles untouched without the far field.
        tree.for_each_cell(|_, multipole, _| assert_eq!(multipole.value, 0));
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
        let mut engine = TaskParallelFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();
    }

    #[test]
    fn test_timed_run_records_phase_times() {
        let n_points = 1200;
        let mut tree = count_tree(n_points, 5, 40);
        let mut engine = TaskParallelFmm::new(&mut tree, CountKernel::new()).timed(true);
        engine.execute().unwrap();

        let times = engine.operator_times();
        assert!(times
            .iter()
            .any(|t| t.operator == FmmOperatorType::NearField));
        assert!(times
            .iter()
            .any(|t| t.operator == FmmOperatorType::FarField));

        // The phase split changes scheduling, not results.
        tree.for_each_leaf(|_, _, _, particles| {
            for &potential in particles.potentials {
                assert_eq!(potential as u64, (n_points - 1) as u64);
            }
        });
    }

    #[test]
    fn test_repeated_execution_accumulates() {
        let n_points = 600;
        let mut tree = count_tree(n_points, 4, 20);
        let mut engine = TaskParallelFmm::new(&mut tree, CountKernel::new());
        engine.execute().unwrap();
        engine.execute().unwrap();
        engine.tree().for_each_leaf(|_, _, _, particles| {
            for &potential in particles.potentials {
                assert_eq!(potential as u64, 2 * (n_points - 1) as u64);
            }
        });
    }
}
