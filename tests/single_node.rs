//! Cross-engine correctness over full runs.
use approx::assert_relative_eq;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use group_fmm::fmm::helpers::AccuracyChecker;
use group_fmm::fmm::kernel::{CountKernel, ParticleCount};
use group_fmm::traits::kernel::FmmKernel;
use group_fmm::tree::helpers::{charges_fixture, points_fixture};
use group_fmm::tree::types::{CellSymbolic, LeafParticleRefs, LeafParticleRefsMut};
use group_fmm::{Domain, FmmEngine, FmmOperations, GroupedTree, SequentialFmm, TaskParallelFmm};

fn unit_domain() -> Domain<f64> {
    Domain::new([0.5, 0.5, 0.5], 1.0)
}

fn count_tree(
    points: &[[f64; 3]],
    height: usize,
    group_size: usize,
) -> GroupedTree<f64, ParticleCount, ParticleCount> {
    let charges = vec![1.0; points.len()];
    GroupedTree::new(points, &charges, height, unit_domain(), group_size)
}

#[test]
fn test_sequential_counts_every_pair_once() {
    let n_points = 20_000;
    let points = points_fixture::<f64>(n_points, Some(3));
    let mut tree = count_tree(&points, 6, 128);

    SequentialFmm::new(&mut tree, CountKernel::new())
        .execute()
        .unwrap();

    for potential in tree.gather_potentials() {
        assert_eq!(potential as u64, (n_points - 1) as u64);
    }
}

#[test]
fn test_task_parallel_reproduces_sequential() {
    let n_points = 10_000;
    let points = points_fixture::<f64>(n_points, Some(4));

    let mut sequential_tree = count_tree(&points, 6, 100);
    SequentialFmm::new(&mut sequential_tree, CountKernel::new())
        .execute()
        .unwrap();

    let mut parallel_tree = count_tree(&points, 6, 100);
    TaskParallelFmm::new(&mut parallel_tree, CountKernel::new())
        .execute()
        .unwrap();

    assert_eq!(
        sequential_tree.gather_potentials(),
        parallel_tree.gather_potentials()
    );
}

#[test]
fn test_near_and_far_field_masks_compose() {
    let n_points = 5_000;
    let points = points_fixture::<f64>(n_points, Some(5));
    let mut tree = count_tree(&points, 5, 80);

    // Near and far field in two separate runs accumulate onto the same
    // tree; together they must cover every pair exactly once.
    let mut engine = SequentialFmm::new(&mut tree, CountKernel::new());
    engine
        .execute_operations(FmmOperations::NEAR_FIELD)
        .unwrap();
    engine.execute_operations(FmmOperations::FAR_FIELD).unwrap();

    for potential in tree.gather_potentials() {
        assert_eq!(potential as u64, (n_points - 1) as u64);
    }
}

#[test]
fn test_clustered_points_counted_once() {
    // Heavily clustered input exercises sparse levels and uneven blocks.
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let n_points = 4_000;
    let points: Vec<[f64; 3]> = (0..n_points)
        .map(|i| {
            let centre = if i % 2 == 0 { 0.1 } else { 0.9 };
            [
                centre + 0.05 * rng.gen::<f64>(),
                centre + 0.05 * rng.gen::<f64>(),
                centre + 0.05 * rng.gen::<f64>(),
            ]
        })
        .collect();

    let mut tree = count_tree(&points, 6, 64);
    TaskParallelFmm::new(&mut tree, CountKernel::new())
        .execute()
        .unwrap();

    for potential in tree.gather_potentials() {
        assert_eq!(potential as u64, (n_points - 1) as u64);
    }
}

// A gravity-style kernel with single-coefficient expansions: multipoles
// carry total mass at the cell centre, locals a potential value evaluated
// there. Coarse, but enough to bound the engine against a direct sum.
#[derive(Clone)]
struct MonopoleKernel {
    domain: Domain<f64>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Monopole {
    mass: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct FieldValue {
    potential: f64,
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

impl FmmKernel<f64> for MonopoleKernel {
    type Multipole = Monopole;
    type Local = FieldValue;

    fn p2m(
        &mut self,
        multipole: &mut Monopole,
        _cell: &CellSymbolic,
        particles: &LeafParticleRefs<'_, f64>,
    ) {
        multipole.mass += particles.charges.iter().sum::<f64>();
    }

    fn m2m(
        &mut self,
        multipole: &mut Monopole,
        _cell: &CellSymbolic,
        children: &[Option<(&CellSymbolic, &Monopole)>; 8],
    ) {
        for child in children.iter().flatten() {
            multipole.mass += child.1.mass;
        }
    }

    fn m2l(
        &mut self,
        local: &mut FieldValue,
        cell: &CellSymbolic,
        sources: &[(&CellSymbolic, &Monopole)],
        _positions: &[usize],
    ) {
        let target = self.domain.cell_centre(&cell.coordinate, cell.level);
        for (symbolic, multipole) in sources {
            let source = self.domain.cell_centre(&symbolic.coordinate, symbolic.level);
            local.potential += multipole.mass / distance(&target, &source);
        }
    }

    fn l2l(
        &mut self,
        local: &FieldValue,
        _cell: &CellSymbolic,
        children: &mut [Option<(&CellSymbolic, &mut FieldValue)>; 8],
    ) {
        for child in children.iter_mut().flatten() {
            child.1.potential += local.potential;
        }
    }

    fn l2p(
        &mut self,
        local: &FieldValue,
        _cell: &CellSymbolic,
        particles: &mut LeafParticleRefsMut<'_, f64>,
    ) {
        for potential in particles.potentials.iter_mut() {
            *potential += local.potential;
        }
    }

    fn p2p(
        &mut self,
        _cell: &CellSymbolic,
        targets: &mut LeafParticleRefsMut<'_, f64>,
        neighbors: &mut [(&CellSymbolic, LeafParticleRefsMut<'_, f64>)],
        _positions: &[usize],
    ) {
        for (_, neighbor) in neighbors.iter_mut() {
            for i in 0..targets.len() {
                for j in 0..neighbor.len() {
                    let inv = 1.0 / distance(&targets.positions[i], &neighbor.positions[j]);
                    targets.potentials[i] += neighbor.charges[j] * inv;
                    neighbor.potentials[j] += targets.charges[i] * inv;
                }
            }
        }
        for i in 0..targets.len() {
            for j in i + 1..targets.len() {
                let inv = 1.0 / distance(&targets.positions[i], &targets.positions[j]);
                targets.potentials[i] += targets.charges[j] * inv;
                targets.potentials[j] += targets.charges[i] * inv;
            }
        }
    }

    fn p2p_remote(
        &mut self,
        _cell: &CellSymbolic,
        targets: &mut LeafParticleRefsMut<'_, f64>,
        neighbors: &[(&CellSymbolic, LeafParticleRefs<'_, f64>)],
        _positions: &[usize],
    ) {
        for (_, neighbor) in neighbors {
            for i in 0..targets.len() {
                for j in 0..neighbor.len() {
                    targets.potentials[i] += neighbor.charges[j]
                        / distance(&targets.positions[i], &neighbor.positions[j]);
                }
            }
        }
    }
}

fn direct_potentials(points: &[[f64; 3]], charges: &[f64]) -> Vec<f64> {
    let mut potentials = vec![0.0; points.len()];
    for i in 0..points.len() {
        for j in 0..points.len() {
            if i != j {
                potentials[i] += charges[j] / distance(&points[i], &points[j]);
            }
        }
    }
    potentials
}

#[test]
fn test_near_field_matches_direct_sum() {
    // At height 2 every leaf pair is adjacent; the far field is empty and
    // the engine reduces to the direct computation.
    let n_points = 400;
    let points = points_fixture::<f64>(n_points, Some(6));
    let charges = charges_fixture::<f64>(n_points, Some(7));
    let reference = direct_potentials(&points, &charges);

    let mut tree: GroupedTree<f64, Monopole, FieldValue> =
        GroupedTree::new(&points, &charges, 2, unit_domain(), 8);
    SequentialFmm::new(&mut tree, MonopoleKernel { domain: unit_domain() })
        .execute()
        .unwrap();

    for (&computed, &reference) in tree.gather_potentials().iter().zip(&reference) {
        assert_relative_eq!(computed, reference, max_relative = 1e-10);
    }
}

#[test]
fn test_monopole_approximation_bounded() {
    let n_points = 2_000;
    let points = points_fixture::<f64>(n_points, Some(8));
    let charges = charges_fixture::<f64>(n_points, Some(9));
    let reference = direct_potentials(&points, &charges);

    let mut tree: GroupedTree<f64, Monopole, FieldValue> =
        GroupedTree::new(&points, &charges, 4, unit_domain(), 32);
    SequentialFmm::new(&mut tree, MonopoleKernel { domain: unit_domain() })
        .execute()
        .unwrap();

    let mut checker = AccuracyChecker::new();
    checker.add_all(&reference, &tree.gather_potentials());
    // Single-coefficient expansions; only a coarse bound is meaningful.
    assert!(checker.relative_l2() < 0.2, "l2 {}", checker.relative_l2());
}
