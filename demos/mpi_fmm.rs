//? mpirun -n {{NPROCESSES}} --features "mpi"

//! Distributed run checked against a single-process reference.
//!
//! Every rank draws the same global point set and contributes a slice of
//! it; after the distributed run, every particle's interaction counter
//! must equal N - 1 and the potentials gathered at rank 0 must match a
//! sequential run over the full set, particle for particle.

#[cfg(feature = "mpi")]
fn main() {
    use std::collections::HashMap;

    use group_fmm::fmm::kernel::{CountKernel, ParticleCount};
    use group_fmm::tree::constants::UPPER_WORKING_LEVEL;
    use group_fmm::tree::helpers::points_fixture;
    use group_fmm::{Domain, FmmEngine, GroupedTree, MultiNodeFmm, SequentialFmm};
    use mpi::{
        datatype::PartitionMut,
        traits::{Communicator, Root},
        Count,
    };

    let (universe, _threading) =
        mpi::initialize_with_threading(mpi::Threading::Funneled).unwrap();
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    let n_global = 10_000usize;
    let height = 5;
    let group_size = 64;
    let leaf_level = height - 1;

    let points = points_fixture::<f64>(n_global, Some(12));
    let charges = vec![1.0; n_global];
    let chunk = (n_global + size as usize - 1) / size as usize;
    let local_range = (rank as usize * chunk).min(n_global)..((rank as usize + 1) * chunk).min(n_global);
    let local_points = points[local_range.clone()].to_vec();
    let local_charges = charges[local_range].to_vec();

    let domain = Domain::from_global_points(&local_points, &world);
    let (mut tree, left_boundary) =
        GroupedTree::<f64, ParticleCount, ParticleCount>::from_distributed(
            &local_points,
            &local_charges,
            height,
            domain,
            group_size,
            &world,
        );

    let mut engine = MultiNodeFmm::new(&world, &mut tree, CountKernel::new(), left_boundary);
    engine.execute().unwrap();

    // The end-of-level hook fired once per level on every worker clone.
    let expected_levels: Vec<usize> = (UPPER_WORKING_LEVEL..=leaf_level).collect();
    for kernel in engine.kernels() {
        assert_eq!(kernel.finished_levels, expected_levels);
    }

    // Every particle interacted with all others exactly once.
    let mut local_coords: Vec<f64> = Vec::new();
    let mut local_potentials: Vec<f64> = Vec::new();
    tree.for_each_leaf(|_, _, _, particles| {
        for position in particles.positions {
            local_coords.extend_from_slice(position);
        }
        for &potential in particles.potentials {
            local_potentials.push(potential);
        }
    });
    for &potential in &local_potentials {
        assert_eq!(potential as u64, (n_global - 1) as u64);
    }

    // Gather positions and potentials at rank 0 and compare against the
    // sequential engine over the full set.
    let root_process = world.process_at_rank(0);
    let n_local = local_potentials.len() as Count;

    if rank == 0 {
        let mut counts = vec![0 as Count; size as usize];
        root_process.gather_into_root(&n_local, &mut counts[..]);
        let total: Count = counts.iter().sum();
        assert_eq!(total as usize, n_global);

        let displacements: Vec<Count> = counts
            .iter()
            .scan(0, |acc, &x| {
                let tmp = *acc;
                *acc += x;
                Some(tmp)
            })
            .collect();
        let mut all_potentials = vec![0f64; total as usize];
        let mut partition =
            PartitionMut::new(&mut all_potentials[..], &counts[..], &displacements[..]);
        root_process.gather_varcount_into_root(&local_potentials[..], &mut partition);

        let coord_counts: Vec<Count> = counts.iter().map(|&c| 3 * c).collect();
        let coord_displacements: Vec<Count> = displacements.iter().map(|&d| 3 * d).collect();
        let mut all_coords = vec![0f64; 3 * total as usize];
        let mut partition = PartitionMut::new(
            &mut all_coords[..],
            &coord_counts[..],
            &coord_displacements[..],
        );
        root_process.gather_varcount_into_root(&local_coords[..], &mut partition);

        let mut reference_tree: GroupedTree<f64, ParticleCount, ParticleCount> =
            GroupedTree::new(&points, &charges, height, domain, group_size);
        SequentialFmm::new(&mut reference_tree, CountKernel::new())
            .execute()
            .unwrap();
        let reference = reference_tree.gather_potentials();

        let mut expected = HashMap::new();
        for (point, &potential) in points.iter().zip(&reference) {
            let key = [point[0].to_bits(), point[1].to_bits(), point[2].to_bits()];
            expected.insert(key, potential);
        }
        for (chunk, &found) in all_coords.chunks_exact(3).zip(&all_potentials) {
            let key = [chunk[0].to_bits(), chunk[1].to_bits(), chunk[2].to_bits()];
            assert_eq!(found, expected[&key]);
        }

        println!(
            "mpi_fmm: {} ranks, {} particles, distributed run matches sequential",
            size, n_global
        );
    } else {
        root_process.gather_into(&n_local);
        root_process.gather_varcount_into(&local_potentials[..]);
        root_process.gather_varcount_into(&local_coords[..]);
    }
}

#[cfg(not(feature = "mpi"))]
fn main() {}
