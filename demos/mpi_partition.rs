//? mpirun -n {{NPROCESSES}} --features "mpi"

//! Partitioner invariants under a real communicator: particles conserved,
//! shards Morton-sorted and disjoint, no leaf split across ranks, and the
//! discovered left boundary consistent with the gathered rank layout.

#[cfg(feature = "mpi")]
fn main() {
    use group_fmm::tree::helpers::points_fixture;
    use group_fmm::{balanced_partition, Domain, MortonIndex};
    use mpi::{
        collective::SystemOperation,
        traits::{Communicator, CommunicatorCollectives},
    };

    let (universe, _threading) =
        mpi::initialize_with_threading(mpi::Threading::Funneled).unwrap();
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    let n_global = 20_000usize;
    let height = 6;
    let leaf_level = height - 1;

    let points = points_fixture::<f64>(n_global, Some(21));
    let charges = vec![1.0; n_global];
    let chunk = (n_global + size as usize - 1) / size as usize;
    let local_range = (rank as usize * chunk).min(n_global)..((rank as usize + 1) * chunk).min(n_global);
    let local_points = points[local_range.clone()].to_vec();
    let local_charges = charges[local_range].to_vec();

    let domain = Domain::from_global_points(&local_points, &world);
    let shard = balanced_partition(&local_points, &local_charges, height, &domain, &world);

    // Conservation across the exchange.
    let n_shard = shard.positions.len() as u64;
    let mut n_total = 0u64;
    world.all_reduce_into(&n_shard, &mut n_total, SystemOperation::sum());
    assert_eq!(n_total as usize, n_global);
    assert_eq!(shard.positions.len(), shard.charges.len());

    // Shard sorted by leaf index, strictly after the left boundary.
    let mortons: Vec<MortonIndex> = shard
        .positions
        .iter()
        .map(|point| domain.cell_coordinate(point, leaf_level).morton())
        .collect();
    for pair in mortons.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    if let (Some(boundary), Some(&first)) = (shard.left_boundary, mortons.first()) {
        assert!(first > boundary);
    }

    // Rank leaf ranges are disjoint and ordered; with no leaf straddling
    // ranks the comparison is strict.
    let local_span = match (mortons.first(), mortons.last()) {
        (Some(&first), Some(&last)) => [1u64, first.0, last.0],
        _ => [0u64, 0, 0],
    };
    let mut spans = vec![0u64; 3 * size as usize];
    world.all_gather_into(&local_span[..], &mut spans[..]);
    let occupied: Vec<(u64, u64)> = spans
        .chunks_exact(3)
        .filter(|chunk| chunk[0] != 0)
        .map(|chunk| (chunk[1], chunk[2]))
        .collect();
    for pair in occupied.windows(2) {
        assert!(pair[0].1 < pair[1].0);
    }

    // The discovered boundary is the last leaf of the nearest non-empty
    // predecessor.
    let predecessor_last = spans
        .chunks_exact(3)
        .take(rank as usize)
        .filter(|chunk| chunk[0] != 0)
        .map(|chunk| MortonIndex(chunk[2]))
        .last();
    assert_eq!(shard.left_boundary, predecessor_last);

    if rank == 0 {
        println!(
            "mpi_partition: {} ranks, {} particles, shards disjoint and sorted",
            size, n_global
        );
    }
}

#[cfg(not(feature = "mpi"))]
fn main() {}
