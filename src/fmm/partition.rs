//! Particle-count balanced redistribution over an MPI communicator.
//!
//! Particles are bucketed by a global Morton-sorted rank: after a local sort
//! and a global exclusive scan, particle `g` of `n` lands on rank
//! `g * size / n`, so every process holds a contiguous Morton range of
//! nearly equal particle count. A fix-up ring then moves the leading run of
//! any leaf spanning a rank boundary onto the predecessor, so no leaf is
//! ever split across processes.
//!
//! Ownership of cells shared across a rank boundary is centralized here:
//! the boundary cell at every level is the ancestor of the predecessor's
//! last leaf, and the predecessor owns it. [`owned_interval`] encodes the
//! rule once for all engine call sites.
use itertools::Itertools;
use mpi::{
    collective::SystemOperation,
    datatype::{Partition, PartitionMut},
    traits::{Communicator, CommunicatorCollectives, Destination, Equivalence, Source},
    Count,
};
use num::Float;

use crate::tree::{domain::Domain, morton::MortonIndex};

/// Morton range of cells a process computes at one level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkingInterval {
    /// Tree level the interval applies to.
    pub level: usize,

    /// First owned cell index, inclusive.
    pub first: MortonIndex,

    /// Last owned cell index, inclusive.
    pub last: MortonIndex,
}

impl WorkingInterval {
    /// Whether a cell index falls in the interval.
    pub fn contains(&self, morton: MortonIndex) -> bool {
        self.first <= morton && morton <= self.last
    }
}

/// The interval of cells this process owns at `level`.
///
/// `local_span` is the first and last cell held locally at that level,
/// `left_boundary` the last leaf of the predecessor rank. The cell on the
/// boundary's ancestor chain is held by both neighbors but owned by the
/// predecessor; everything strictly after it is owned here. Cell indices at
/// a level are dense, so the successor of the boundary cell is its index
/// plus one.
pub fn owned_interval(
    left_boundary: Option<MortonIndex>,
    local_span: Option<(MortonIndex, MortonIndex)>,
    leaf_level: usize,
    level: usize,
) -> Option<WorkingInterval> {
    let (first, last) = local_span?;
    let first = match left_boundary {
        Some(boundary) => {
            let boundary = boundary.ancestor(leaf_level - level);
            if last <= boundary {
                return None;
            }
            first.max(MortonIndex(boundary.0 + 1))
        }
        None => first,
    };
    Some(WorkingInterval { level, first, last })
}

/// Rank a globally Morton-sorted particle is assigned to.
fn target_rank(global_index: u64, n_total: u64, size: u64) -> u64 {
    (global_index * size / n_total).min(size - 1)
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect_vec()
}

// All-to-all with per-rank counts; returns the received values together
// with how many came from each rank.
pub(crate) fn exchange_varcount<B, C>(
    values: &[B],
    counts_snd: &[Count],
    communicator: &C,
) -> (Vec<B>, Vec<Count>)
where
    B: Equivalence + Default + Clone,
    C: Communicator,
{
    let size = communicator.size() as usize;
    let mut counts_recv = vec![0 as Count; size];
    communicator.all_to_all_into(counts_snd, &mut counts_recv);

    let displs_snd = displacements(counts_snd);
    let displs_recv = displacements(&counts_recv);
    let total = counts_recv.iter().sum::<Count>();

    let mut received = vec![B::default(); total as usize];
    let partition_snd = Partition::new(values, counts_snd, &displs_snd[..]);
    let mut partition_recv =
        PartitionMut::new(&mut received[..], &counts_recv[..], &displs_recv[..]);
    communicator.all_to_all_varcount_into(&partition_snd, &mut partition_recv);

    (received, counts_recv)
}

/// A process-local shard of the global particle set after redistribution.
pub struct PartitionedParticles<T> {
    /// Positions held by this process, Morton-sorted by leaf.
    pub positions: Vec<[T; 3]>,

    /// Charges, parallel to `positions`.
    pub charges: Vec<T>,

    /// Last leaf index of the predecessor rank, `None` on the first
    /// non-empty prefix of the communicator.
    pub left_boundary: Option<MortonIndex>,
}

// Boundary discovery ring: every rank learns its predecessor's last
// occupied leaf. Empty ranks forward the value, so the chain skips them.
// Receive from the predecessor strictly before sending to the successor.
fn discover_left_boundary<C: Communicator>(
    communicator: &C,
    local_last: Option<u64>,
    rank: i32,
    size: i32,
) -> Option<MortonIndex> {
    let left = if rank > 0 {
        let (message, _status) = communicator.process_at_rank(rank - 1).receive_vec::<u64>();
        (message[0] != 0).then_some(message[1])
    } else {
        None
    };
    if rank < size - 1 {
        let forward = local_last.or(left);
        let message = [forward.is_some() as u64, forward.unwrap_or(0)];
        communicator.process_at_rank(rank + 1).send(&message[..]);
    }
    left.map(MortonIndex)
}

/// Redistribute particles so each process holds a contiguous, particle-count
/// balanced Morton range of whole leaves.
///
/// Collective over `communicator`; every rank must call with its local
/// shard. The union of the returned shards equals the union of the inputs,
/// each shard is sorted by leaf index, and no leaf's particles straddle two
/// ranks.
pub fn balanced_partition<T, C>(
    points: &[[T; 3]],
    charges: &[T],
    height: usize,
    domain: &Domain<T>,
    communicator: &C,
) -> PartitionedParticles<T>
where
    T: Float + Default + Equivalence,
    C: Communicator,
{
    assert_eq!(
        points.len(),
        charges.len(),
        "one charge required per particle"
    );
    let rank = communicator.rank();
    let size = communicator.size();
    let leaf_level = height - 1;

    // Local sort by leaf index.
    let mut indexed = points
        .iter()
        .enumerate()
        .map(|(i, point)| (domain.cell_coordinate(point, leaf_level).morton().0, i))
        .collect_vec();
    indexed.sort_unstable();

    // Global offset of the local run within the Morton-sorted whole.
    let n_local = indexed.len() as u64;
    let mut n_total = 0u64;
    communicator.all_reduce_into(&n_local, &mut n_total, SystemOperation::sum());
    let mut offset = 0u64;
    communicator.exclusive_scan_into(&n_local, &mut offset, SystemOperation::sum());
    if rank == 0 {
        offset = 0;
    }

    // Bucket counts by destination rank; local data is sorted, so
    // destinations are non-decreasing and the buckets contiguous.
    let mut counts_snd = vec![0 as Count; size as usize];
    for i in 0..indexed.len() {
        let destination = target_rank(offset + i as u64, n_total, size as u64);
        counts_snd[destination as usize] += 1;
    }
    let counts_coords = counts_snd.iter().map(|&c| 3 * c).collect_vec();

    let send_mortons = indexed.iter().map(|&(morton, _)| morton).collect_vec();
    let mut send_coords = Vec::with_capacity(3 * indexed.len());
    let mut send_charges = Vec::with_capacity(indexed.len());
    for &(_, original) in &indexed {
        send_coords.extend_from_slice(&points[original]);
        send_charges.push(charges[original]);
    }

    let (mut mortons, _) = exchange_varcount(&send_mortons, &counts_snd, communicator);
    let (received_coords, _) = exchange_varcount(&send_coords, &counts_coords, communicator);
    let (received_charges, _) = exchange_varcount(&send_charges, &counts_snd, communicator);

    // Re-sort the received shard by leaf index.
    let mut order = (0..mortons.len()).collect_vec();
    order.sort_unstable_by_key(|&i| mortons[i]);
    mortons = order.iter().map(|&i| mortons[i]).collect_vec();
    let mut positions = order
        .iter()
        .map(|&i| {
            [
                received_coords[3 * i],
                received_coords[3 * i + 1],
                received_coords[3 * i + 2],
            ]
        })
        .collect_vec();
    let mut shard_charges = order.iter().map(|&i| received_charges[i]).collect_vec();

    // Fix-up ring: while any leaf straddles a rank boundary, move its
    // leading run onto the predecessor. A leaf spanning k ranks converges
    // in k - 1 rounds.
    let mut left_boundary;
    loop {
        left_boundary = discover_left_boundary(communicator, mortons.last().copied(), rank, size);

        let n_move = match left_boundary {
            Some(boundary) => mortons.iter().take_while(|&&m| m == boundary.0).count(),
            None => 0,
        };

        // Send the leading run left, then collect any run arriving from
        // the successor; the chain resolves right to left.
        if rank > 0 {
            let predecessor = communicator.process_at_rank(rank - 1);
            predecessor.send(&mortons[..n_move]);
            let mut coords = Vec::with_capacity(3 * n_move);
            for position in &positions[..n_move] {
                coords.extend_from_slice(position);
            }
            predecessor.send(&coords[..]);
            predecessor.send(&shard_charges[..n_move]);
        }
        if rank < size - 1 {
            let successor = communicator.process_at_rank(rank + 1);
            let (arrived_mortons, _) = successor.receive_vec::<u64>();
            let (arrived_coords, _) = successor.receive_vec::<T>();
            let (arrived_charges, _) = successor.receive_vec::<T>();
            mortons.extend_from_slice(&arrived_mortons);
            positions.extend(
                arrived_coords
                    .chunks_exact(3)
                    .map(|chunk| [chunk[0], chunk[1], chunk[2]]),
            );
            shard_charges.extend_from_slice(&arrived_charges);
        }
        if n_move > 0 {
            mortons.drain(..n_move);
            positions.drain(..n_move);
            shard_charges.drain(..n_move);
        }

        let mut any_moved = 0i32;
        communicator.all_reduce_into(
            &((n_move > 0) as i32),
            &mut any_moved,
            SystemOperation::max(),
        );
        if any_moved == 0 {
            break;
        }
    }

    PartitionedParticles {
        positions,
        charges: shard_charges,
        left_boundary,
    }
}
