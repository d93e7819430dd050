//! Construction of process-local trees over a distributed particle set.
use mpi::{
    collective::SystemOperation,
    traits::{Communicator, CommunicatorCollectives, Equivalence},
};
use num::Float;

use crate::fmm::partition::balanced_partition;
use crate::tree::{domain::Domain, morton::MortonIndex, types::GroupedTree};

impl<T> Domain<T>
where
    T: Float + Default + Equivalence,
{
    /// Compute the box enclosing every rank's points, consistently on all
    /// ranks.
    ///
    /// Collective over `communicator`. Ranks with no points contribute
    /// neutral bounds; if no rank holds points the unit box is returned.
    pub fn from_global_points<C: Communicator>(points: &[[T; 3]], communicator: &C) -> Domain<T> {
        let mut local_min = [T::max_value(); 3];
        let mut local_max = [T::min_value(); 3];
        for point in points {
            for d in 0..3 {
                local_min[d] = local_min[d].min(point[d]);
                local_max[d] = local_max[d].max(point[d]);
            }
        }

        let mut global_min = [T::zero(); 3];
        let mut global_max = [T::zero(); 3];
        communicator.all_reduce_into(
            &local_min[..],
            &mut global_min[..],
            SystemOperation::min(),
        );
        communicator.all_reduce_into(
            &local_max[..],
            &mut global_max[..],
            SystemOperation::max(),
        );

        if global_min[0] > global_max[0] {
            return Domain {
                origin: [T::zero(); 3],
                width: T::one(),
            };
        }

        let mut width = T::zero();
        for d in 0..3 {
            width = width.max(global_max[d] - global_min[d]);
        }
        let margin = T::from(1.0 + 1e-5).unwrap();
        let width = if width > T::zero() {
            width * margin
        } else {
            T::one()
        };
        Domain {
            origin: global_min,
            width,
        }
    }
}

impl<T, M, L> GroupedTree<T, M, L>
where
    T: Float + Default + Equivalence,
    M: Default + Clone,
    L: Default + Clone,
{
    /// Build the local part of a tree over a globally distributed particle
    /// set.
    ///
    /// Collective over `communicator`: particles are redistributed into
    /// balanced contiguous Morton ranges, then a local tree is built whose
    /// blocks never span the ownership boundary. Returns the tree together
    /// with the last leaf of the predecessor rank, which the distributed
    /// engine needs to resolve boundary-cell ownership.
    pub fn from_distributed<C: Communicator>(
        points: &[[T; 3]],
        charges: &[T],
        height: usize,
        domain: Domain<T>,
        group_size: usize,
        communicator: &C,
    ) -> (Self, Option<MortonIndex>) {
        let shard = balanced_partition(points, charges, height, &domain, communicator);
        let tree = Self::with_left_boundary(
            &shard.positions,
            &shard.charges,
            height,
            domain,
            group_size,
            shard.left_boundary,
        );
        (tree, shard.left_boundary)
    }
}
