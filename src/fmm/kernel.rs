//! An interaction-counting kernel used to validate engine traversal.
//!
//! Every operator forwards particle counts instead of field values: a
//! multipole expansion holds the number of particles a cell encloses, a
//! local expansion the number of far-field particles accumulated so far.
//! After a complete run over N particles, every particle's potential must
//! equal exactly N - 1, which checks that each pairwise interaction is
//! accounted for exactly once across the five passes.
#[cfg(feature = "mpi")]
use mpi::traits::Equivalence;
use num::Float;

use crate::traits::kernel::FmmKernel;
use crate::tree::types::{CellSymbolic, LeafParticleRefs, LeafParticleRefsMut};

/// Expansion payload of the counting kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "mpi", derive(Equivalence))]
pub struct ParticleCount {
    /// Number of particles accounted for.
    pub value: u64,
}

/// Counts interactions instead of evaluating a field.
#[derive(Clone, Debug, Default)]
pub struct CountKernel {
    /// Levels for which the end-of-level hook has fired, in call order.
    pub finished_levels: Vec<usize>,
}

impl CountKernel {
    /// A fresh counting kernel.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> FmmKernel<T> for CountKernel
where
    T: Float + Send + Sync,
{
    type Multipole = ParticleCount;
    type Local = ParticleCount;

    fn p2m(
        &mut self,
        multipole: &mut ParticleCount,
        _cell: &CellSymbolic,
        particles: &LeafParticleRefs<'_, T>,
    ) {
        multipole.value += particles.len() as u64;
    }

    fn m2m(
        &mut self,
        multipole: &mut ParticleCount,
        _cell: &CellSymbolic,
        children: &[Option<(&CellSymbolic, &ParticleCount)>; 8],
    ) {
        for child in children.iter().flatten() {
            multipole.value += child.1.value;
        }
    }

    fn m2l(
        &mut self,
        local: &mut ParticleCount,
        _cell: &CellSymbolic,
        sources: &[(&CellSymbolic, &ParticleCount)],
        positions: &[usize],
    ) {
        debug_assert_eq!(sources.len(), positions.len());
        for source in sources {
            local.value += source.1.value;
        }
    }

    fn finished_level_m2l(&mut self, level: usize) {
        self.finished_levels.push(level);
    }

    fn l2l(
        &mut self,
        local: &ParticleCount,
        _cell: &CellSymbolic,
        children: &mut [Option<(&CellSymbolic, &mut ParticleCount)>; 8],
    ) {
        for child in children.iter_mut().flatten() {
            child.1.value += local.value;
        }
    }

    fn l2p(
        &mut self,
        local: &ParticleCount,
        _cell: &CellSymbolic,
        particles: &mut LeafParticleRefsMut<'_, T>,
    ) {
        let contribution = T::from(local.value).unwrap();
        for potential in particles.potentials.iter_mut() {
            *potential = *potential + contribution;
        }
    }

    fn p2p(
        &mut self,
        _cell: &CellSymbolic,
        targets: &mut LeafParticleRefsMut<'_, T>,
        neighbors: &mut [(&CellSymbolic, LeafParticleRefsMut<'_, T>)],
        positions: &[usize],
    ) {
        debug_assert_eq!(neighbors.len(), positions.len());
        let n_targets = targets.len();
        for (_, neighbor) in neighbors.iter_mut() {
            let n_neighbor = T::from(neighbor.len()).unwrap();
            for potential in targets.potentials.iter_mut() {
                *potential = *potential + n_neighbor;
            }
            let n_targets = T::from(n_targets).unwrap();
            for potential in neighbor.potentials.iter_mut() {
                *potential = *potential + n_targets;
            }
        }
        // Interactions of the target leaf with itself.
        let inner = T::from(n_targets - 1).unwrap();
        for potential in targets.potentials.iter_mut() {
            *potential = *potential + inner;
        }
    }

    fn p2p_remote(
        &mut self,
        _cell: &CellSymbolic,
        targets: &mut LeafParticleRefsMut<'_, T>,
        neighbors: &[(&CellSymbolic, LeafParticleRefs<'_, T>)],
        positions: &[usize],
    ) {
        debug_assert_eq!(neighbors.len(), positions.len());
        for (_, neighbor) in neighbors {
            let n_neighbor = T::from(neighbor.len()).unwrap();
            for potential in targets.potentials.iter_mut() {
                *potential = *potential + n_neighbor;
            }
        }
    }
}
