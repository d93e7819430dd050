//! Construction of and queries over block-structured octrees.
use itertools::Itertools;
use num::Float;

use crate::tree::{
    constants::MAX_HEIGHT,
    domain::Domain,
    morton::MortonIndex,
    types::{BlockInfo, CellGroup, CellSymbolic, GroupedTree, LeafParticleRefs, ParticleGroup},
};

// Split a sorted run of cell indices into blocks of at most `group_size`,
// additionally cutting after `boundary` so that no block spans cells on both
// sides of an ownership boundary.
fn split_blocks(
    mortons: &[MortonIndex],
    group_size: usize,
    boundary: Option<MortonIndex>,
) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for i in 0..mortons.len() {
        let filled = i + 1 - start == group_size;
        let crossing = match boundary {
            Some(boundary) => {
                i + 1 < mortons.len() && mortons[i] <= boundary && mortons[i + 1] > boundary
            }
            None => false,
        };
        if filled || crossing || i + 1 == mortons.len() {
            ranges.push(start..i + 1);
            start = i + 1;
        }
    }
    ranges
}

fn make_cell_group<M, L>(level: usize, mortons: &[MortonIndex]) -> CellGroup<M, L>
where
    M: Default + Clone,
    L: Default + Clone,
{
    let symbolics = mortons
        .iter()
        .map(|&morton| CellSymbolic {
            morton,
            coordinate: morton.coordinate(),
            level,
        })
        .collect_vec();
    CellGroup {
        level,
        range_start: mortons[0],
        range_end: mortons[mortons.len() - 1],
        multipoles: vec![M::default(); mortons.len()],
        locals: vec![L::default(); mortons.len()],
        symbolics,
    }
}

impl<T, M, L> GroupedTree<T, M, L>
where
    T: Float + Default,
    M: Default + Clone,
    L: Default + Clone,
{
    /// Build a tree over the given particles.
    ///
    /// Particles are sorted by the Morton index of their enclosing leaf,
    /// leaves are packed into blocks of at most `group_size`, and interior
    /// levels are derived bottom-up from the leaf partition. Empty input
    /// yields a valid tree over which every pass completes as a no-op.
    ///
    /// # Panics
    /// If `height` is outside `2..=21`, `group_size` is zero, or the number
    /// of positions and charges differ.
    pub fn new(
        points: &[[T; 3]],
        charges: &[T],
        height: usize,
        domain: Domain<T>,
        group_size: usize,
    ) -> Self {
        Self::with_left_boundary(points, charges, height, domain, group_size, None)
    }

    /// Build a tree whose blocks additionally never span `left_boundary`.
    ///
    /// `left_boundary` is the Morton index of the last leaf held by the
    /// preceding process in a distributed run. At every level, the cut keeps
    /// cells on the ancestor chain of the boundary separate from cells owned
    /// by this process, so block-level ownership stays unambiguous.
    pub fn with_left_boundary(
        points: &[[T; 3]],
        charges: &[T],
        height: usize,
        domain: Domain<T>,
        group_size: usize,
        left_boundary: Option<MortonIndex>,
    ) -> Self {
        assert!(
            (2..=MAX_HEIGHT).contains(&height),
            "tree height must be in 2..={}",
            MAX_HEIGHT
        );
        assert!(group_size > 0, "group size must be positive");
        assert_eq!(
            points.len(),
            charges.len(),
            "one charge required per particle"
        );

        let leaf_level = height - 1;

        // Sort particles by leaf index, ties by input order.
        let mut indexed = points
            .iter()
            .enumerate()
            .map(|(i, point)| (domain.cell_coordinate(point, leaf_level).morton(), i))
            .collect_vec();
        indexed.sort();

        // Contiguous runs of equal leaf index.
        let mut leaf_mortons = Vec::new();
        let mut leaf_bounds = vec![0];
        for (i, &(morton, _)) in indexed.iter().enumerate() {
            if leaf_mortons.last() != Some(&morton) {
                if i > 0 {
                    leaf_bounds.push(i);
                }
                leaf_mortons.push(morton);
            }
        }
        leaf_bounds.push(indexed.len());

        let mut levels: Vec<Vec<CellGroup<M, L>>> = vec![Vec::new(); height];
        let mut particle_groups = Vec::new();

        let boundary_at = |level: usize| {
            left_boundary.map(|boundary| boundary.ancestor(leaf_level - level))
        };

        // Leaf level blocks together with their particle data.
        for range in split_blocks(&leaf_mortons, group_size, boundary_at(leaf_level)) {
            let block_mortons = &leaf_mortons[range.clone()];
            levels[leaf_level].push(make_cell_group(leaf_level, block_mortons));

            let particles = &indexed[leaf_bounds[range.start]..leaf_bounds[range.end]];
            let mut group = ParticleGroup {
                leaf_mortons: block_mortons.to_vec(),
                leaf_offsets: Vec::with_capacity(block_mortons.len() + 1),
                positions: Vec::with_capacity(particles.len()),
                charges: Vec::with_capacity(particles.len()),
                potentials: vec![T::zero(); particles.len()],
                forces: vec![[T::zero(); 3]; particles.len()],
                global_indices: Vec::with_capacity(particles.len()),
            };
            let base = leaf_bounds[range.start];
            for leaf in range.clone() {
                group.leaf_offsets.push(leaf_bounds[leaf] - base);
            }
            group.leaf_offsets.push(particles.len());
            for &(_, original) in particles {
                group.positions.push(points[original]);
                group.charges.push(charges[original]);
                group.global_indices.push(original);
            }
            particle_groups.push(group);
        }

        // Interior levels hold exactly the ancestors of the leaves.
        let mut child_mortons = leaf_mortons;
        for level in (0..leaf_level).rev() {
            let parent_mortons = child_mortons
                .iter()
                .map(|morton| morton.parent())
                .dedup()
                .collect_vec();
            for range in split_blocks(&parent_mortons, group_size, boundary_at(level)) {
                levels[level].push(make_cell_group(level, &parent_mortons[range]));
            }
            child_mortons = parent_mortons;
        }

        GroupedTree {
            height,
            domain,
            group_size,
            levels,
            particle_groups,
        }
    }

    /// The leaf level, `height - 1`.
    pub fn leaf_level(&self) -> usize {
        self.height - 1
    }

    /// Total number of particles stored.
    pub fn n_particles(&self) -> usize {
        self.particle_groups
            .iter()
            .map(|group| group.n_particles())
            .sum()
    }

    /// Number of cells at a level.
    pub fn n_cells(&self, level: usize) -> usize {
        self.levels[level].iter().map(|group| group.n_cells()).sum()
    }

    /// Cell blocks at a level, in Morton order.
    pub fn cell_groups(&self, level: usize) -> &[CellGroup<M, L>] {
        &self.levels[level]
    }

    /// Locate a cell, returning its block and in-block position.
    pub fn find_cell(&self, level: usize, morton: MortonIndex) -> Option<(usize, usize)> {
        let groups = &self.levels[level];
        let block = groups
            .partition_point(|group| group.range_end < morton)
            .min(groups.len().saturating_sub(1));
        let group = groups.get(block)?;
        if !group.covers(morton) {
            return None;
        }
        group.cell_index(morton).map(|index| (block, index))
    }

    /// Borrow the pieces of a cell, `None` if absent.
    pub fn cell(&self, level: usize, morton: MortonIndex) -> Option<(&CellSymbolic, &M, &L)> {
        let (block, index) = self.find_cell(level, morton)?;
        let group = &self.levels[level][block];
        Some((
            &group.symbolics[index],
            &group.multipoles[index],
            &group.locals[index],
        ))
    }

    /// Visit every cell of one level in Morton order.
    pub fn for_each_cell_with_level(
        &self,
        level: usize,
        mut f: impl FnMut(&CellSymbolic, &M, &L),
    ) {
        for group in &self.levels[level] {
            for i in 0..group.n_cells() {
                f(&group.symbolics[i], &group.multipoles[i], &group.locals[i]);
            }
        }
    }

    /// Visit every cell of every level, coarse levels first.
    pub fn for_each_cell(&self, mut f: impl FnMut(&CellSymbolic, &M, &L)) {
        for level in 0..self.height {
            self.for_each_cell_with_level(level, &mut f);
        }
    }

    /// Visit every leaf together with its particle data, in Morton order.
    pub fn for_each_leaf(
        &self,
        mut f: impl FnMut(&CellSymbolic, &M, &L, LeafParticleRefs<'_, T>),
    ) {
        let leaf_level = self.leaf_level();
        for (group, particles) in self.levels[leaf_level].iter().zip(&self.particle_groups) {
            for i in 0..group.n_cells() {
                f(
                    &group.symbolics[i],
                    &group.multipoles[i],
                    &group.locals[i],
                    particles.leaf_particles(i),
                );
            }
        }
    }

    /// Accumulated potentials reordered to the original input order.
    pub fn gather_potentials(&self) -> Vec<T> {
        let mut potentials = vec![T::zero(); self.n_particles()];
        for group in &self.particle_groups {
            for (&original, &potential) in group.global_indices.iter().zip(&group.potentials) {
                potentials[original] = potential;
            }
        }
        potentials
    }

    /// Per-level block statistics.
    pub fn block_info(&self) -> Vec<BlockInfo> {
        (0..self.height)
            .map(|level| {
                let sizes = self.levels[level].iter().map(|group| group.n_cells());
                BlockInfo {
                    level,
                    n_blocks: self.levels[level].len(),
                    n_cells: sizes.clone().sum(),
                    min_cells: sizes.clone().min().unwrap_or(0),
                    max_cells: sizes.max().unwrap_or(0),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::helpers::points_fixture;

    type Tree = GroupedTree<f64, u64, u64>;

    fn uniform_tree(n_points: usize, height: usize, group_size: usize) -> Tree {
        let points = points_fixture::<f64>(n_points, Some(0));
        let charges = vec![1.0; n_points];
        let domain = Domain::new([0.5, 0.5, 0.5], 1.0);
        Tree::new(&points, &charges, height, domain, group_size)
    }

    #[test]
    fn test_particles_conserved_and_sorted() {
        let n_points = 5000;
        let tree = uniform_tree(n_points, 5, 100);
        assert_eq!(tree.n_particles(), n_points);

        let mut seen = vec![false; n_points];
        let mut previous = None;
        tree.for_each_leaf(|symbolic, _, _, particles| {
            assert!(!particles.is_empty());
            assert_eq!(symbolic.level, tree.leaf_level());
            if let Some(previous) = previous {
                assert!(previous < symbolic.morton);
            }
            previous = Some(symbolic.morton);
            for &index in particles.global_indices {
                assert!(!seen[index]);
                seen[index] = true;
            }
        });
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_block_structure() {
        let group_size = 64;
        let tree = uniform_tree(4000, 5, group_size);
        for level in 0..tree.height {
            let groups = tree.cell_groups(level);
            for pair in groups.windows(2) {
                assert!(pair[0].range_end < pair[1].range_start);
            }
            for group in groups {
                assert!(group.n_cells() <= group_size);
                assert_eq!(group.range_start, group.symbolics[0].morton);
                assert_eq!(
                    group.range_end,
                    group.symbolics[group.n_cells() - 1].morton
                );
            }
        }
        // Leaf blocks pair off with particle blocks.
        let leaf_groups = tree.cell_groups(tree.leaf_level());
        assert_eq!(leaf_groups.len(), tree.particle_groups.len());
        for (cells, particles) in leaf_groups.iter().zip(&tree.particle_groups) {
            assert_eq!(cells.n_cells(), particles.n_leaves());
            for (symbolic, &morton) in cells.symbolics.iter().zip(&particles.leaf_mortons) {
                assert_eq!(symbolic.morton, morton);
            }
        }
    }

    #[test]
    fn test_parent_closure() {
        let tree = uniform_tree(2000, 5, 50);
        for level in 1..tree.height {
            tree.for_each_cell_with_level(level, |symbolic, _, _| {
                assert!(tree.find_cell(level - 1, symbolic.morton.parent()).is_some());
            });
        }
        // Root present whenever particles are.
        assert_eq!(tree.n_cells(0), 1);
    }

    #[test]
    fn test_find_cell_absent() {
        let points = vec![[0.1f64, 0.1, 0.1], [0.9, 0.9, 0.9]];
        let charges = vec![1.0, 1.0];
        let domain = Domain::new([0.5, 0.5, 0.5], 1.0);
        let tree = Tree::new(&points, &charges, 4, domain, 10);

        assert_eq!(tree.n_cells(tree.leaf_level()), 2);
        let present = tree.cell_groups(tree.leaf_level())[0].range_start;
        assert!(tree.cell(tree.leaf_level(), present).is_some());
        assert!(tree.cell(tree.leaf_level(), MortonIndex(1)).is_none());
    }

    #[test]
    fn test_empty_tree() {
        let tree = Tree::new(&[], &[], 4, Domain::new([0.5, 0.5, 0.5], 1.0), 10);
        assert_eq!(tree.n_particles(), 0);
        for level in 0..tree.height {
            assert_eq!(tree.n_cells(level), 0);
        }
        tree.for_each_leaf(|_, _, _, _| panic!("no leaves expected"));
        assert!(tree.gather_potentials().is_empty());
    }

    #[test]
    fn test_single_particle() {
        let points = vec![[0.2f64, 0.3, 0.4]];
        let charges = vec![1.0];
        let tree = Tree::new(&points, &charges, 5, Domain::new([0.5, 0.5, 0.5], 1.0), 10);
        for level in 0..tree.height {
            assert_eq!(tree.n_cells(level), 1);
        }
    }

    #[test]
    fn test_left_boundary_cut() {
        let n_points = 3000;
        let points = points_fixture::<f64>(n_points, Some(1));
        let charges = vec![1.0; n_points];
        let domain = Domain::new([0.5, 0.5, 0.5], 1.0);
        let height = 5;

        // Use the median leaf of an unsplit tree as the boundary.
        let reference = Tree::new(&points, &charges, height, domain, 100);
        let mut leaves = Vec::new();
        reference.for_each_leaf(|symbolic, _, _, _| leaves.push(symbolic.morton));
        let boundary = leaves[leaves.len() / 2];

        let tree = Tree::with_left_boundary(
            &points,
            &charges,
            height,
            domain,
            100,
            Some(boundary),
        );
        let leaf_level = tree.leaf_level();
        for level in 0..tree.height {
            let level_boundary = boundary.ancestor(leaf_level - level);
            for group in tree.cell_groups(level) {
                // No block spans the ownership boundary.
                assert!(
                    group.range_end <= level_boundary || group.range_start > level_boundary
                );
            }
        }
    }

    #[test]
    fn test_block_info() {
        let tree = uniform_tree(1000, 4, 32);
        let info = tree.block_info();
        assert_eq!(info.len(), tree.height);
        for entry in &info {
            assert_eq!(entry.n_cells, tree.n_cells(entry.level));
            assert!(entry.max_cells <= 32);
            assert!(!format!("{entry}").is_empty());
        }
    }

    #[test]
    #[should_panic(expected = "tree height")]
    fn test_invalid_height() {
        let _ = Tree::new(&[], &[], 1, Domain::new([0.5, 0.5, 0.5], 1.0), 10);
    }
}
