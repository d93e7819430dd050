//! Morton indices, index coordinates and index-space neighborhood queries.
//!
//! A cell at level `l` is identified by a Morton index of `3 * l` bits,
//! obtained by interleaving the bits of its integer coordinate along each
//! axis. The index does not carry its level; callers track levels explicitly.
use crate::tree::constants::{MAX_HEIGHT, N_CHILDREN};

/// Morton (Z-order) index of a cell at a known level.
///
/// Siblings share all but the last three bits, the parent is obtained by a
/// right shift of three, so indices at one level are ordered consistently
/// with the order of their ancestors at every coarser level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MortonIndex(pub u64);

/// Integer coordinate of a cell at a known level, each component in
/// `[0, 2^level)`. Bijective with [`MortonIndex`] at that level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TreeCoordinate {
    /// Coordinate along x.
    pub x: i64,
    /// Coordinate along y.
    pub y: i64,
    /// Coordinate along z.
    pub z: i64,
}

// Spread the lower 21 bits of `v` so that bit i lands at position 3 * i.
fn spread(v: u64) -> u64 {
    let mut x = v & 0x1f_ffff;
    x = (x | x << 32) & 0x1f00000000ffff;
    x = (x | x << 16) & 0x1f0000ff0000ff;
    x = (x | x << 8) & 0x100f00f00f00f00f;
    x = (x | x << 4) & 0x10c30c30c30c30c3;
    x = (x | x << 2) & 0x1249249249249249;
    x
}

// Inverse of `spread`.
fn compact(v: u64) -> u64 {
    let mut x = v & 0x1249249249249249;
    x = (x ^ (x >> 2)) & 0x10c30c30c30c30c3;
    x = (x ^ (x >> 4)) & 0x100f00f00f00f00f;
    x = (x ^ (x >> 8)) & 0x1f0000ff0000ff;
    x = (x ^ (x >> 16)) & 0x1f00000000ffff;
    x = (x ^ (x >> 32)) & 0x1f_ffff;
    x
}

impl MortonIndex {
    /// Index of the root cell.
    pub const fn root() -> Self {
        MortonIndex(0)
    }

    /// Index of the parent cell, one level coarser.
    pub fn parent(&self) -> MortonIndex {
        MortonIndex(self.0 >> 3)
    }

    /// Ancestor `generations` levels coarser.
    pub fn ancestor(&self, generations: usize) -> MortonIndex {
        MortonIndex(self.0 >> (3 * generations))
    }

    /// Index of the child in the given octant, one level finer.
    pub fn child(&self, octant: usize) -> MortonIndex {
        debug_assert!(octant < N_CHILDREN);
        MortonIndex((self.0 << 3) | octant as u64)
    }

    /// Indices of all eight children, in Morton order.
    pub fn children(&self) -> [MortonIndex; N_CHILDREN] {
        core::array::from_fn(|octant| self.child(octant))
    }

    /// Octant of this cell within its parent.
    pub fn octant(&self) -> usize {
        (self.0 & 7) as usize
    }

    /// Decode into an integer coordinate.
    pub fn coordinate(&self) -> TreeCoordinate {
        TreeCoordinate {
            x: compact(self.0 >> 2) as i64,
            y: compact(self.0 >> 1) as i64,
            z: compact(self.0) as i64,
        }
    }
}

impl TreeCoordinate {
    /// Create a coordinate from its components.
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        TreeCoordinate { x, y, z }
    }

    /// Encode into a Morton index.
    pub fn morton(&self) -> MortonIndex {
        MortonIndex(spread(self.x as u64) << 2 | spread(self.y as u64) << 1 | spread(self.z as u64))
    }

    /// Coordinate of the parent cell, one level coarser.
    pub fn parent(&self) -> TreeCoordinate {
        TreeCoordinate::new(self.x >> 1, self.y >> 1, self.z >> 1)
    }

    /// Coordinate translated by the given offset, possibly outside the tree.
    pub fn shifted(&self, dx: i64, dy: i64, dz: i64) -> TreeCoordinate {
        TreeCoordinate::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// Whether each component lies in `[0, 2^level)`.
    pub fn is_valid(&self, level: usize) -> bool {
        debug_assert!(level <= MAX_HEIGHT);
        let bound = 1i64 << level;
        (0..bound).contains(&self.x) && (0..bound).contains(&self.y) && (0..bound).contains(&self.z)
    }

    /// Colour class of this cell under the mod-3 colouring of index space.
    ///
    /// Two cells of the same colour differ by at least three in some axis, so
    /// they are never adjacent and never share an adjacent neighbor. Mutual
    /// near-field updates within one colour class are therefore free of write
    /// conflicts.
    pub fn shape_index(&self) -> usize {
        (((self.x % 3) * 3 + (self.y % 3)) * 3 + (self.z % 3)) as usize
    }
}

/// Adjacent neighbors of a cell, paired with their position tag.
///
/// Returns up to 26 `(index, position)` entries in offset enumeration order.
/// Positions number the 3x3x3 offset cube linearly with the centre removed,
/// so they lie in `0..=25`. Offsets falling outside the tree bounds are
/// dropped, there is no wraparound.
pub fn leaf_neighbors(coord: &TreeCoordinate, level: usize) -> Vec<(MortonIndex, usize)> {
    let mut neighbors = Vec::with_capacity(26);
    for dx in -1i64..=1 {
        for dy in -1i64..=1 {
            for dz in -1i64..=1 {
                if dx == 0 && dy == 0 && dz == 0 {
                    continue;
                }
                let other = coord.shifted(dx, dy, dz);
                if !other.is_valid(level) {
                    continue;
                }
                let raw = ((dx + 1) * 9 + (dy + 1) * 3 + (dz + 1)) as usize;
                let position = if raw < 13 { raw } else { raw - 1 };
                neighbors.push((other.morton(), position));
            }
        }
    }
    neighbors
}

/// Far-field interaction list of a cell, paired with position tags.
///
/// Sources are the children of the parent's adjacent neighbors (the cell's
/// siblings included) that are not themselves within `separation` cells of
/// the target in every axis. Positions tag the relative offset in the
/// 7x7x7 scheme, `((dx + 3) * 7 + (dy + 3)) * 7 + (dz + 3)`. At separation
/// criterion 1 the list holds at most 189 entries.
pub fn interaction_neighbors(
    coord: &TreeCoordinate,
    level: usize,
    separation: usize,
) -> Vec<(MortonIndex, usize)> {
    if level == 0 {
        return Vec::new();
    }
    let separation = separation as i64;
    let parent = coord.parent();
    let mut sources = Vec::with_capacity(189);
    for dx in -1i64..=1 {
        for dy in -1i64..=1 {
            for dz in -1i64..=1 {
                let other_parent = parent.shifted(dx, dy, dz);
                if !other_parent.is_valid(level - 1) {
                    continue;
                }
                for octant in 0..N_CHILDREN {
                    let child = TreeCoordinate::new(
                        other_parent.x * 2 + (octant as i64 >> 2 & 1),
                        other_parent.y * 2 + (octant as i64 >> 1 & 1),
                        other_parent.z * 2 + (octant as i64 & 1),
                    );
                    let rel = (child.x - coord.x, child.y - coord.y, child.z - coord.z);
                    if rel.0.abs() <= separation && rel.1.abs() <= separation && rel.2.abs() <= separation
                    {
                        continue;
                    }
                    let position = (((rel.0 + 3) * 7 + (rel.1 + 3)) * 7 + (rel.2 + 3)) as usize;
                    sources.push((child.morton(), position));
                }
            }
        }
    }
    sources
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tree::constants::{N_INTERACTIONS, N_NEIGHBORS};
    use std::collections::HashSet;

    #[test]
    fn test_encode_decode_roundtrip() {
        for level in [1usize, 3, 10, 21] {
            let bound = 1i64 << level.min(7);
            for x in (0..bound).step_by(3) {
                for y in (0..bound).step_by(5) {
                    let coord = TreeCoordinate::new(x, y, bound - 1);
                    assert!(coord.is_valid(level));
                    assert_eq!(coord.morton().coordinate(), coord);
                }
            }
        }
    }

    #[test]
    fn test_parent_child_relations() {
        let coord = TreeCoordinate::new(5, 3, 7);
        let index = coord.morton();
        for (octant, child) in index.children().iter().enumerate() {
            assert_eq!(child.parent(), index);
            assert_eq!(child.octant(), octant);
            let child_coord = child.coordinate();
            assert_eq!(child_coord.parent(), coord);
        }
        assert_eq!(index.ancestor(3), index.parent().parent().parent());
    }

    #[test]
    fn test_morton_order_preserved_by_ancestors() {
        let a = TreeCoordinate::new(1, 2, 3).morton();
        let b = TreeCoordinate::new(4, 0, 1).morton();
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert!(lo.parent() <= hi.parent());
    }

    #[test]
    fn test_leaf_neighbors_interior() {
        let level = 4;
        let neighbors = leaf_neighbors(&TreeCoordinate::new(7, 7, 7), level);
        assert_eq!(neighbors.len(), N_NEIGHBORS);
        let positions: HashSet<_> = neighbors.iter().map(|&(_, p)| p).collect();
        assert_eq!(positions.len(), N_NEIGHBORS);
        assert!(positions.iter().all(|&p| p < 26));
    }

    #[test]
    fn test_leaf_neighbors_corner_no_wraparound() {
        let level = 4;
        let neighbors = leaf_neighbors(&TreeCoordinate::new(0, 0, 0), level);
        assert_eq!(neighbors.len(), 7);
        for (index, _) in neighbors {
            let c = index.coordinate();
            assert!(c.is_valid(level));
            assert!(c.x <= 1 && c.y <= 1 && c.z <= 1);
        }
    }

    #[test]
    fn test_interaction_neighbors_interior() {
        let level = 4;
        let coord = TreeCoordinate::new(8, 8, 8);
        let list = interaction_neighbors(&coord, level, 1);
        assert_eq!(list.len(), N_INTERACTIONS);

        // No source within the near field, all within the parent halo.
        for (index, position) in &list {
            let c = index.coordinate();
            let rel = (c.x - coord.x, c.y - coord.y, c.z - coord.z);
            assert!(rel.0.abs() > 1 || rel.1.abs() > 1 || rel.2.abs() > 1);
            assert!(rel.0.abs() <= 3 && rel.1.abs() <= 3 && rel.2.abs() <= 3);
            assert_eq!(
                *position,
                (((rel.0 + 3) * 7 + (rel.1 + 3)) * 7 + (rel.2 + 3)) as usize
            );
        }
        let positions: HashSet<_> = list.iter().map(|&(_, p)| p).collect();
        assert_eq!(positions.len(), list.len());
    }

    #[test]
    fn test_interaction_neighbors_wider_separation() {
        let level = 5;
        let coord = TreeCoordinate::new(16, 16, 16);
        let near = interaction_neighbors(&coord, level, 2);
        let standard = interaction_neighbors(&coord, level, 1);
        assert!(near.len() < standard.len());
        for (index, _) in near {
            let c = index.coordinate();
            assert!(
                (c.x - coord.x).abs() > 2 || (c.y - coord.y).abs() > 2 || (c.z - coord.z).abs() > 2
            );
        }
    }

    #[test]
    fn test_interaction_neighbors_boundary() {
        let level = 3;
        let list = interaction_neighbors(&TreeCoordinate::new(0, 0, 0), level, 1);
        assert!(!list.is_empty());
        for (index, _) in list {
            assert!(index.coordinate().is_valid(level));
        }
    }

    #[test]
    fn test_shape_index_separation() {
        let a = TreeCoordinate::new(3, 6, 9);
        let b = TreeCoordinate::new(6, 3, 12);
        assert_eq!(a.shape_index(), b.shape_index());
        // Same-colour cells are at least three apart in some axis.
        assert!((a.x - b.x).abs() >= 3 || (a.y - b.y).abs() >= 3 || (a.z - b.z).abs() >= 3);
        assert!(TreeCoordinate::new(0, 0, 0).shape_index() < 27);
    }
}
