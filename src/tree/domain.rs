//! Physical simulation box and point to index-space mapping.
use num::Float;

use crate::tree::morton::TreeCoordinate;

/// A cubic simulation box characterized by its origin and side length.
#[derive(Debug, Clone, Copy, Default)]
pub struct Domain<T>
where
    T: Float,
{
    /// The lower left corner of the box, minimum of x, y, z values.
    pub origin: [T; 3],

    /// The extent of the box along each Cartesian axis.
    pub width: T,
}

impl<T> Domain<T>
where
    T: Float,
{
    /// Create a box from its centre and side length.
    ///
    /// # Panics
    /// If `width` is not strictly positive.
    pub fn new(centre: [T; 3], width: T) -> Self {
        assert!(width > T::zero(), "domain width must be positive");
        let half = width / T::from(2.0).unwrap();
        Domain {
            origin: [centre[0] - half, centre[1] - half, centre[2] - half],
            width,
        }
    }

    /// Compute the smallest cube enclosing a set of points, with a small
    /// relative margin so that boundary points map strictly inside.
    pub fn from_points(points: &[[T; 3]]) -> Self {
        let mut min = [T::max_value(); 3];
        let mut max = [T::min_value(); 3];
        for point in points {
            for d in 0..3 {
                min[d] = min[d].min(point[d]);
                max[d] = max[d].max(point[d]);
            }
        }
        if points.is_empty() {
            return Domain {
                origin: [T::zero(); 3],
                width: T::one(),
            };
        }
        let mut width = T::zero();
        for d in 0..3 {
            width = width.max(max[d] - min[d]);
        }
        let margin = T::from(1.0 + 1e-5).unwrap();
        let width = if width > T::zero() { width * margin } else { T::one() };
        Domain {
            origin: min,
            width,
        }
    }

    /// Centre of the box.
    pub fn centre(&self) -> [T; 3] {
        let half = self.width / T::from(2.0).unwrap();
        [
            self.origin[0] + half,
            self.origin[1] + half,
            self.origin[2] + half,
        ]
    }

    /// Side length of a cell at the given level.
    pub fn cell_width(&self, level: usize) -> T {
        self.width / T::from(1u64 << level).unwrap()
    }

    /// Centre of the cell with the given index coordinate at a level.
    pub fn cell_centre(&self, coord: &TreeCoordinate, level: usize) -> [T; 3] {
        let cell_width = self.cell_width(level);
        let half = cell_width / T::from(2.0).unwrap();
        [
            self.origin[0] + T::from(coord.x).unwrap() * cell_width + half,
            self.origin[1] + T::from(coord.y).unwrap() * cell_width + half,
            self.origin[2] + T::from(coord.z).unwrap() * cell_width + half,
        ]
    }

    /// Index coordinate of the cell containing a point at the given level.
    ///
    /// Points on the upper boundary are clamped into the last cell.
    ///
    /// # Panics
    /// If the point lies outside the box.
    pub fn cell_coordinate(&self, point: &[T; 3], level: usize) -> TreeCoordinate {
        let cell_width = self.cell_width(level);
        let bound = (1i64 << level) - 1;
        let mut components = [0i64; 3];
        for d in 0..3 {
            let relative = point[d] - self.origin[d];
            assert!(
                relative >= T::zero() && relative <= self.width,
                "point outside domain"
            );
            let index = (relative / cell_width).floor().to_i64().unwrap();
            components[d] = index.clamp(0, bound);
        }
        TreeCoordinate::new(components[0], components[1], components[2])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cell_coordinate_and_centre() {
        let domain = Domain::new([0.5f64, 0.5, 0.5], 1.0);
        let level = 3;

        let coord = domain.cell_coordinate(&[0.1, 0.9, 0.5], level);
        assert_eq!(coord, crate::tree::morton::TreeCoordinate::new(0, 7, 4));

        // Upper boundary points land in the last cell.
        let coord = domain.cell_coordinate(&[1.0, 1.0, 1.0], level);
        assert_eq!(coord, crate::tree::morton::TreeCoordinate::new(7, 7, 7));

        let centre = domain.cell_centre(&coord, level);
        assert_relative_eq!(centre[0], 0.9375, epsilon = 1e-12);
    }

    #[test]
    fn test_from_points_encloses() {
        let points = vec![[0.0f64, -1.0, 2.0], [3.0, 0.5, -0.5], [1.0, 1.0, 1.0]];
        let domain = Domain::from_points(&points);
        let level = 5;
        for point in &points {
            let coord = domain.cell_coordinate(point, level);
            assert!(coord.is_valid(level));
        }
    }

    #[test]
    #[should_panic(expected = "point outside domain")]
    fn test_point_outside_domain() {
        let domain = Domain::new([0.5f64, 0.5, 0.5], 1.0);
        domain.cell_coordinate(&[2.0, 0.0, 0.0], 2);
    }
}
