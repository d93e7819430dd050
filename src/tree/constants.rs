//! Crate level constants
/// Maximum tree height encodable in a 64 bit Morton index, at 3 bits per level.
pub const MAX_HEIGHT: usize = 21;

/// Number of children of an interior cell.
pub const N_CHILDREN: usize = 8;

/// Maximum number of adjacent neighbors of a cell.
pub const N_NEIGHBORS: usize = 26;

/// Size of the relative-offset scheme used to tag interaction list entries,
/// spanning offsets in \[-3, 3\]^3.
pub const N_INTERACTION_POSITIONS: usize = 343;

/// Maximum size of an interaction list at separation criterion 1.
pub const N_INTERACTIONS: usize = 189;

/// Default number of leaves stored per block.
pub const DEFAULT_GROUP_SIZE: usize = 250;

/// Coarsest level with a non-empty far field.
pub const UPPER_WORKING_LEVEL: usize = 2;

/// Number of colour classes used to schedule mutual near-field updates
/// without write conflicts.
pub const N_SHAPES: usize = 27;
