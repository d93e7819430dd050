//! Utility types for trait definitions.
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::time::{Duration, Instant};

/// Failure of an evaluation run.
///
/// Single-process engines cannot fail; the distributed engine returns this
/// when the ranks of a collective run disagree on what to execute.
#[derive(Debug)]
pub enum FmmError {
    /// The run could not proceed, with a diagnostic.
    Failed(String),
}

impl fmt::Display for FmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FmmError::Failed(e) => write!(f, "Failed: {}", e),
        }
    }
}

impl std::error::Error for FmmError {}

/// Set of operators to run during an evaluation, combined with `|`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FmmOperations(pub u32);

impl FmmOperations {
    /// Particle to multipole.
    pub const P2M: Self = FmmOperations(1);

    /// Multipole to multipole.
    pub const M2M: Self = FmmOperations(1 << 1);

    /// Multipole to local.
    pub const M2L: Self = FmmOperations(1 << 2);

    /// Local to local.
    pub const L2L: Self = FmmOperations(1 << 3);

    /// Particle to particle.
    pub const P2P: Self = FmmOperations(1 << 4);

    /// Local to particle.
    pub const L2P: Self = FmmOperations(1 << 5);

    /// The near-field part only.
    pub const NEAR_FIELD: Self = Self::P2P;

    /// The far-field part only.
    pub const FAR_FIELD: Self =
        FmmOperations(Self::P2M.0 | Self::M2M.0 | Self::M2L.0 | Self::L2L.0 | Self::L2P.0);

    /// The complete algorithm.
    pub const ALL: Self = FmmOperations(Self::NEAR_FIELD.0 | Self::FAR_FIELD.0);

    /// Whether every operator in `other` is enabled.
    pub fn contains(&self, other: FmmOperations) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no operator is enabled.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FmmOperations {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        FmmOperations(self.0 | rhs.0)
    }
}

impl BitAnd for FmmOperations {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        FmmOperations(self.0 & rhs.0)
    }
}

/// Operators implemented by the evaluation engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FmmOperatorType {
    /// Particle to multipole.
    P2M,

    /// Multipole to multipole, level to which it is applied.
    M2M(usize),

    /// Multipole to local, level to which it is applied.
    M2L(usize),

    /// Local to local, level from which it is applied.
    L2L(usize),

    /// Particle to particle.
    P2P,

    /// Local to particle.
    L2P,

    /// The near-field phase as one unit.
    NearField,

    /// The far-field phase as one unit.
    FarField,
}

/// Time an operator implementation.
#[derive(Clone, Copy, Debug)]
pub struct FmmOperatorTime {
    /// Operator being timed.
    pub operator: FmmOperatorType,

    /// Elapsed wall-clock time.
    pub time: Duration,
}

impl FmmOperatorTime {
    /// Time from a duration.
    pub fn from_duration(operator: FmmOperatorType, time: Duration) -> Self {
        Self { operator, time }
    }

    /// Time from an instant.
    pub fn from_instant(operator: FmmOperatorType, start: Instant) -> Self {
        Self {
            operator,
            time: start.elapsed(),
        }
    }
}

impl fmt::Display for FmmOperatorTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}ms", self.operator, self.time.as_millis())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_operations_mask() {
        let ops = FmmOperations::P2M | FmmOperations::P2P;
        assert!(ops.contains(FmmOperations::P2M));
        assert!(ops.contains(FmmOperations::P2P));
        assert!(!ops.contains(FmmOperations::M2L));
        assert!(FmmOperations::ALL.contains(FmmOperations::FAR_FIELD));
        assert!(FmmOperations::ALL.contains(FmmOperations::NEAR_FIELD));
        assert!(!FmmOperations::FAR_FIELD.contains(FmmOperations::P2P));
    }

    #[test]
    fn test_operations_intersection() {
        let ops = FmmOperations::P2M | FmmOperations::P2P;
        assert_eq!(ops & FmmOperations::NEAR_FIELD, FmmOperations::P2P);
        assert_eq!(ops & FmmOperations::FAR_FIELD, FmmOperations::P2M);
        assert!((FmmOperations::NEAR_FIELD & FmmOperations::FAR_FIELD).is_empty());
    }

    #[test]
    fn test_error_display() {
        let error = FmmError::Failed("operation mask differs across ranks".to_string());
        assert_eq!(
            format!("{error}"),
            "Failed: operation mask differs across ranks"
        );
    }
}
