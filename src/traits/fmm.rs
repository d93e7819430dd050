//! The interface shared by the evaluation engines.
use crate::traits::types::{FmmError, FmmOperations, FmmOperatorTime};

/// A complete evaluation engine over a built tree.
pub trait FmmEngine {
    /// Run the full algorithm.
    fn execute(&mut self) -> Result<(), FmmError> {
        self.execute_operations(FmmOperations::ALL)
    }

    /// Run only the requested subset of operators.
    fn execute_operations(&mut self, operations: FmmOperations) -> Result<(), FmmError>;

    /// Wall-clock times recorded by the last run, if the engine was timed.
    ///
    /// Granularity is up to the engine: the loop-driven engines record one
    /// entry per operator and level, the task engine one entry per
    /// near/far phase.
    fn operator_times(&self) -> &[FmmOperatorTime];

    /// Short human-readable engine name.
    fn name(&self) -> &'static str;
}
