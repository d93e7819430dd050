//! Engine support utilities.
use std::time::{Duration, Instant};

use num::Float;

/// Run `f`, measuring its wall-clock time when `timed` is set.
pub fn optionally_time<F, R>(timed: bool, f: F) -> (R, Option<Duration>)
where
    F: FnOnce() -> R,
{
    if timed {
        let start = Instant::now();
        let result = f();
        (result, Some(start.elapsed()))
    } else {
        (f(), None)
    }
}

/// Accumulator for relative errors between a reference and a computed
/// solution.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccuracyChecker<T> {
    diff_sq_sum: T,
    reference_sq_sum: T,
    max_diff: T,
    max_reference: T,
    n: usize,
}

impl<T> AccuracyChecker<T>
where
    T: Float + Default,
{
    /// Empty accumulator.
    pub fn new() -> Self {
        Self {
            diff_sq_sum: T::zero(),
            reference_sq_sum: T::zero(),
            max_diff: T::zero(),
            max_reference: T::zero(),
            n: 0,
        }
    }

    /// Record one reference/computed pair.
    pub fn add(&mut self, reference: T, computed: T) {
        let diff = reference - computed;
        self.diff_sq_sum = self.diff_sq_sum + diff * diff;
        self.reference_sq_sum = self.reference_sq_sum + reference * reference;
        self.max_diff = self.max_diff.max(diff.abs());
        self.max_reference = self.max_reference.max(reference.abs());
        self.n += 1;
    }

    /// Record pairs element-wise from two slices.
    pub fn add_all(&mut self, reference: &[T], computed: &[T]) {
        assert_eq!(reference.len(), computed.len());
        for (&r, &c) in reference.iter().zip(computed) {
            self.add(r, c);
        }
    }

    /// Number of recorded pairs.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Whether no pairs were recorded.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Relative l2 error over all recorded pairs.
    pub fn relative_l2(&self) -> T {
        if self.reference_sq_sum > T::zero() {
            (self.diff_sq_sum / self.reference_sq_sum).sqrt()
        } else {
            self.diff_sq_sum.sqrt()
        }
    }

    /// Relative infinity-norm error over all recorded pairs.
    pub fn relative_inf(&self) -> T {
        if self.max_reference > T::zero() {
            self.max_diff / self.max_reference
        } else {
            self.max_diff
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_accuracy_checker() {
        let mut checker = AccuracyChecker::new();
        checker.add_all(&[1.0f64, 2.0, 2.0], &[1.0, 2.0, 1.0]);
        assert_eq!(checker.len(), 3);
        assert_relative_eq!(checker.relative_l2(), (1.0f64 / 9.0).sqrt());
        assert_relative_eq!(checker.relative_inf(), 0.5);

        let exact: AccuracyChecker<f64> = {
            let mut c = AccuracyChecker::new();
            c.add(3.0, 3.0);
            c
        };
        assert_eq!(exact.relative_l2(), 0.0);
        assert_eq!(exact.relative_inf(), 0.0);
    }

    #[test]
    fn test_optionally_time() {
        let (value, duration) = optionally_time(true, || 7);
        assert_eq!(value, 7);
        assert!(duration.is_some());
        let (_, duration) = optionally_time(false, || ());
        assert!(duration.is_none());
    }
}
