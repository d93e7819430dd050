//! Point fixtures for tests and benchmarks.
use num::Float;
use rand::prelude::*;
use rand::rngs::StdRng;

/// Uniformly random points in the unit box `[0, 1)^3`.
pub fn points_fixture<T>(n_points: usize, seed: Option<u64>) -> Vec<[T; 3]>
where
    T: Float,
    rand::distributions::Standard: rand::distributions::Distribution<T>,
{
    let mut rng = StdRng::seed_from_u64(seed.unwrap_or(0));
    (0..n_points)
        .map(|_| [rng.gen(), rng.gen(), rng.gen()])
        .collect()
}

/// Uniformly random charges in `[0, 1)`.
pub fn charges_fixture<T>(n_points: usize, seed: Option<u64>) -> Vec<T>
where
    T: Float,
    rand::distributions::Standard: rand::distributions::Distribution<T>,
{
    let mut rng = StdRng::seed_from_u64(seed.unwrap_or(0));
    (0..n_points).map(|_| rng.gen()).collect()
}
