// Parameter initialization helpers
//
// Both initializers scale by fan-in so early activations neither saturate
// nor vanish. They produce tight host vectors; the caller uploads them to
// whichever backend the parameter lives on.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use vole_core::error::{Error, Result};

/// Gaussian N(0, 1/fan_in) values.
pub fn gaussian_fan_in(count: usize, fan_in: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
    let std = 1.0 / (fan_in.max(1) as f32).sqrt();
    let dist = Normal::new(0.0f32, std)
        .map_err(|e| Error::msg(format!("bad normal distribution: {e}")))?;
    Ok((0..count).map(|_| dist.sample(rng)).collect())
}

/// Uniform values in [-k, k] with k = 1/sqrt(fan_in).
pub fn uniform_fan_in(count: usize, fan_in: usize, rng: &mut StdRng) -> Vec<f32> {
    let k = 1.0 / (fan_in.max(1) as f32).sqrt();
    (0..count).map(|_| rng.gen_range(-k..=k)).collect()
}
