// Gradient clipping — global L2 rescale before apply_all
//
// Observes the accumulated gradients of every tracked parameter as one
// vector and rescales them when the joint L2 norm leaves [min, max].
// Reading the norm is a synchronization point for accelerator gradients.

use vole_core::error::Result;
use vole_core::Tensor;

pub struct GradientClipper {
    params: Vec<Tensor>,
    min: f32,
    max: f32,
}

impl GradientClipper {
    pub fn new(params: Vec<Tensor>, min: f32, max: f32) -> GradientClipper {
        GradientClipper { params, min, max }
    }

    /// Rescale all gradients so the global L2 norm lands in [min, max].
    /// Returns the norm observed before clipping.
    pub fn clip(&self) -> Result<f32> {
        let mut sum_sq = 0.0f32;
        for p in &self.params {
            sum_sq += p.gradient_required()?.sum_of_squares()?;
        }
        let norm = sum_sq.sqrt();
        if norm > 0.0 && (norm < self.min || norm > self.max) {
            let factor = norm.clamp(self.min, self.max) / norm;
            for p in &self.params {
                p.gradient_required()?.scale(factor)?;
            }
        }
        Ok(norm)
    }
}
