// Loss — the external contract seeding the backward pass
//
// A loss produces a scalar for reporting and a derivative tensor aligned
// with a unit's output; backpropagate(derivative, 0) consumes the latter.
// Losses compute on host snapshots (a synchronization point for
// accelerator tensors) and write the result back, so they work with either
// backend unchanged.

use vole_core::error::{Error, Result};
use vole_core::Tensor;

pub trait Loss {
    /// Scalar loss over one output tensor.
    fn loss(&self, predicted: &Tensor, correct: &Tensor) -> Result<f32>;

    /// Write (or, with `overwrite = false`, add) the derivative of the
    /// loss with respect to `predicted` into `out`.
    fn derivative(
        &self,
        predicted: &Tensor,
        correct: &Tensor,
        out: &Tensor,
        overwrite: bool,
    ) -> Result<()>;
}

fn check_shapes(predicted: &Tensor, correct: &Tensor, out: Option<&Tensor>) -> Result<()> {
    if !predicted.same_dims(correct) {
        return Err(Error::ShapeMismatch {
            expected: predicted.dims().to_vec(),
            got: correct.dims().to_vec(),
        });
    }
    if let Some(out) = out {
        if !predicted.same_dims(out) {
            return Err(Error::ShapeMismatch {
                expected: predicted.dims().to_vec(),
                got: out.dims().to_vec(),
            });
        }
    }
    Ok(())
}

/// Mean squared error: loss = sum((y - p)^2) / n, derivative = -2/n (y - p).
pub struct Mse;

impl Loss for Mse {
    fn loss(&self, predicted: &Tensor, correct: &Tensor) -> Result<f32> {
        check_shapes(predicted, correct, None)?;
        let p = predicted.to_vec()?;
        let y = correct.to_vec()?;
        let n = p.len() as f32;
        Ok(p.iter().zip(&y).map(|(p, y)| (y - p) * (y - p)).sum::<f32>() / n)
    }

    fn derivative(
        &self,
        predicted: &Tensor,
        correct: &Tensor,
        out: &Tensor,
        overwrite: bool,
    ) -> Result<()> {
        check_shapes(predicted, correct, Some(out))?;
        let p = predicted.to_vec()?;
        let y = correct.to_vec()?;
        let n = p.len() as f32;
        let mut d = if overwrite {
            vec![0.0f32; p.len()]
        } else {
            out.to_vec()?
        };
        for i in 0..p.len() {
            d[i] += -2.0 / n * (y[i] - p[i]);
        }
        out.update_raw_data(&d)
    }
}

/// Clamp bounds keeping the binary cross-entropy logs finite.
const CE_MIN: f32 = 1e-5;
const CE_MAX: f32 = 0.99999;

/// Elementwise binary cross-entropy with prediction clamping.
pub struct CrossEntropy;

impl Loss for CrossEntropy {
    fn loss(&self, predicted: &Tensor, correct: &Tensor) -> Result<f32> {
        check_shapes(predicted, correct, None)?;
        let p = predicted.to_vec()?;
        let y = correct.to_vec()?;
        let n = p.len() as f32;
        let total: f32 = p
            .iter()
            .zip(&y)
            .map(|(p, y)| {
                let p = p.clamp(CE_MIN, CE_MAX);
                -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            })
            .sum();
        Ok(total / n)
    }

    fn derivative(
        &self,
        predicted: &Tensor,
        correct: &Tensor,
        out: &Tensor,
        overwrite: bool,
    ) -> Result<()> {
        check_shapes(predicted, correct, Some(out))?;
        let p = predicted.to_vec()?;
        let y = correct.to_vec()?;
        let mut d = if overwrite {
            vec![0.0f32; p.len()]
        } else {
            out.to_vec()?
        };
        for i in 0..p.len() {
            let pi = p[i].clamp(CE_MIN, CE_MAX);
            d[i] += -y[i] / pi + (1.0 - y[i]) / (1.0 - pi);
        }
        out.update_raw_data(&d)
    }
}
