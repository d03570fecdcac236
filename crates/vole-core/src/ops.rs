// Elementwise tensor operations
//
// Host path: a direct loop over the flat storage, handed to rayon above a
// size threshold. Accelerator path: one KernelApplier dispatch; never a
// silent host fallback.

use rayon::prelude::*;

use crate::apply::dispatch;
use crate::backend::{KernelOp, ParamBlock};
use crate::error::{Error, Result};
use crate::tensor::{Backend, Storage, Tensor};

/// Below this element count the rayon overhead outweighs the loop.
const PAR_THRESHOLD: usize = 4096;

fn unary_host(t: &Tensor, f: impl Fn(&mut f32) + Sync + Send) -> Result<()> {
    let mut guard = t.storage_mut();
    match &mut *guard {
        Storage::Host(v) => {
            if v.len() >= PAR_THRESHOLD {
                v.par_iter_mut().for_each(f);
            } else {
                v.iter_mut().for_each(f);
            }
            Ok(())
        }
        Storage::Accel(_) => unreachable!("backend checked by caller"),
    }
}

fn binary_host(dst: &Tensor, src: &Tensor, f: impl Fn(&mut f32, f32) + Sync + Send) -> Result<()> {
    let mut d_guard = dst.storage_mut();
    let s_guard = src.storage_ref();
    match (&mut *d_guard, &*s_guard) {
        (Storage::Host(d), Storage::Host(s)) => {
            if d.len() >= PAR_THRESHOLD {
                d.par_iter_mut().zip(s.par_iter()).for_each(|(a, b)| f(a, *b));
            } else {
                d.iter_mut().zip(s.iter()).for_each(|(a, b)| f(a, *b));
            }
            Ok(())
        }
        _ => unreachable!("backend checked by caller"),
    }
}

fn check_pair(dst: &Tensor, src: &Tensor) -> Result<()> {
    if dst.same_tensor(src) {
        return Err(Error::msg("elementwise operands alias the same tensor"));
    }
    if dst.len() != src.len() {
        return Err(Error::LengthMismatch {
            expected: dst.len(),
            got: src.len(),
        });
    }
    if dst.backend() != src.backend() {
        return Err(Error::BackendMismatch {
            expected: dst.backend(),
            got: src.backend(),
        });
    }
    if dst.backend() == Backend::Accelerator && !dst.same_context(src) {
        return Err(Error::ContextMismatch);
    }
    Ok(())
}

impl Tensor {
    /// Set every element to zero.
    pub fn zero(&self) -> Result<()> {
        match self.backend() {
            Backend::Host => unary_host(self, |a| *a = 0.0),
            Backend::Accelerator => {
                dispatch(KernelOp::Zero, &[self], &[], self.dims(), ParamBlock::default())
            }
        }
    }

    /// self += other, elementwise. Same length, same backend and context.
    pub fn add_assign(&self, other: &Tensor) -> Result<()> {
        check_pair(self, other)?;
        match self.backend() {
            Backend::Host => binary_host(self, other, |a, b| *a += b),
            Backend::Accelerator => dispatch(
                KernelOp::Add,
                &[self],
                &[other],
                self.dims(),
                ParamBlock::default(),
            ),
        }
    }

    /// self *= other, elementwise.
    pub fn mul_assign(&self, other: &Tensor) -> Result<()> {
        check_pair(self, other)?;
        match self.backend() {
            Backend::Host => binary_host(self, other, |a, b| *a *= b),
            Backend::Accelerator => dispatch(
                KernelOp::Mul,
                &[self],
                &[other],
                self.dims(),
                ParamBlock::default(),
            ),
        }
    }

    /// self *= factor.
    pub fn scale(&self, factor: f32) -> Result<()> {
        match self.backend() {
            Backend::Host => unary_host(self, move |a| *a *= factor),
            Backend::Accelerator => dispatch(
                KernelOp::Scale,
                &[self],
                &[],
                self.dims(),
                ParamBlock::default().with_float(0, factor),
            ),
        }
    }

    /// self += alpha * other.
    pub fn scaled_add_assign(&self, other: &Tensor, alpha: f32) -> Result<()> {
        check_pair(self, other)?;
        match self.backend() {
            Backend::Host => binary_host(self, other, move |a, b| *a += alpha * b),
            Backend::Accelerator => dispatch(
                KernelOp::ScaledAdd,
                &[self],
                &[other],
                self.dims(),
                ParamBlock::default().with_float(0, alpha),
            ),
        }
    }

    /// Sum of squared elements. A synchronization point on the accelerator
    /// backend (reads the buffer back).
    pub fn sum_of_squares(&self) -> Result<f32> {
        match self.backend() {
            Backend::Host => self.map_host(|v| v.iter().map(|x| x * x).sum()),
            Backend::Accelerator => Ok(self.to_vec()?.iter().map(|x| x * x).sum()),
        }
    }
}
