// Update rules — the external optimizer contract
//
// An UpdateRule consumes parameter tensors with gradient companions,
// mutates the parameters in place on apply_all, and must zero every
// gradient companion it applied. Both rules work on either backend: SGD
// through the scaled-add tensor op, Adam through its device kernel (or
// host vectors for host parameters).

use vole_core::apply::dispatch;
use vole_core::error::{Error, Result};
use vole_core::{Backend, KernelOp, ParamBlock, Tensor};

pub trait UpdateRule {
    /// Track a parameter. Called once per parameter, in the stable order
    /// `add_parameters` produced.
    fn add_parameter(&mut self, param: Tensor) -> Result<()>;

    /// Apply every accumulated gradient to its parameter, then zero the
    /// gradients.
    fn apply_all(&mut self) -> Result<()>;
}

/// Plain stochastic gradient descent: p -= lr * g.
pub struct Sgd {
    learning_rate: f32,
    params: Vec<Tensor>,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Sgd {
        Sgd {
            learning_rate,
            params: Vec::new(),
        }
    }
}

impl UpdateRule for Sgd {
    fn add_parameter(&mut self, param: Tensor) -> Result<()> {
        if !param.has_gradient() {
            return Err(Error::MissingGradient);
        }
        self.params.push(param);
        Ok(())
    }

    fn apply_all(&mut self) -> Result<()> {
        for p in &self.params {
            let g = p.gradient_required()?;
            p.scaled_add_assign(&g, -self.learning_rate)?;
            g.zero()?;
        }
        Ok(())
    }
}

/// Running beta powers this small are flushed to exactly zero, matching
/// the point where f32 underflow would make them zero anyway.
const BETA_POWER_FLOOR: f32 = 5.6052e-36;

struct AdamSlot {
    param: Tensor,
    m1: Tensor,
    m2: Tensor,
}

/// Adam with bias-corrected first and second moments.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    beta1_t: f32,
    beta2_t: f32,
    slots: Vec<AdamSlot>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Adam {
        Adam::with_betas(learning_rate, 0.9, 0.999)
    }

    pub fn with_betas(learning_rate: f32, beta1: f32, beta2: f32) -> Adam {
        Adam {
            learning_rate,
            beta1,
            beta2,
            eps: 1e-7,
            beta1_t: 1.0,
            beta2_t: 1.0,
            slots: Vec::new(),
        }
    }
}

impl UpdateRule for Adam {
    fn add_parameter(&mut self, param: Tensor) -> Result<()> {
        if !param.has_gradient() {
            return Err(Error::MissingGradient);
        }
        let m1 = param.empty_clone()?;
        let m2 = param.empty_clone()?;
        self.slots.push(AdamSlot { param, m1, m2 });
        Ok(())
    }

    fn apply_all(&mut self) -> Result<()> {
        // One step for the whole parameter set: advance the beta powers
        // once, not per parameter.
        self.beta1_t *= self.beta1;
        self.beta2_t *= self.beta2;
        if self.beta1_t < BETA_POWER_FLOOR {
            self.beta1_t = 0.0;
        }
        if self.beta2_t < BETA_POWER_FLOOR {
            self.beta2_t = 0.0;
        }

        for slot in &self.slots {
            let g = slot.param.gradient_required()?;
            match slot.param.backend() {
                Backend::Host => {
                    let gv = g.to_vec()?;
                    let mut pv = slot.param.to_vec()?;
                    let mut m1v = slot.m1.to_vec()?;
                    let mut m2v = slot.m2.to_vec()?;
                    for i in 0..pv.len() {
                        m1v[i] = self.beta1 * m1v[i] + (1.0 - self.beta1) * gv[i];
                        m2v[i] = self.beta2 * m2v[i] + (1.0 - self.beta2) * gv[i] * gv[i];
                        let m_hat = m1v[i] / (1.0 - self.beta1_t);
                        let v_hat = m2v[i] / (1.0 - self.beta2_t);
                        pv[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
                    }
                    slot.m1.update_raw_data(&m1v)?;
                    slot.m2.update_raw_data(&m2v)?;
                    slot.param.update_raw_data(&pv)?;
                }
                Backend::Accelerator => {
                    let params = ParamBlock {
                        ints: [0; 4],
                        floats: [
                            self.learning_rate,
                            self.beta1,
                            self.beta2,
                            self.beta1_t,
                            self.beta2_t,
                            self.eps,
                            0.0,
                            0.0,
                        ],
                    };
                    dispatch(
                        KernelOp::AdamStep,
                        &[&slot.param, &slot.m1, &slot.m2],
                        &[&g],
                        slot.param.dims(),
                        params,
                    )?;
                }
            }
            g.zero()?;
        }
        Ok(())
    }
}
