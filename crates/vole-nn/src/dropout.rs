// Dropout — random zeroing with a mask history
//
// The mask is sampled on the host (0 or 1/(1-rate) per element, so one
// multiply applies both the drop and the rescale) and uploaded to the
// unit's backend. The backward pass multiplies the derivative by the mask
// recorded at the requested past step, which is why masks get their own
// history ring. Deterministic from the seed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vole_core::error::{Error, Result};
use vole_core::{Context, Tensor};

use crate::history::HistoryRing;
use crate::unit::{copy_ports, Link, Unit};

pub struct Dropout {
    rate: f32,
    enabled: Cell<bool>,
    input: Tensor,
    output: Tensor,
    mask: Tensor,
    rng: RefCell<StdRng>,
    prev: Link,
    train: RefCell<Option<DropoutTrain>>,
}

struct DropoutTrain {
    /// Mask snapshots per past step.
    ring: HistoryRing,
    pre_der: Tensor,
}

impl Dropout {
    pub fn host(dims: &[usize], rate: f32, seed: u64) -> Result<Rc<Dropout>> {
        let input = Tensor::host(dims)?;
        Self::build(input, rate, seed)
    }

    pub fn accel(ctx: &Context, dims: &[usize], rate: f32, seed: u64) -> Result<Rc<Dropout>> {
        let input = Tensor::accel(ctx, dims)?;
        Self::build(input, rate, seed)
    }

    fn build(input: Tensor, rate: f32, seed: u64) -> Result<Rc<Dropout>> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::msg(format!("dropout rate {rate} outside [0, 1)")));
        }
        let output = input.empty_clone()?;
        let mask = input.empty_clone()?;
        Ok(Rc::new(Dropout {
            rate,
            enabled: Cell::new(true),
            input,
            output,
            mask,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            prev: Link::new(),
            train: RefCell::new(None),
        }))
    }

    /// Disable for inference: the unit becomes an identity pass-through
    /// (the recorded mask is all ones).
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    fn sample_mask(&self) -> Result<()> {
        let len = self.mask.len();
        let values = if self.enabled.get() {
            let keep_scale = 1.0 / (1.0 - self.rate);
            let mut rng = self.rng.borrow_mut();
            (0..len)
                .map(|_| {
                    if rng.gen::<f32>() >= self.rate {
                        keep_scale
                    } else {
                        0.0
                    }
                })
                .collect()
        } else {
            vec![1.0f32; len]
        };
        self.mask.update_raw_data(&values)
    }
}

impl Unit for Dropout {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<Tensor> {
        vec![self.output.clone()]
    }

    fn pre_layer_derivatives(&self) -> Result<Vec<Tensor>> {
        match &*self.train.borrow() {
            Some(tr) => Ok(vec![tr.pre_der.clone()]),
            None => Err(Error::NotPrepared("dropout unit")),
        }
    }

    fn connect(&self, predecessor: &Rc<dyn Unit>) -> Result<()> {
        crate::unit::check_link(predecessor.as_ref(), &self.inputs())?;
        self.prev.set(predecessor);
        Ok(())
    }

    fn predecessor(&self) -> Option<Rc<dyn Unit>> {
        self.prev.get()
    }

    fn run(&self, inputs: &[Tensor]) -> Result<()> {
        copy_ports(inputs, &self.inputs())?;
        self.sample_mask()?;
        self.input.copy_to(&self.output)?;
        self.output.mul_assign(&self.mask)?;
        if let Some(tr) = &mut *self.train.borrow_mut() {
            tr.ring.record(&[&self.mask])?;
        }
        Ok(())
    }

    fn backpropagate(&self, derivatives: &[Tensor], past_time: usize) -> Result<()> {
        if derivatives.len() != 1 {
            return Err(Error::msg("dropout unit expects one derivative tensor"));
        }
        let pre_der = {
            let guard = self.train.borrow();
            let tr = guard.as_ref().ok_or(Error::NotPrepared("dropout unit"))?;
            let mask_t = match tr.ring.get(past_time, 0) {
                Some(m) => m,
                None => return Ok(()),
            };
            derivatives[0].copy_to(&tr.pre_der)?;
            tr.pre_der.mul_assign(mask_t)?;
            tr.pre_der.clone()
        };
        if let Some(prev) = self.prev.get() {
            prev.backpropagate(&[pre_der], past_time)?;
        }
        Ok(())
    }

    fn prepare_training(&self, window: usize) -> Result<()> {
        let mut slot = self.train.borrow_mut();
        if slot.is_some() {
            return Err(Error::msg("dropout unit is already prepared for training"));
        }
        *slot = Some(DropoutTrain {
            ring: HistoryRing::new(window, &[self.mask.clone()])?,
            pre_der: self.input.empty_clone()?,
        });
        Ok(())
    }

    fn end_training(&self) -> Result<()> {
        *self.train.borrow_mut() = None;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.input.zero()?;
        self.output.zero()?;
        if let Some(tr) = &mut *self.train.borrow_mut() {
            tr.ring.reset()?;
        }
        Ok(())
    }

    fn add_parameters(&self, _collector: &mut Vec<Tensor>) {}

    fn reset_gradients(&self) -> Result<()> {
        Ok(())
    }
}
