// Dense — fully connected unit with an activation
//
// Weight is rank 2 with dims [inputs, outputs]: axis 0 (contiguous) walks
// the input index, so w[i + j*m] connects input i to output j. Bias is
// rank 1 over the outputs.
//
// The host path works on tight vectors; the accelerator path issues
// kernel dispatches (forward + in-place activation, slope + outer-product
// gradient + backward matvec) and never stages through the host.
//
// The training state (history ring of input/output snapshots plus the
// derivative scratch) only exists between prepare_training and
// end_training; backpropagate without it is a lifecycle error.

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;

use vole_core::apply::dispatch;
use vole_core::error::{Error, Result};
use vole_core::{Backend, Context, KernelOp, ParamBlock, Tensor};

use crate::activation::Activation;
use crate::history::HistoryRing;
use crate::init::gaussian_fan_in;
use crate::unit::{copy_ports, Link, Unit};

pub struct Dense {
    input_len: usize,
    output_len: usize,
    weight: Tensor,
    bias: Tensor,
    input: Tensor,
    output: Tensor,
    activation: Activation,
    prev: Link,
    train: RefCell<Option<DenseTrain>>,
}

struct DenseTrain {
    /// Snapshots of (input, activated output) per past step.
    ring: HistoryRing,
    /// Derivative w.r.t. the inputs; overwritten each backpropagate and
    /// consumed before the recursive call.
    pre_der: Tensor,
    /// Derivative after the activation slope; accelerator scratch.
    act_der: Tensor,
}

impl Dense {
    /// A host-backed dense unit with Gaussian fan-in weights.
    pub fn host(
        input_len: usize,
        output_len: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Rc<Dense>> {
        Self::build(None, input_len, output_len, activation, rng)
    }

    /// An accelerator-backed dense unit on the given context.
    pub fn accel(
        ctx: &Context,
        input_len: usize,
        output_len: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Rc<Dense>> {
        Self::build(Some(ctx), input_len, output_len, activation, rng)
    }

    fn build(
        ctx: Option<&Context>,
        input_len: usize,
        output_len: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Rc<Dense>> {
        let w_init = gaussian_fan_in(input_len * output_len, input_len, rng)?;
        let (weight, bias, input, output) = match ctx {
            None => (
                Tensor::host_from(&[input_len, output_len], w_init)?,
                Tensor::host(&[output_len])?,
                Tensor::host(&[input_len])?,
                Tensor::host(&[output_len])?,
            ),
            Some(ctx) => (
                Tensor::accel_from(ctx, &[input_len, output_len], &w_init)?,
                Tensor::accel(ctx, &[output_len])?,
                Tensor::accel(ctx, &[input_len])?,
                Tensor::accel(ctx, &[output_len])?,
            ),
        };
        Ok(Rc::new(Dense {
            input_len,
            output_len,
            weight,
            bias,
            input,
            output,
            activation,
            prev: Link::new(),
            train: RefCell::new(None),
        }))
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    fn forward(&self) -> Result<()> {
        let (m, n) = (self.input_len, self.output_len);
        match self.weight.backend() {
            Backend::Host => {
                let x = self.input.to_vec()?;
                let w = self.weight.to_vec()?;
                let b = self.bias.to_vec()?;
                let mut y = vec![0.0f32; n];
                for j in 0..n {
                    let mut acc = b[j];
                    for i in 0..m {
                        acc += x[i] * w[i + j * m];
                    }
                    y[j] = self.activation.value(acc);
                }
                self.output.update_raw_data(&y)
            }
            Backend::Accelerator => {
                dispatch(
                    KernelOp::DenseForward,
                    &[&self.output],
                    &[&self.input, &self.weight, &self.bias],
                    &[n],
                    ParamBlock::default().with_int(3, m as i32),
                )?;
                dispatch(
                    KernelOp::Activate(self.activation.kind()),
                    &[&self.output],
                    &[],
                    &[n],
                    ParamBlock::default().with_float(0, self.activation.alpha()),
                )
            }
        }
    }
}

impl Unit for Dense {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<Tensor> {
        vec![self.output.clone()]
    }

    fn pre_layer_derivatives(&self) -> Result<Vec<Tensor>> {
        match &*self.train.borrow() {
            Some(tr) => Ok(vec![tr.pre_der.clone()]),
            None => Err(Error::NotPrepared("dense unit")),
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
        self.forward()?;
        if let Some(tr) = &mut *self.train.borrow_mut() {
            tr.ring.record(&[&self.input, &self.output])?;
        }
        Ok(())
    }

    fn backpropagate(&self, derivatives: &[Tensor], past_time: usize) -> Result<()> {
        if derivatives.len() != 1 {
            return Err(Error::msg("dense unit expects one derivative tensor"));
        }
        let (m, n) = (self.input_len, self.output_len);
        let pre_der = {
            let guard = self.train.borrow();
            let tr = guard.as_ref().ok_or(Error::NotPrepared("dense unit"))?;
            // Past the recorded history (window or step count, whichever
            // is smaller) the contribution is silently zero and the chain
            // below sees nothing.
            let (input_t, output_t) = match (tr.ring.get(past_time, 0), tr.ring.get(past_time, 1)) {
                (Some(i), Some(o)) => (i, o),
                _ => return Ok(()),
            };

            match self.weight.backend() {
                Backend::Host => {
                    let x = input_t.to_vec()?;
                    let y = output_t.to_vec()?;
                    let mut d = derivatives[0].to_vec()?;
                    for j in 0..n {
                        d[j] *= self.activation.slope_from_output(y[j]);
                    }

                    let wg = self.weight.gradient_required()?;
                    let mut wgv = wg.to_vec()?;
                    for j in 0..n {
                        for i in 0..m {
                            wgv[i + j * m] += x[i] * d[j];
                        }
                    }
                    wg.update_raw_data(&wgv)?;

                    let bg = self.bias.gradient_required()?;
                    let mut bgv = bg.to_vec()?;
                    for j in 0..n {
                        bgv[j] += d[j];
                    }
                    bg.update_raw_data(&bgv)?;

                    let w = self.weight.to_vec()?;
                    let mut pre = vec![0.0f32; m];
                    for i in 0..m {
                        let mut acc = 0.0;
                        for j in 0..n {
                            acc += w[i + j * m] * d[j];
                        }
                        pre[i] = acc;
                    }
                    tr.pre_der.update_raw_data(&pre)?;
                }
                Backend::Accelerator => {
                    derivatives[0].copy_to(&tr.act_der)?;
                    dispatch(
                        KernelOp::ActivateSlope(self.activation.kind()),
                        &[&tr.act_der],
                        &[output_t],
                        &[n],
                        ParamBlock::default().with_float(0, self.activation.alpha()),
                    )?;
                    dispatch(
                        KernelOp::DenseGrad,
                        &[&self.weight.gradient_required()?],
                        &[input_t, &tr.act_der],
                        &[m, n],
                        ParamBlock::default(),
                    )?;
                    self.bias.gradient_required()?.add_assign(&tr.act_der)?;
                    dispatch(
                        KernelOp::DenseBackward,
                        &[&tr.pre_der],
                        &[&self.weight, &tr.act_der],
                        &[m],
                        ParamBlock::default().with_int(3, n as i32),
                    )?;
                }
            }
            tr.pre_der.clone()
        };

        // Borrow released; the recursive call may re-enter this unit at a
        // deeper past_time and overwrite the scratch we just consumed.
        if let Some(prev) = self.prev.get() {
            prev.backpropagate(&[pre_der], past_time)?;
        }
        Ok(())
    }

    fn prepare_training(&self, window: usize) -> Result<()> {
        let mut slot = self.train.borrow_mut();
        if slot.is_some() {
            return Err(Error::msg("dense unit is already prepared for training"));
        }
        self.weight.create_gradient()?;
        self.bias.create_gradient()?;
        *slot = Some(DenseTrain {
            ring: HistoryRing::new(window, &[self.input.clone(), self.output.clone()])?,
            pre_der: self.input.empty_clone()?,
            act_der: self.output.empty_clone()?,
        });
        Ok(())
    }

    fn end_training(&self) -> Result<()> {
        // Training tensors drop before the ports they were cloned from.
        *self.train.borrow_mut() = None;
        self.weight.dispose_gradient();
        self.bias.dispose_gradient();
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

    fn add_parameters(&self, collector: &mut Vec<Tensor>) {
        collector.push(self.weight.clone());
        collector.push(self.bias.clone());
    }

    fn reset_gradients(&self) -> Result<()> {
        for p in [&self.weight, &self.bias] {
            if let Some(g) = p.gradient() {
                g.zero()?;
            }
        }
        Ok(())
    }
}
