// Recurrent binding — loop breaker + feedback edge
//
// A unit whose past output feeds its future input is not a DAG. The
// binding expresses the cycle as bounded recursion: a LoopBreaker node
// stands in as the recurrent chain's input-facing unit. Its "output" is
// the full input tensor, the concatenation [external input | previous
// chain output] built by region copies on every forward step.
//
// On backpropagate(d, t) the breaker splits d along that concatenation:
// the external part forwards unchanged to the true predecessor at the same
// t, and the recurrent part feeds back into the chain at t + 1 — but only
// while min(window, iterated) - t - 1 > 0. The horizon check happens at
// every level, not just at entry, because the remaining depth shrinks by
// one per recursion. Past the horizon the feedback contribution is
// silently zero.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use vole_core::error::{Error, Result};
use vole_core::{Region, Tensor};

use crate::chain::Chain;
use crate::unit::{tensor_like, Link, Unit};

pub struct LoopBreaker {
    full_input: Tensor,
    external_len: usize,
    output_len: usize,
    prev: Link,
    feedback: RefCell<Option<Weak<dyn Unit>>>,
    iterated: Cell<usize>,
    window: Cell<usize>,
    train: RefCell<Option<BreakerTrain>>,
}

struct BreakerTrain {
    /// External slice of the incoming derivative; consumed before the
    /// recursive calls overwrite it at deeper times.
    ext_der: Tensor,
    /// Recurrent slice, fed back at t + 1.
    fb_der: Tensor,
}

impl LoopBreaker {
    fn new(full_input: Tensor, external_len: usize, output_len: usize) -> LoopBreaker {
        LoopBreaker {
            full_input,
            external_len,
            output_len,
            prev: Link::new(),
            feedback: RefCell::new(None),
            iterated: Cell::new(0),
            window: Cell::new(0),
            train: RefCell::new(None),
        }
    }

    fn set_feedback(&self, unit: &Rc<dyn Unit>) {
        *self.feedback.borrow_mut() = Some(Rc::downgrade(unit));
    }

    /// Called by the owning chain once per forward step.
    fn mark_step(&self) {
        self.iterated.set(self.iterated.get() + 1);
    }

    /// Forward steps since the last reset.
    pub fn iterated(&self) -> usize {
        self.iterated.get()
    }
}

impl Unit for LoopBreaker {
    fn inputs(&self) -> Vec<Tensor> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Tensor> {
        vec![self.full_input.clone()]
    }

    fn pre_layer_derivatives(&self) -> Result<Vec<Tensor>> {
        match &*self.train.borrow() {
            Some(tr) => Ok(vec![tr.ext_der.clone()]),
            None => Err(Error::NotPrepared("loop breaker")),
        }
    }

    fn connect(&self, predecessor: &Rc<dyn Unit>) -> Result<()> {
        let outs = predecessor.outputs();
        let expected = vec![self.external_len];
        match outs.first() {
            Some(o) if o.dims() == expected.as_slice() => {}
            Some(o) => {
                return Err(Error::ShapeMismatch {
                    expected,
                    got: o.dims().to_vec(),
                })
            }
            None => return Err(Error::msg("predecessor has no output ports")),
        }
        self.prev.set(predecessor);
        Ok(())
    }

    fn predecessor(&self) -> Option<Rc<dyn Unit>> {
        self.prev.get()
    }

    fn run(&self, _inputs: &[Tensor]) -> Result<()> {
        Ok(())
    }

    fn backpropagate(&self, derivatives: &[Tensor], past_time: usize) -> Result<()> {
        if derivatives.len() != 1 {
            return Err(Error::msg("loop breaker expects one derivative tensor"));
        }
        let (ext_der, fb_der) = {
            let guard = self.train.borrow();
            let tr = guard.as_ref().ok_or(Error::NotPrepared("loop breaker"))?;
            derivatives[0].copy_region_to(
                &tr.ext_der,
                &Region::rank1(0, self.external_len),
                [0, 0, 0],
            )?;
            derivatives[0].copy_region_to(
                &tr.fb_der,
                &Region::rank1(self.external_len, self.output_len),
                [0, 0, 0],
            )?;
            (tr.ext_der.clone(), tr.fb_der.clone())
        };

        if let Some(prev) = self.prev.get() {
            prev.backpropagate(&[ext_der], past_time)?;
        }

        // Remaining horizon check, repeated at every level: the feedback
        // may only go one step deeper while real, in-window history backs
        // it.
        let horizon = self.window.get().min(self.iterated.get());
        if horizon > past_time + 1 {
            let feedback = self.feedback.borrow().as_ref().and_then(Weak::upgrade);
            if let Some(fb) = feedback {
                fb.backpropagate(&[fb_der], past_time + 1)?;
            }
        }
        Ok(())
    }

    fn prepare_training(&self, window: usize) -> Result<()> {
        let mut slot = self.train.borrow_mut();
        if slot.is_some() {
            return Err(Error::msg("loop breaker is already prepared for training"));
        }
        self.window.set(window);
        *slot = Some(BreakerTrain {
            ext_der: tensor_like(&self.full_input, &[self.external_len])?,
            fb_der: tensor_like(&self.full_input, &[self.output_len])?,
        });
        Ok(())
    }

    fn end_training(&self) -> Result<()> {
        *self.train.borrow_mut() = None;
        self.window.set(0);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.full_input.zero()?;
        self.iterated.set(0);
        Ok(())
    }

    fn add_parameters(&self, _collector: &mut Vec<Tensor>) {}

    fn reset_gradients(&self) -> Result<()> {
        Ok(())
    }
}

/// A chain of layers whose previous output is concatenated onto its next
/// input. The external input port is `external_len` wide; the inner layers
/// see `external_len + output_len`.
pub struct RecurrentChain {
    input: Tensor,
    full_input: Tensor,
    external_len: usize,
    output_len: usize,
    breaker: Rc<LoopBreaker>,
    chain: Rc<Chain>,
}

impl RecurrentChain {
    /// Build from inner layers. The first layer must accept
    /// `external_len + output_len` inputs and the last must produce
    /// `output_len` outputs.
    pub fn new(
        external_len: usize,
        output_len: usize,
        layers: Vec<Rc<dyn Unit>>,
    ) -> Result<Rc<RecurrentChain>> {
        let proto = layers
            .first()
            .and_then(|l| l.inputs().first().cloned())
            .ok_or_else(|| Error::msg("recurrent chain needs at least one layer with inputs"))?;
        let full_len = external_len + output_len;
        if proto.dims() != [full_len] {
            return Err(Error::ShapeMismatch {
                expected: vec![full_len],
                got: proto.dims().to_vec(),
            });
        }

        let full_input = tensor_like(&proto, &[full_len])?;
        let input = tensor_like(&proto, &[external_len])?;
        let breaker = Rc::new(LoopBreaker::new(full_input.clone(), external_len, output_len));

        let chain = Chain::new();
        chain.connect(&(breaker.clone() as Rc<dyn Unit>))?;
        for layer in layers {
            chain.add_layer(layer)?;
        }
        match chain.outputs().first() {
            Some(o) if o.dims() == [output_len] => {}
            Some(o) => {
                return Err(Error::ShapeMismatch {
                    expected: vec![output_len],
                    got: o.dims().to_vec(),
                })
            }
            None => return Err(Error::msg("recurrent chain has no output ports")),
        }

        let rc = Rc::new(RecurrentChain {
            input,
            full_input,
            external_len,
            output_len,
            breaker,
            chain,
        });
        let feedback: Rc<dyn Unit> = rc.clone();
        rc.breaker.set_feedback(&feedback);
        Ok(rc)
    }

    /// Forward steps since the last reset.
    pub fn iterated(&self) -> usize {
        self.breaker.iterated()
    }
}

impl Unit for RecurrentChain {
    fn inputs(&self) -> Vec<Tensor> {
        vec![self.input.clone()]
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.chain.outputs()
    }

    fn pre_layer_derivatives(&self) -> Result<Vec<Tensor>> {
        self.breaker.pre_layer_derivatives()
    }

    fn connect(&self, predecessor: &Rc<dyn Unit>) -> Result<()> {
        self.breaker.connect(predecessor)
    }

    fn predecessor(&self) -> Option<Rc<dyn Unit>> {
        self.breaker.predecessor()
    }

    fn run(&self, inputs: &[Tensor]) -> Result<()> {
        if inputs.len() != 1 {
            return Err(Error::msg("recurrent chain expects one input tensor"));
        }
        inputs[0].copy_to(&self.input)?;
        // full input = [external | previous output]
        self.input.copy_region_to(
            &self.full_input,
            &Region::rank1(0, self.external_len),
            [0, 0, 0],
        )?;
        let prev_out = self
            .chain
            .outputs()
            .first()
            .cloned()
            .ok_or_else(|| Error::msg("recurrent chain has no output ports"))?;
        prev_out.copy_region_to(
            &self.full_input,
            &Region::rank1(0, self.output_len),
            [self.external_len, 0, 0],
        )?;
        self.chain.run(&[self.full_input.clone()])?;
        self.breaker.mark_step();
        Ok(())
    }

    fn backpropagate(&self, derivatives: &[Tensor], past_time: usize) -> Result<()> {
        self.chain.backpropagate(derivatives, past_time)
    }

    fn prepare_training(&self, window: usize) -> Result<()> {
        self.breaker.prepare_training(window)?;
        self.chain.prepare_training(window)
    }

    fn end_training(&self) -> Result<()> {
        self.breaker.end_training()?;
        self.chain.end_training()
    }

    fn reset(&self) -> Result<()> {
        self.input.zero()?;
        self.breaker.reset()?;
        self.chain.reset()
    }

    fn add_parameters(&self, collector: &mut Vec<Tensor>) {
        self.chain.add_parameters(collector);
    }

    fn reset_gradients(&self) -> Result<()> {
        self.chain.reset_gradients()
    }
}
