// Unit — the interface every differentiable component implements
//
// A Unit exposes input/output tensor ports, runs one forward step, and can
// be asked to backpropagate a loss derivative for a specific point in the
// past, recursing into its predecessor. Units form a singly-linked chain
// through weak predecessor links; a unit never owns its predecessor, and
// recurrent bindings close a bounded self-loop over the same links.
//
// WHY &self METHODS AND Rc HANDLES?
//
// Backpropagation through time re-enters the same units at earlier time
// indices (a loop breaker feeds a derivative back into its own chain at
// past_time + 1). Exclusive &mut borrows cannot survive that re-entry, so
// the protocol takes &self and units keep their mutable state behind
// RefCell/Cell, with the discipline that no internal borrow is held across
// a recursive backpropagate call.
//
// Lifecycle: Constructed -> Prepared (prepare_training) -> run/backpropagate
// -> Ended (end_training). backpropagate and derivative access outside the
// prepared stage are hard errors; run and reset stay valid for
// inference-only use.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use vole_core::error::{Error, Result};
use vole_core::{Backend, Tensor};

pub trait Unit {
    /// The unit's input ports. Handles, not copies.
    fn inputs(&self) -> Vec<Tensor>;

    /// The unit's output ports.
    fn outputs(&self) -> Vec<Tensor>;

    /// Derivatives with respect to the inputs, produced by the latest
    /// `backpropagate`. Only exists while training is prepared.
    fn pre_layer_derivatives(&self) -> Result<Vec<Tensor>>;

    /// Wire this unit after `predecessor`, validating port compatibility.
    /// Fails fast, before any `run`.
    fn connect(&self, predecessor: &Rc<dyn Unit>) -> Result<()>;

    fn predecessor(&self) -> Option<Rc<dyn Unit>>;

    /// One forward step. Copies `inputs` into the input ports, computes
    /// the outputs, and — while training is prepared — pushes a snapshot
    /// into the history ring.
    fn run(&self, inputs: &[Tensor]) -> Result<()>;

    /// Consume a derivative aligned with the outputs at `past_time` steps
    /// ago: accumulate parameter gradients, compute the pre-layer
    /// derivatives, and recurse into the predecessor at the same time.
    fn backpropagate(&self, derivatives: &[Tensor], past_time: usize) -> Result<()>;

    /// Allocate the history ring and derivative scratch for a truncation
    /// window of `window` steps.
    fn prepare_training(&self, window: usize) -> Result<()>;

    /// Release everything `prepare_training` allocated.
    fn end_training(&self) -> Result<()>;

    /// Zero recurrent state (ports, history) without touching parameters
    /// or their gradients. Called once per sequence boundary.
    fn reset(&self) -> Result<()>;

    /// Append handles to the learnable tensors, in a stable order that is
    /// identical across calls.
    fn add_parameters(&self, collector: &mut Vec<Tensor>);

    /// Zero every parameter's gradient companion.
    fn reset_gradients(&self) -> Result<()>;
}

/// A weak predecessor slot shared by every unit kind.
#[derive(Default)]
pub struct Link(RefCell<Option<Weak<dyn Unit>>>);

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, unit: &Rc<dyn Unit>) {
        *self.0.borrow_mut() = Some(Rc::downgrade(unit));
    }

    pub fn get(&self) -> Option<Rc<dyn Unit>> {
        self.0.borrow().as_ref().and_then(Weak::upgrade)
    }
}

/// Validate that `prev`'s outputs can feed `next_inputs`: same port count,
/// same dims, same backend, and one device context on the accelerator.
pub fn check_link(prev: &dyn Unit, next_inputs: &[Tensor]) -> Result<()> {
    let outs = prev.outputs();
    if outs.len() != next_inputs.len() {
        return Err(Error::msg(format!(
            "port count mismatch: predecessor has {} outputs, unit expects {} inputs",
            outs.len(),
            next_inputs.len()
        )));
    }
    for (o, i) in outs.iter().zip(next_inputs) {
        if !o.same_dims(i) {
            return Err(Error::ShapeMismatch {
                expected: i.dims().to_vec(),
                got: o.dims().to_vec(),
            });
        }
        if o.backend() != i.backend() {
            return Err(Error::BackendMismatch {
                expected: i.backend(),
                got: o.backend(),
            });
        }
        if o.backend() == Backend::Accelerator && !o.same_context(i) {
            return Err(Error::ContextMismatch);
        }
    }
    Ok(())
}

/// Copy incoming tensors port-wise into a unit's own input ports.
pub fn copy_ports(src: &[Tensor], dst: &[Tensor]) -> Result<()> {
    if src.len() != dst.len() {
        return Err(Error::msg(format!(
            "expected {} input tensors, got {}",
            dst.len(),
            src.len()
        )));
    }
    for (s, d) in src.iter().zip(dst) {
        s.copy_to(d)?;
    }
    Ok(())
}

/// A zeroed tensor with the given dims on `proto`'s backend and context.
pub fn tensor_like(proto: &Tensor, dims: &[usize]) -> Result<Tensor> {
    match proto.context() {
        Some(ctx) => Tensor::accel(&ctx, dims),
        None => Tensor::host(dims),
    }
}
