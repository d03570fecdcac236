// Chain — sequential container of units
//
// Wiring is validated at add_layer/connect time (shape, backend, device
// context), before any forward step, so a bad topology is a construction
// error rather than a corrupted gradient. Backpropagation enters at the
// last layer only; the recursion travels the predecessor links the chain
// wired up.

use std::cell::RefCell;
use std::rc::Rc;

use vole_core::error::{Error, Result};
use vole_core::Tensor;

use crate::unit::{check_link, Link, Unit};

#[derive(Default)]
pub struct Chain {
    layers: RefCell<Vec<Rc<dyn Unit>>>,
    prev: Link,
}

impl Chain {
    pub fn new() -> Rc<Chain> {
        Rc::new(Chain::default())
    }

    /// Append a layer, wiring it to the current tail (or to the chain's
    /// own predecessor when it is the first layer).
    pub fn add_layer(&self, layer: Rc<dyn Unit>) -> Result<()> {
        {
            let layers = self.layers.borrow();
            if let Some(last) = layers.last() {
                layer.connect(last)?;
            } else if let Some(p) = self.prev.get() {
                layer.connect(&p)?;
            }
        }
        self.layers.borrow_mut().push(layer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.borrow().is_empty()
    }

    fn first(&self) -> Result<Rc<dyn Unit>> {
        self.layers
            .borrow()
            .first()
            .cloned()
            .ok_or_else(|| Error::msg("chain has no layers"))
    }

    fn last(&self) -> Result<Rc<dyn Unit>> {
        self.layers
            .borrow()
            .last()
            .cloned()
            .ok_or_else(|| Error::msg("chain has no layers"))
    }
}

impl Unit for Chain {
    fn inputs(&self) -> Vec<Tensor> {
        self.layers
            .borrow()
            .first()
            .map(|l| l.inputs())
            .unwrap_or_default()
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.layers
            .borrow()
            .last()
            .map(|l| l.outputs())
            .unwrap_or_default()
    }

    fn pre_layer_derivatives(&self) -> Result<Vec<Tensor>> {
        self.first()?.pre_layer_derivatives()
    }

    fn connect(&self, predecessor: &Rc<dyn Unit>) -> Result<()> {
        if let Some(first) = self.layers.borrow().first() {
            check_link(predecessor.as_ref(), &first.inputs())?;
            first.connect(predecessor)?;
        }
        self.prev.set(predecessor);
        Ok(())
    }

    fn predecessor(&self) -> Option<Rc<dyn Unit>> {
        self.prev.get()
    }

    fn run(&self, inputs: &[Tensor]) -> Result<()> {
        let layers = self.layers.borrow().clone();
        let mut current: Vec<Tensor> = inputs.to_vec();
        for layer in &layers {
            layer.run(&current)?;
            current = layer.outputs();
        }
        Ok(())
    }

    fn backpropagate(&self, derivatives: &[Tensor], past_time: usize) -> Result<()> {
        let last = self.last()?;
        last.backpropagate(derivatives, past_time)
    }

    fn prepare_training(&self, window: usize) -> Result<()> {
        for layer in self.layers.borrow().iter() {
            layer.prepare_training(window)?;
        }
        Ok(())
    }

    fn end_training(&self) -> Result<()> {
        for layer in self.layers.borrow().iter() {
            layer.end_training()?;
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        for layer in self.layers.borrow().iter() {
            layer.reset()?;
        }
        Ok(())
    }

    fn add_parameters(&self, collector: &mut Vec<Tensor>) {
        // Output-side layers first; the order is stable and matches the
        // order gradients become final during a backward pass.
        for layer in self.layers.borrow().iter().rev() {
            layer.add_parameters(collector);
        }
    }

    fn reset_gradients(&self) -> Result<()> {
        for layer in self.layers.borrow().iter() {
            layer.reset_gradients()?;
        }
        Ok(())
    }
}
