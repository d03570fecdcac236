// FanOut — fan-out/fan-in aggregator with accumulate-then-flush gradients
//
// Forward: one logical input feeds N sibling units (either every sibling
// sees the whole input, or each owns a private slice of the port list) and
// their outputs concatenate in configuration order.
//
// Backward: siblings backpropagate independently, and each may push a
// contribution toward the same shared predecessor at the same past time —
// several times, at several times, once recurrent bindings are involved.
// Forwarding eagerly would double-count, so every sibling's predecessor is
// a helper node that only adds into per-time scratch tensors and records
// which times were touched. After all siblings of one backpropagate call
// have finished, the aggregator flushes each distinct time exactly once to
// the real predecessor and zeroes that time's scratch.

use std::cell::RefCell;
use std::rc::Rc;

use vole_core::error::{Error, Result};
use vole_core::Tensor;

use crate::unit::{check_link, copy_ports, Link, Unit};

/// Per-time accumulation state shared between the aggregator and its
/// helper nodes.
struct FanScratch {
    window: usize,
    /// `slots[past_time][port]`, shaped like the aggregator's input ports.
    slots: Vec<Vec<Tensor>>,
    /// Distinct times touched since the last flush, in first-touch order.
    times: Vec<usize>,
}

/// The helper that stands in as one sibling's predecessor. It never
/// recurses; it only accumulates into the shared scratch.
struct FanHelper {
    /// The aggregator input ports this sibling reads (its forward view).
    ports: Vec<Tensor>,
    /// First port index of this sibling's slice.
    start: usize,
    scratch: Rc<RefCell<Option<FanScratch>>>,
}

impl Unit for FanHelper {
    fn inputs(&self) -> Vec<Tensor> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.ports.clone()
    }

    fn pre_layer_derivatives(&self) -> Result<Vec<Tensor>> {
        Err(Error::msg("aggregator helpers have no derivative ports"))
    }

    fn connect(&self, _predecessor: &Rc<dyn Unit>) -> Result<()> {
        Err(Error::msg("aggregator helpers cannot have a predecessor"))
    }

    fn predecessor(&self) -> Option<Rc<dyn Unit>> {
        None
    }

    fn run(&self, _inputs: &[Tensor]) -> Result<()> {
        Ok(())
    }

    fn backpropagate(&self, derivatives: &[Tensor], past_time: usize) -> Result<()> {
        let mut guard = self.scratch.borrow_mut();
        let scratch = guard
            .as_mut()
            .ok_or(Error::NotPrepared("fan-in aggregator"))?;
        if past_time >= scratch.window {
            // Beyond the window: silently zero, like every history read.
            return Ok(());
        }
        if derivatives.len() != self.ports.len() {
            return Err(Error::msg(format!(
                "helper got {} derivative tensors for {} ports",
                derivatives.len(),
                self.ports.len()
            )));
        }
        for (i, d) in derivatives.iter().enumerate() {
            scratch.slots[past_time][self.start + i].add_assign(d)?;
        }
        if !scratch.times.contains(&past_time) {
            scratch.times.push(past_time);
        }
        Ok(())
    }

    fn prepare_training(&self, _window: usize) -> Result<()> {
        Ok(())
    }

    fn end_training(&self) -> Result<()> {
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn add_parameters(&self, _collector: &mut Vec<Tensor>) {}

    fn reset_gradients(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FanOut {
    input_ports: Vec<Tensor>,
    siblings: Vec<Rc<dyn Unit>>,
    /// The stand-in predecessors, one per sibling. Siblings only hold weak
    /// links to them, so the aggregator keeps them alive.
    helpers: Vec<Rc<dyn Unit>>,
    /// (first port, port count) of each sibling's input slice.
    spans: Vec<(usize, usize)>,
    out_counts: Vec<usize>,
    prev: Link,
    scratch: Rc<RefCell<Option<FanScratch>>>,
}

impl FanOut {
    /// Every sibling sees the whole input (identical port shapes
    /// required).
    pub fn shared(siblings: Vec<Rc<dyn Unit>>) -> Result<Rc<FanOut>> {
        let first = siblings
            .first()
            .ok_or_else(|| Error::msg("aggregator needs at least one sibling"))?;
        let protos = first.inputs();
        if protos.is_empty() {
            return Err(Error::msg("aggregator siblings must have input ports"));
        }
        let input_ports = protos
            .iter()
            .map(|p| p.empty_clone())
            .collect::<Result<Vec<_>>>()?;
        let spans = vec![(0, input_ports.len()); siblings.len()];
        Self::build(input_ports, siblings, spans)
    }

    /// Each sibling owns a private slice of the input port list, in
    /// sibling order.
    pub fn split(siblings: Vec<Rc<dyn Unit>>) -> Result<Rc<FanOut>> {
        if siblings.is_empty() {
            return Err(Error::msg("aggregator needs at least one sibling"));
        }
        let mut input_ports = Vec::new();
        let mut spans = Vec::with_capacity(siblings.len());
        for sibling in &siblings {
            let protos = sibling.inputs();
            if protos.is_empty() {
                return Err(Error::msg("aggregator siblings must have input ports"));
            }
            let start = input_ports.len();
            for p in &protos {
                input_ports.push(p.empty_clone()?);
            }
            spans.push((start, protos.len()));
        }
        Self::build(input_ports, siblings, spans)
    }

    fn build(
        input_ports: Vec<Tensor>,
        siblings: Vec<Rc<dyn Unit>>,
        spans: Vec<(usize, usize)>,
    ) -> Result<Rc<FanOut>> {
        let scratch = Rc::new(RefCell::new(None));
        let mut helpers: Vec<Rc<dyn Unit>> = Vec::with_capacity(siblings.len());
        let mut out_counts = Vec::with_capacity(siblings.len());
        for (sibling, &(start, count)) in siblings.iter().zip(&spans) {
            let helper: Rc<dyn Unit> = Rc::new(FanHelper {
                ports: input_ports[start..start + count].to_vec(),
                start,
                scratch: Rc::clone(&scratch),
            });
            check_link(helper.as_ref(), &sibling.inputs())?;
            sibling.connect(&helper)?;
            helpers.push(helper);
            let n_out = sibling.outputs().len();
            if n_out == 0 {
                return Err(Error::msg("aggregator siblings must have output ports"));
            }
            out_counts.push(n_out);
        }
        Ok(Rc::new(FanOut {
            input_ports,
            siblings,
            helpers,
            spans,
            out_counts,
            prev: Link::new(),
            scratch,
        }))
    }
}

impl Unit for FanOut {
    fn inputs(&self) -> Vec<Tensor> {
        self.input_ports.clone()
    }

    fn outputs(&self) -> Vec<Tensor> {
        self.siblings.iter().flat_map(|s| s.outputs()).collect()
    }

    fn pre_layer_derivatives(&self) -> Result<Vec<Tensor>> {
        match &*self.scratch.borrow() {
            Some(sc) => Ok(sc.slots[0].clone()),
            None => Err(Error::NotPrepared("fan-in aggregator")),
        }
    }

    fn connect(&self, predecessor: &Rc<dyn Unit>) -> Result<()> {
        check_link(predecessor.as_ref(), &self.input_ports)?;
        self.prev.set(predecessor);
        Ok(())
    }

    fn predecessor(&self) -> Option<Rc<dyn Unit>> {
        self.prev.get()
    }

    fn run(&self, inputs: &[Tensor]) -> Result<()> {
        copy_ports(inputs, &self.input_ports)?;
        for (sibling, &(start, count)) in self.siblings.iter().zip(&self.spans) {
            sibling.run(&self.input_ports[start..start + count])?;
        }
        Ok(())
    }

    fn backpropagate(&self, derivatives: &[Tensor], past_time: usize) -> Result<()> {
        if derivatives.len() != self.out_counts.iter().sum::<usize>() {
            return Err(Error::msg(format!(
                "aggregator got {} derivative tensors for {} output ports",
                derivatives.len(),
                self.out_counts.iter().sum::<usize>()
            )));
        }
        {
            // Fail before any sibling runs, not after some contributed.
            if self.scratch.borrow().is_none() {
                return Err(Error::NotPrepared("fan-in aggregator"));
            }
        }

        // Phase one: every sibling contributes into the scratch, possibly
        // at several past times via recurrent feedback.
        let mut idx = 0;
        for (sibling, &n_out) in self.siblings.iter().zip(&self.out_counts) {
            sibling.backpropagate(&derivatives[idx..idx + n_out], past_time)?;
            idx += n_out;
        }

        // Phase two: flush each distinct time exactly once, then zero its
        // scratch. The borrow is dropped around the predecessor call.
        let times = match &mut *self.scratch.borrow_mut() {
            Some(sc) => std::mem::take(&mut sc.times),
            None => return Err(Error::NotPrepared("fan-in aggregator")),
        };
        let prev = self.prev.get();
        for t in times {
            let ports = match &*self.scratch.borrow() {
                Some(sc) => sc.slots[t].clone(),
                None => return Err(Error::NotPrepared("fan-in aggregator")),
            };
            if let Some(p) = &prev {
                p.backpropagate(&ports, t)?;
            }
            for port in &ports {
                port.zero()?;
            }
        }
        Ok(())
    }

    fn prepare_training(&self, window: usize) -> Result<()> {
        {
            if window == 0 {
                return Err(Error::msg("history window must be at least 1"));
            }
            let mut guard = self.scratch.borrow_mut();
            if guard.is_some() {
                return Err(Error::msg("aggregator is already prepared for training"));
            }
            let mut slots = Vec::with_capacity(window);
            for _ in 0..window {
                slots.push(
                    self.input_ports
                        .iter()
                        .map(|p| p.empty_clone())
                        .collect::<Result<Vec<_>>>()?,
                );
            }
            *guard = Some(FanScratch {
                window,
                slots,
                times: Vec::new(),
            });
        }
        for sibling in &self.siblings {
            sibling.prepare_training(window)?;
        }
        Ok(())
    }

    fn end_training(&self) -> Result<()> {
        *self.scratch.borrow_mut() = None;
        for sibling in &self.siblings {
            sibling.end_training()?;
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        for port in &self.input_ports {
            port.zero()?;
        }
        if let Some(sc) = &mut *self.scratch.borrow_mut() {
            for slot in &sc.slots {
                for t in slot {
                    t.zero()?;
                }
            }
            sc.times.clear();
        }
        for unit in self.helpers.iter().chain(&self.siblings) {
            unit.reset()?;
        }
        Ok(())
    }

    fn add_parameters(&self, collector: &mut Vec<Tensor>) {
        for sibling in self.siblings.iter().rev() {
            sibling.add_parameters(collector);
        }
    }

    fn reset_gradients(&self) -> Result<()> {
        for sibling in &self.siblings {
            sibling.reset_gradients()?;
        }
        Ok(())
    }
}
