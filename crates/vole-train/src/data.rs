// Sequence data — the iterator contract and an in-memory implementation
//
// Training data is a sequence of sequences: the outer order may be
// shuffled between epochs, the inner step order never is (it is time).
// A step's targets may be absent, which tells the driver to run forward
// without computing a loss for that step — how delayed alignments and
// many-to-one tasks are expressed.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use vole_core::error::{Error, Result};
use vole_core::Tensor;

/// One forward step: input tensors, plus targets when a loss applies.
#[derive(Clone)]
pub struct Step {
    pub inputs: Vec<Tensor>,
    pub targets: Option<Vec<Tensor>>,
}

/// One sequence of steps.
#[derive(Clone, Default)]
pub struct SequenceData {
    pub steps: Vec<Step>,
}

impl SequenceData {
    /// Steps carrying targets, i.e. loss evaluations per pass.
    pub fn target_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.targets.is_some()).count()
    }
}

/// How targets line up with inputs along a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// A target on every step.
    ManyToMany,
    /// No targets for the first `delay` steps, targets afterwards.
    DelayedManyToMany,
    /// A single target on the last step.
    ManyToOne,
    /// Targets on every step (the single input is the caller's concern).
    OneToMany,
}

/// Align `targets` with `inputs` according to `kind`; `delay` only
/// matters for `DelayedManyToMany`.
pub fn build_sequence(
    inputs: Vec<Vec<Tensor>>,
    mut targets: Vec<Vec<Tensor>>,
    kind: SequenceKind,
    delay: usize,
) -> Result<SequenceData> {
    let needed = match kind {
        SequenceKind::ManyToMany | SequenceKind::OneToMany => inputs.len(),
        SequenceKind::DelayedManyToMany => inputs.len().saturating_sub(delay),
        SequenceKind::ManyToOne => 1,
    };
    if targets.len() != needed {
        return Err(Error::msg(format!(
            "{kind:?} over {} steps needs {needed} target rows, got {}",
            inputs.len(),
            targets.len()
        )));
    }
    let n = inputs.len();
    let mut targets = targets.drain(..);
    let steps = inputs
        .into_iter()
        .enumerate()
        .map(|(i, step_inputs)| {
            let has_target = match kind {
                SequenceKind::ManyToMany | SequenceKind::OneToMany => true,
                SequenceKind::DelayedManyToMany => i >= delay,
                SequenceKind::ManyToOne => i + 1 == n,
            };
            Step {
                inputs: step_inputs,
                targets: if has_target { targets.next() } else { None },
            }
        })
        .collect();
    Ok(SequenceData { steps })
}

pub trait DataIterator {
    /// The next step of the current sequence, or `None` at its end.
    fn next_step(&mut self) -> Option<Step>;

    /// Move to the next sequence; `false` when the epoch is exhausted.
    fn advance_sequence(&mut self) -> bool;

    /// Restart the current sequence from its first step.
    fn reset_sequence(&mut self);

    /// Restart the whole epoch (first sequence, first step).
    fn reset_data(&mut self);

    /// Reorder whole sequences; never touches step order.
    fn shuffle(&mut self, rng: &mut StdRng);

    fn sequence_count(&self) -> usize;

    /// Target-carrying steps in the current sequence.
    fn output_steps(&self) -> usize;
}

/// In-memory implementation over pre-built sequences.
pub struct ArrayDataIterator {
    sequences: Vec<SequenceData>,
    order: Vec<usize>,
    seq_pos: usize,
    step_pos: usize,
}

impl ArrayDataIterator {
    pub fn new(sequences: Vec<SequenceData>) -> Result<ArrayDataIterator> {
        if sequences.is_empty() {
            return Err(Error::msg("data iterator needs at least one sequence"));
        }
        let order = (0..sequences.len()).collect();
        Ok(ArrayDataIterator {
            sequences,
            order,
            seq_pos: 0,
            step_pos: 0,
        })
    }

    fn current(&self) -> &SequenceData {
        &self.sequences[self.order[self.seq_pos]]
    }
}

impl DataIterator for ArrayDataIterator {
    fn next_step(&mut self) -> Option<Step> {
        let step = self.current().steps.get(self.step_pos).cloned();
        if step.is_some() {
            self.step_pos += 1;
        }
        step
    }

    fn advance_sequence(&mut self) -> bool {
        if self.seq_pos + 1 >= self.order.len() {
            return false;
        }
        self.seq_pos += 1;
        self.step_pos = 0;
        true
    }

    fn reset_sequence(&mut self) {
        self.step_pos = 0;
    }

    fn reset_data(&mut self) {
        self.seq_pos = 0;
        self.step_pos = 0;
    }

    fn shuffle(&mut self, rng: &mut StdRng) {
        self.order.shuffle(rng);
    }

    fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    fn output_steps(&self) -> usize {
        self.current().target_steps()
    }
}
