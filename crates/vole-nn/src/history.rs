// HistoryRing — fixed-length snapshots for truncated BPTT
//
// A ring of `window` slots, each holding one snapshot per tracked port.
// Index 0 is always the most recent completed forward step: recording
// shifts every slot one position toward the tail (the oldest is evicted)
// and writes the new snapshot at index 0. `past_time` indexes are relative
// to the latest step, never absolute.

use vole_core::error::{Error, Result};
use vole_core::Tensor;

pub struct HistoryRing {
    window: usize,
    iterated: usize,
    /// `slots[past_time][port]`
    slots: Vec<Vec<Tensor>>,
}

impl HistoryRing {
    /// Allocate `window` slots of zeroed snapshot tensors shaped like
    /// `protos`.
    pub fn new(window: usize, protos: &[Tensor]) -> Result<Self> {
        if window == 0 {
            return Err(Error::msg("history window must be at least 1"));
        }
        let mut slots = Vec::with_capacity(window);
        for _ in 0..window {
            let snapshot = protos
                .iter()
                .map(|p| p.empty_clone())
                .collect::<Result<Vec<_>>>()?;
            slots.push(snapshot);
        }
        Ok(HistoryRing {
            window,
            iterated: 0,
            slots,
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Forward steps recorded since the last reset.
    pub fn iterated(&self) -> usize {
        self.iterated
    }

    /// How many slots currently hold real history.
    pub fn available(&self) -> usize {
        self.iterated.min(self.window)
    }

    /// Push a new snapshot: evict the oldest slot, rotate it to index 0
    /// and overwrite it with the current port values.
    pub fn record(&mut self, values: &[&Tensor]) -> Result<()> {
        if values.len() != self.slots[0].len() {
            return Err(Error::msg(format!(
                "history snapshot has {} ports, ring tracks {}",
                values.len(),
                self.slots[0].len()
            )));
        }
        self.slots.rotate_right(1);
        for (value, slot) in values.iter().zip(&self.slots[0]) {
            value.copy_to(slot)?;
        }
        self.iterated += 1;
        Ok(())
    }

    /// The snapshot of `port` from `past_time` steps ago. `None` past
    /// `available()`: a slot beyond the recorded count holds no valid
    /// history, and the backward pass must zero-contribute instead of
    /// computing on it.
    pub fn get(&self, past_time: usize, port: usize) -> Option<&Tensor> {
        if past_time >= self.available() {
            return None;
        }
        self.slots[past_time].get(port)
    }

    /// Zero every snapshot and forget the step count. Keeps the
    /// allocations.
    pub fn reset(&mut self) -> Result<()> {
        for slot in &self.slots {
            for t in slot {
                t.zero()?;
            }
        }
        self.iterated = 0;
        Ok(())
    }
}
