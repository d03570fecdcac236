// Trainer — the driver wiring model, loss, data and update rule together
//
// One epoch walks every sequence step by step: forward pass, loss
// derivative seeded at past_time 0, and a parameter update every
// `batch_size` steps. Derivatives are scaled so a batch contributes an
// average, not a sum, regardless of how targets are spread over the
// sequence. Recurrent state is reset at every sequence boundary; the
// leftover partial batch is applied at the end of the epoch.

use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use vole_core::error::{Error, Result};
use vole_core::Tensor;
use vole_nn::{Loss, Unit};

use crate::clip::GradientClipper;
use crate::data::DataIterator;
use crate::optim::UpdateRule;

pub struct TrainerConfig {
    /// Truncation window for backpropagation through time.
    pub window: usize,
    /// Steps with targets between parameter updates.
    pub batch_size: usize,
    /// Reorder sequences before each epoch.
    pub shuffle: bool,
    /// Global L2 gradient clipping bounds, when set.
    pub clip: Option<(f32, f32)>,
    /// Seed for the shuffle rng.
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            window: 1,
            batch_size: 1,
            shuffle: true,
            clip: None,
            seed: 0,
        }
    }
}

pub struct EpochLog {
    pub epoch: usize,
    pub loss: f32,
}

pub struct TrainReport {
    pub epochs: usize,
    pub final_loss: f32,
    pub history: Vec<EpochLog>,
}

pub struct Trainer<L: Loss, U: UpdateRule, D: DataIterator> {
    model: Rc<dyn Unit>,
    loss: L,
    rule: U,
    data: D,
    config: TrainerConfig,
    clipper: Option<GradientClipper>,
    derivatives: Vec<Tensor>,
    rng: StdRng,
    ended: bool,
}

impl<L: Loss, U: UpdateRule, D: DataIterator> Trainer<L, U, D> {
    /// Prepare `model` for training and hand its parameters to `rule`
    /// (and the clipper, when configured). The model stays prepared until
    /// `finish`.
    pub fn new(
        model: Rc<dyn Unit>,
        loss: L,
        mut rule: U,
        data: D,
        config: TrainerConfig,
    ) -> Result<Self> {
        if config.window == 0 {
            return Err(Error::msg("truncation window must be at least 1"));
        }
        if config.batch_size == 0 {
            return Err(Error::msg("batch size must be at least 1"));
        }
        model.prepare_training(config.window)?;

        let mut params = Vec::new();
        model.add_parameters(&mut params);
        for p in &params {
            rule.add_parameter(p.clone())?;
        }
        let clipper = config
            .clip
            .map(|(min, max)| GradientClipper::new(params.clone(), min, max));

        let derivatives = model
            .outputs()
            .iter()
            .map(Tensor::empty_clone)
            .collect::<Result<Vec<_>>>()?;

        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Trainer {
            model,
            loss,
            rule,
            data,
            config,
            clipper,
            derivatives,
            rng,
            ended: false,
        })
    }

    pub fn train(&mut self, epochs: usize) -> Result<TrainReport> {
        let mut history = Vec::with_capacity(epochs);
        let mut final_loss = 0.0;
        for epoch in 0..epochs {
            let loss = self.train_epoch()?;
            log::info!("epoch {epoch}: loss {loss}");
            history.push(EpochLog { epoch, loss });
            final_loss = loss;
        }
        Ok(TrainReport {
            epochs,
            final_loss,
            history,
        })
    }

    fn train_epoch(&mut self) -> Result<f32> {
        if self.config.shuffle {
            self.data.shuffle(&mut self.rng);
        }
        self.data.reset_data();

        let mut epoch_loss = 0.0f32;
        let mut loss_steps = 0usize;
        let mut pending = 0usize;
        loop {
            let seq_targets = self.data.output_steps().max(1);
            while let Some(step) = self.data.next_step() {
                self.model.run(&step.inputs)?;
                let Some(targets) = step.targets else {
                    continue;
                };

                let outputs = self.model.outputs();
                if targets.len() != outputs.len() {
                    return Err(Error::msg(format!(
                        "step carries {} targets for {} outputs",
                        targets.len(),
                        outputs.len()
                    )));
                }
                // Scale so one update averages over the batch and over the
                // sequence's target steps.
                let scale = 1.0 / (self.config.batch_size * seq_targets) as f32;
                for ((out, target), d) in
                    outputs.iter().zip(&targets).zip(&self.derivatives)
                {
                    epoch_loss += self.loss.loss(out, target)?;
                    self.loss.derivative(out, target, d, true)?;
                    d.scale(scale)?;
                }
                loss_steps += 1;
                self.model.backpropagate(&self.derivatives, 0)?;

                pending += 1;
                if pending == self.config.batch_size {
                    self.apply_update()?;
                    pending = 0;
                }
            }
            self.model.reset()?;
            if !self.data.advance_sequence() {
                break;
            }
        }
        if pending > 0 {
            self.apply_update()?;
        }
        Ok(epoch_loss / loss_steps.max(1) as f32)
    }

    fn apply_update(&mut self) -> Result<()> {
        if let Some(clipper) = &self.clipper {
            let norm = clipper.clip()?;
            log::debug!("gradient norm before update: {norm}");
        }
        self.rule.apply_all()
    }

    /// Release training scratch. The model can keep running inference.
    pub fn finish(mut self) -> Result<()> {
        self.ended = true;
        self.model.end_training()
    }
}

impl<L: Loss, U: UpdateRule, D: DataIterator> Drop for Trainer<L, U, D> {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.model.end_training();
        }
    }
}
