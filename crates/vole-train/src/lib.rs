// vole-train — update rules, clipping, sequence data and the trainer
//
// Everything outside the differentiable graph itself: optimizers
// consuming accumulated gradients (`optim`), global-norm clipping
// (`clip`), the sequence data contract (`data`), and the driver walking
// epochs over all of it (`trainer`).

pub mod clip;
pub mod data;
pub mod optim;
pub mod trainer;

pub use clip::GradientClipper;
pub use data::{
    build_sequence, ArrayDataIterator, DataIterator, SequenceData, SequenceKind, Step,
};
pub use optim::{Adam, Sgd, UpdateRule};
pub use trainer::{EpochLog, TrainReport, Trainer, TrainerConfig};
