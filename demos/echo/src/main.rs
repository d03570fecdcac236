// Delayed echo — the classic recurrence smoke test
//
// The network sees one random bit per step and must emit the bit it saw
// DELAY steps earlier. Nothing in the current input carries the answer,
// so the only way to succeed is to carry state through the recurrent
// feedback and learn to rotate it. Trains in a few hundred epochs on a
// handful of short sequences.

use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vole_core::error::Result;
use vole_core::Tensor;
use vole_nn::{Activation, Chain, Dense, Mse, RecurrentChain, Unit};
use vole_train::{
    build_sequence, Adam, ArrayDataIterator, SequenceData, SequenceKind, Trainer, TrainerConfig,
};

const DELAY: usize = 2;
const STATE: usize = 4;
const SEQ_LEN: usize = 12;
const SEQUENCES: usize = 24;
const WINDOW: usize = 4;
const EPOCHS: usize = 300;

fn make_sequences(rng: &mut StdRng) -> Result<Vec<SequenceData>> {
    let mut out = Vec::with_capacity(SEQUENCES);
    for _ in 0..SEQUENCES {
        let bits: Vec<f32> = (0..SEQ_LEN).map(|_| rng.gen_range(0..2) as f32).collect();
        let inputs = bits
            .iter()
            .map(|&b| Ok(vec![Tensor::host_from(&[1], vec![b])?]))
            .collect::<Result<Vec<_>>>()?;
        let targets = bits[..SEQ_LEN - DELAY]
            .iter()
            .map(|&b| Ok(vec![Tensor::host_from(&[1], vec![b])?]))
            .collect::<Result<Vec<_>>>()?;
        out.push(build_sequence(
            inputs,
            targets,
            SequenceKind::DelayedManyToMany,
            DELAY,
        )?);
    }
    Ok(out)
}

fn main() -> Result<()> {
    env_logger::init();
    let mut rng = StdRng::seed_from_u64(42);

    let inner: Rc<dyn Unit> = Dense::host(1 + STATE, STATE, Activation::Tanh, &mut rng)?;
    let recurrent = RecurrentChain::new(1, STATE, vec![inner])?;
    let readout = Dense::host(STATE, 1, Activation::Sigmoid, &mut rng)?;
    let model = Chain::new();
    model.add_layer(recurrent)?;
    model.add_layer(readout)?;

    let data = ArrayDataIterator::new(make_sequences(&mut rng)?)?;
    let config = TrainerConfig {
        window: WINDOW,
        batch_size: 4,
        shuffle: true,
        clip: Some((1e-6, 5.0)),
        seed: 7,
    };
    let mut trainer = Trainer::new(model.clone(), Mse, Adam::new(0.01), data, config)?;

    let report = trainer.train(EPOCHS)?;
    println!(
        "trained {} epochs, final loss {:.6}",
        report.epochs, report.final_loss
    );
    trainer.finish()?;

    // Show the trained network echoing a fresh sequence.
    model.reset()?;
    let probe: Vec<f32> = (0..SEQ_LEN).map(|_| rng.gen_range(0..2) as f32).collect();
    println!("input : {probe:?}");
    let mut echoed = Vec::with_capacity(SEQ_LEN);
    for &b in &probe {
        model.run(&[Tensor::host_from(&[1], vec![b])?])?;
        echoed.push(model.outputs()[0].to_vec()?[0]);
    }
    let rounded: Vec<f32> = echoed.iter().map(|v| v.round()).collect();
    println!("output: {rounded:?} (expected the input shifted right by {DELAY})");
    Ok(())
}
