// Tests for vole-train: update rules, clipping, data iteration, trainer

use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use vole_accel::EmuDevice;
use vole_core::{Error, Tensor};
use vole_nn::{Activation, Dense, Mse, Unit};
use vole_train::{
    build_sequence, Adam, ArrayDataIterator, DataIterator, GradientClipper, SequenceData,
    SequenceKind, Sgd, Step, Trainer, TrainerConfig, UpdateRule,
};

fn approx(a: f32, b: f32) {
    assert!((a - b).abs() < 1e-4, "{a} !~ {b}");
}

fn approx_vec(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        approx(*x, *y);
    }
}

fn param(values: &[f32], grad: &[f32]) -> Tensor {
    let p = Tensor::host_from(&[values.len()], values.to_vec()).unwrap();
    p.create_gradient().unwrap();
    p.gradient().unwrap().update_raw_data(grad).unwrap();
    p
}

// Update rules

#[test]
fn sgd_steps_against_the_gradient_and_zeroes_it() {
    let p = param(&[1.0, 2.0], &[0.5, -0.5]);
    let mut sgd = Sgd::new(0.1);
    sgd.add_parameter(p.clone()).unwrap();
    sgd.apply_all().unwrap();
    approx_vec(&p.to_vec().unwrap(), &[0.95, 2.05]);
    approx_vec(&p.gradient().unwrap().to_vec().unwrap(), &[0.0, 0.0]);
}

#[test]
fn update_rules_reject_parameters_without_gradients() {
    let p = Tensor::host(&[2]).unwrap();
    assert!(matches!(
        Sgd::new(0.1).add_parameter(p.clone()),
        Err(Error::MissingGradient)
    ));
    assert!(matches!(
        Adam::new(0.1).add_parameter(p),
        Err(Error::MissingGradient)
    ));
}

#[test]
fn adam_first_step_is_a_signed_learning_rate_step() {
    // After one step the bias correction cancels the moment decay, so the
    // update is close to lr * sign(g).
    let p = param(&[1.0], &[0.5]);
    let mut adam = Adam::new(0.1);
    adam.add_parameter(p.clone()).unwrap();
    adam.apply_all().unwrap();
    approx_vec(&p.to_vec().unwrap(), &[0.9]);
    approx_vec(&p.gradient().unwrap().to_vec().unwrap(), &[0.0]);
}

#[test]
fn adam_host_and_accelerator_agree() {
    let ctx = EmuDevice::context(0);
    let values = vec![0.2, -0.4, 0.6, 0.1];
    let grads = vec![0.3, 0.3, -0.2, 0.05];

    let host = param(&values, &grads);
    let dev = Tensor::accel_from(&ctx, &[4], &values).unwrap();
    dev.create_gradient().unwrap();
    dev.gradient().unwrap().update_raw_data(&grads).unwrap();

    let mut a = Adam::new(0.05);
    let mut b = Adam::new(0.05);
    a.add_parameter(host.clone()).unwrap();
    b.add_parameter(dev.clone()).unwrap();
    for _ in 0..3 {
        host.gradient().unwrap().update_raw_data(&grads).unwrap();
        dev.gradient().unwrap().update_raw_data(&grads).unwrap();
        a.apply_all().unwrap();
        b.apply_all().unwrap();
    }
    approx_vec(&host.to_vec().unwrap(), &dev.to_vec().unwrap());
}

// Gradient clipping

#[test]
fn clipper_scales_down_an_oversized_norm() {
    let p = param(&[0.0, 0.0], &[3.0, 4.0]);
    let clipper = GradientClipper::new(vec![p.clone()], 1e-6, 1.0);
    let norm = clipper.clip().unwrap();
    approx(norm, 5.0);
    approx_vec(&p.gradient().unwrap().to_vec().unwrap(), &[0.6, 0.8]);
}

#[test]
fn clipper_scales_up_below_the_minimum() {
    let p = param(&[0.0, 0.0], &[0.3, 0.4]);
    let clipper = GradientClipper::new(vec![p.clone()], 1.0, 10.0);
    clipper.clip().unwrap();
    approx_vec(&p.gradient().unwrap().to_vec().unwrap(), &[0.6, 0.8]);
}

#[test]
fn clipper_leaves_in_range_and_zero_gradients_alone() {
    let p = param(&[0.0], &[0.5]);
    let clipper = GradientClipper::new(vec![p.clone()], 0.1, 1.0);
    clipper.clip().unwrap();
    approx_vec(&p.gradient().unwrap().to_vec().unwrap(), &[0.5]);

    let zero = param(&[0.0], &[0.0]);
    let clipper = GradientClipper::new(vec![zero.clone()], 0.1, 1.0);
    let norm = clipper.clip().unwrap();
    approx(norm, 0.0);
    approx_vec(&zero.gradient().unwrap().to_vec().unwrap(), &[0.0]);
}

#[test]
fn clipper_norm_spans_all_parameters() {
    let a = param(&[0.0], &[3.0]);
    let b = param(&[0.0], &[4.0]);
    let clipper = GradientClipper::new(vec![a.clone(), b.clone()], 1e-6, 1.0);
    let norm = clipper.clip().unwrap();
    approx(norm, 5.0);
    approx_vec(&a.gradient().unwrap().to_vec().unwrap(), &[0.6]);
    approx_vec(&b.gradient().unwrap().to_vec().unwrap(), &[0.8]);
}

// Sequence data

fn scalar_step(x: f32, y: Option<f32>) -> Step {
    Step {
        inputs: vec![Tensor::host_from(&[1], vec![x]).unwrap()],
        targets: y.map(|y| vec![Tensor::host_from(&[1], vec![y]).unwrap()]),
    }
}

#[test]
fn build_sequence_places_targets_per_kind() {
    let inputs = |n: usize| {
        (0..n)
            .map(|i| vec![Tensor::host_from(&[1], vec![i as f32]).unwrap()])
            .collect::<Vec<_>>()
    };
    let targets = |n: usize| {
        (0..n)
            .map(|i| vec![Tensor::host_from(&[1], vec![i as f32]).unwrap()])
            .collect::<Vec<_>>()
    };

    let seq = build_sequence(inputs(4), targets(4), SequenceKind::ManyToMany, 0).unwrap();
    assert!(seq.steps.iter().all(|s| s.targets.is_some()));

    let seq = build_sequence(inputs(4), targets(2), SequenceKind::DelayedManyToMany, 2).unwrap();
    assert!(seq.steps[0].targets.is_none());
    assert!(seq.steps[1].targets.is_none());
    assert!(seq.steps[2].targets.is_some());
    assert_eq!(seq.target_steps(), 2);

    let seq = build_sequence(inputs(4), targets(1), SequenceKind::ManyToOne, 0).unwrap();
    assert_eq!(seq.target_steps(), 1);
    assert!(seq.steps[3].targets.is_some());

    // Mismatched target count fails up front.
    assert!(build_sequence(inputs(4), targets(3), SequenceKind::ManyToMany, 0).is_err());
}

#[test]
fn iterator_walks_steps_then_sequences() {
    let seqs = vec![
        SequenceData {
            steps: vec![scalar_step(1.0, Some(1.0)), scalar_step(2.0, Some(2.0))],
        },
        SequenceData {
            steps: vec![scalar_step(3.0, None), scalar_step(4.0, Some(4.0))],
        },
    ];
    let mut it = ArrayDataIterator::new(seqs).unwrap();
    assert_eq!(it.sequence_count(), 2);
    assert_eq!(it.output_steps(), 2);

    let mut seen = Vec::new();
    loop {
        while let Some(step) = it.next_step() {
            seen.push(step.inputs[0].to_vec().unwrap()[0]);
        }
        if !it.advance_sequence() {
            break;
        }
    }
    assert_eq!(seen, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(it.output_steps(), 1);

    it.reset_data();
    assert_eq!(it.next_step().unwrap().inputs[0].to_vec().unwrap()[0], 1.0);
    it.reset_sequence();
    assert_eq!(it.next_step().unwrap().inputs[0].to_vec().unwrap()[0], 1.0);
}

#[test]
fn shuffle_reorders_sequences_deterministically() {
    let make = || {
        ArrayDataIterator::new(
            (0..8)
                .map(|i| SequenceData {
                    steps: vec![scalar_step(i as f32, None)],
                })
                .collect(),
        )
        .unwrap()
    };
    let walk = |it: &mut ArrayDataIterator| {
        let mut order = Vec::new();
        it.reset_data();
        loop {
            while let Some(step) = it.next_step() {
                order.push(step.inputs[0].to_vec().unwrap()[0]);
            }
            if !it.advance_sequence() {
                break;
            }
        }
        order
    };

    let mut a = make();
    let mut b = make();
    a.shuffle(&mut StdRng::seed_from_u64(5));
    b.shuffle(&mut StdRng::seed_from_u64(5));
    let order_a = walk(&mut a);
    assert_eq!(order_a, walk(&mut b));

    let mut c = make();
    c.shuffle(&mut StdRng::seed_from_u64(6));
    assert_ne!(order_a, walk(&mut c));

    // Shuffling permutes, never drops.
    let mut sorted = order_a.clone();
    sorted.sort_by(f32::total_cmp);
    assert_eq!(sorted, (0..8).map(|i| i as f32).collect::<Vec<_>>());
}

// Trainer

fn linear_data(slope: f32) -> Vec<SequenceData> {
    (1..=4)
        .map(|x| SequenceData {
            steps: vec![scalar_step(x as f32, Some(slope * x as f32))],
        })
        .collect()
}

#[test]
fn trainer_reduces_the_loss_on_a_linear_task() {
    let mut rng = StdRng::seed_from_u64(3);
    let model = Dense::host(1, 1, Activation::Identity, &mut rng).unwrap();
    let data = ArrayDataIterator::new(linear_data(2.0)).unwrap();
    let config = TrainerConfig {
        window: 1,
        batch_size: 1,
        shuffle: true,
        clip: None,
        seed: 1,
    };
    let mut trainer = Trainer::new(model.clone(), Mse, Sgd::new(0.05), data, config).unwrap();
    let report = trainer.train(60).unwrap();
    assert_eq!(report.history.len(), 60);
    assert!(
        report.final_loss < report.history[0].loss / 10.0,
        "loss went from {} to {}",
        report.history[0].loss,
        report.final_loss
    );
    trainer.finish().unwrap();

    // The fitted map is close to y = 2x.
    model
        .run(&[Tensor::host_from(&[1], vec![3.0]).unwrap()])
        .unwrap();
    let y = model.outputs()[0].to_vec().unwrap()[0];
    assert!((y - 6.0).abs() < 0.5, "got {y}");
}

#[test]
fn trainer_with_clipping_and_batching_still_converges() {
    let mut rng = StdRng::seed_from_u64(3);
    let model = Dense::host(1, 1, Activation::Identity, &mut rng).unwrap();
    let data = ArrayDataIterator::new(linear_data(1.0)).unwrap();
    let config = TrainerConfig {
        window: 1,
        batch_size: 2,
        shuffle: false,
        clip: Some((1e-6, 1.0)),
        seed: 1,
    };
    let mut trainer = Trainer::new(model, Mse, Adam::new(0.05), data, config).unwrap();
    let report = trainer.train(80).unwrap();
    assert!(report.final_loss < report.history[0].loss);
    trainer.finish().unwrap();
}

#[test]
fn trainer_releases_the_model_on_finish() {
    let mut rng = StdRng::seed_from_u64(3);
    let model = Dense::host(1, 1, Activation::Identity, &mut rng).unwrap();
    let data = ArrayDataIterator::new(linear_data(1.0)).unwrap();
    let trainer = Trainer::new(
        model.clone(),
        Mse,
        Sgd::new(0.1),
        data,
        TrainerConfig::default(),
    )
    .unwrap();
    trainer.finish().unwrap();
    // The model is back in its unprepared state and can be prepared anew.
    assert!(!model.weight().has_gradient());
    model.prepare_training(1).unwrap();
}

#[test]
fn trainer_rejects_degenerate_configs() {
    let mut rng = StdRng::seed_from_u64(3);
    let data = ArrayDataIterator::new(linear_data(1.0)).unwrap();
    let model = Dense::host(1, 1, Activation::Identity, &mut rng).unwrap();
    let bad = TrainerConfig {
        window: 0,
        ..TrainerConfig::default()
    };
    assert!(Trainer::new(model as Rc<dyn Unit>, Mse, Sgd::new(0.1), data, bad).is_err());
}
