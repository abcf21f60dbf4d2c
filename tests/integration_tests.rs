use anyhow::Result;
use lenet5::{
    dataset::{Normalization, PrepareOptions, Split, CLASSES},
    error::Error,
    learn::{
        analysis::{most_confident_errors, ConfusionMatrix},
        neural_network::{
            lenet5::LeNet5,
            trainer::{LearningRate, TrainConfig, Trainer, TrainerState},
        },
    },
};
use libtest_mimic::{Arguments, Trial};
use ndarray::{Array, Array1, Array4};

fn main() {
    let args = Arguments::from_args();
    let tests = training_tests()
        .into_iter()
        .chain(analysis_tests())
        .chain(input_tests())
        .collect();
    libtest_mimic::run(&args, tests).exit()
}

fn test(name: &str, f: fn() -> Result<()>) -> Trial {
    Trial::test(name, move || f().map_err(|e| format!("{e:?}").into()))
}

/// Raw 28 x 28 digits, each class a bright square in its own position.
fn raw_digits(per_class: usize) -> (Array4<u8>, Array1<u8>) {
    let n = per_class * CLASSES;
    let classes = Array::from_shape_fn(n, |i| (i % CLASSES) as u8);
    let images = Array::from_shape_fn([n, 1, 28, 28], |(i, _, h, w)| {
        let class = i % CLASSES;
        let (top, left) = (4 + (class / 5) * 10, 2 + (class % 5) * 5);
        if (top..top + 8).contains(&h) && (left..left + 4).contains(&w) {
            255 - (i / CLASSES * 13 % 64) as u8
        } else {
            ((h * 3 + w + i) % 17) as u8
        }
    });
    (images, classes)
}

fn prepared_digits(per_class: usize) -> Result<Split> {
    let (images, classes) = raw_digits(per_class);
    let normalization = Normalization::from_images(images.view())?;
    PrepareOptions::default().prepare(images.view(), classes.view(), &normalization)
}

fn training_tests() -> Vec<Trial> {
    vec![
        test("loss_decreases_after_epoch", loss_decreases_after_epoch),
        test("divergence_stops_training", divergence_stops_training),
        test("fit_runs_all_epochs", fit_runs_all_epochs),
    ]
}

fn loss_decreases_after_epoch() -> Result<()> {
    let split = prepared_digits(1)?;
    let model = LeNet5::builder().seed(0).build()?;
    let config = TrainConfig {
        epochs: 1,
        batch_size: 10,
        learning_rate: LearningRate::Constant(0.001),
        shuffle: false,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(model, config)?;
    let before = trainer.loss(&split)?;
    assert_eq!(trainer.step(&split, &split)?, TrainerState::TrainingEpoch(1));
    assert_eq!(trainer.step(&split, &split)?, TrainerState::Evaluating(1));
    assert_eq!(trainer.step(&split, &split)?, TrainerState::Done);
    let after = trainer.loss(&split)?;
    assert!(after < before, "{after} >= {before}");
    let test = trainer.summary().test.expect("evaluated");
    assert_eq!(test.count(), 10);
    Ok(())
}

fn divergence_stops_training() -> Result<()> {
    let mut images = Array::from_elem([4, 1, 32, 32], 0.5f32);
    images[(2, 0, 16, 16)] = f32::NAN;
    let split = Split::new(images, Array::from_vec(vec![0, 1, 2, 3]))?;
    let model = LeNet5::builder().seed(0).build()?;
    let config = TrainConfig {
        epochs: 3,
        batch_size: 2,
        shuffle: false,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(model, config)?;
    let error = trainer
        .fit(&split, &split, |_, _| Ok(()))
        .expect_err("diverged");
    match error.downcast_ref::<Error>() {
        Some(Error::Divergence { epoch, batch, loss }) => {
            assert_eq!((*epoch, *batch), (1, 1));
            assert!(!loss.is_finite());
        }
        _ => panic!("expected divergence, found {error:?}"),
    }
    assert_eq!(trainer.state(), TrainerState::Done);
    assert!(trainer.history().is_empty());
    Ok(())
}

fn fit_runs_all_epochs() -> Result<()> {
    let split = prepared_digits(1)?;
    let model = LeNet5::builder().seed(1).build()?;
    let config = TrainConfig {
        epochs: 3,
        batch_size: 5,
        learning_rate: LearningRate::Paper,
        eval_interval: 2,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(model, config)?;
    let mut epochs = Vec::new();
    let summary = trainer.fit(&split, &split, |_, stats| {
        epochs.push((stats.epoch, stats.test.is_some()));
        Ok(())
    })?;
    assert_eq!(epochs, [(1, false), (2, true), (3, true)]);
    assert_eq!(summary.epoch, 3);
    assert_eq!(summary.train.count(), 10);
    assert_eq!(trainer.history()[0].learning_rate, 0.0005);
    assert_eq!(trainer.history()[2].learning_rate, 0.0002);
    Ok(())
}

fn analysis_tests() -> Vec<Trial> {
    vec![
        test("confusion_matrix_counts_classes", confusion_matrix_counts_classes),
        test("save_load_preserves_predictions", save_load_preserves_predictions),
    ]
}

fn confusion_matrix_counts_classes() -> Result<()> {
    let split = prepared_digits(3)?.select(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 13, 17, 22]);
    let model = LeNet5::builder().seed(2).build()?;
    let matrix = ConfusionMatrix::evaluate(&model, &split, 4)?;
    assert_eq!(matrix.row_sums().to_vec(), split.class_counts().to_vec());
    assert_eq!(matrix.total(), split.len());
    let predictions = model.predict(split.images())?;
    for (p, column) in matrix.column_sums().iter().enumerate() {
        assert_eq!(
            *column,
            predictions.iter().filter(|x| **x as usize == p).count()
        );
    }
    let errors = most_confident_errors(&model, &split, 4, split.len())?;
    assert_eq!(errors.len(), matrix.total() - matrix.counts().diag().sum());
    Ok(())
}

fn save_load_preserves_predictions() -> Result<()> {
    let split = prepared_digits(2)?;
    let model = LeNet5::builder().seed(3).trainable_prototypes(true).build()?;
    let config = TrainConfig {
        epochs: 1,
        batch_size: 4,
        ..TrainConfig::default()
    };
    let mut trainer = Trainer::new(model, config)?;
    trainer.fit(&split, &split, |_, _| Ok(()))?;
    let model = trainer.into_model();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.json");
    model.save(&path)?;
    let loaded = LeNet5::load(&path)?;
    assert_eq!(
        model.predict(split.images())?,
        loaded.predict(split.images())?
    );
    assert_eq!(model.infer(split.images())?, loaded.infer(split.images())?);
    Ok(())
}

fn input_tests() -> Vec<Trial> {
    vec![
        test("model_rejects_native_resolution", model_rejects_native_resolution),
        test("prepare_rejects_malformed", prepare_rejects_malformed),
        test("invalid_config", invalid_config),
    ]
}

fn model_rejects_native_resolution() -> Result<()> {
    let (images, _) = raw_digits(1);
    let model = LeNet5::builder().seed(0).build()?;
    let error = model
        .infer(images.mapv(f32::from).view())
        .expect_err("28 x 28 input");
    assert!(matches!(
        error.downcast_ref::<Error>(),
        Some(Error::InvalidInput { .. })
    ));
    Ok(())
}

fn prepare_rejects_malformed() -> Result<()> {
    let (images, classes) = raw_digits(1);
    let normalization = Normalization::from_images(images.view())?;
    let options = PrepareOptions::default();
    let error = options
        .prepare(images.view(), classes.slice(ndarray::s![..5]), &normalization)
        .expect_err("too few classes");
    assert_eq!(
        error.downcast_ref::<Error>(),
        Some(&Error::ShapeMismatch {
            expected: vec![10],
            found: vec![5],
        })
    );
    let small = Array4::<u8>::zeros([10, 1, 20, 20]);
    let error = options
        .prepare(small.view(), classes.view(), &normalization)
        .expect_err("20 x 20 images");
    assert!(matches!(
        error.downcast_ref::<Error>(),
        Some(Error::ShapeMismatch { .. })
    ));
    Ok(())
}

fn invalid_config() -> Result<()> {
    let model = LeNet5::builder().seed(0).build()?;
    let config = TrainConfig {
        batch_size: 0,
        ..TrainConfig::default()
    };
    let error = Trainer::new(model, config).expect_err("batch size 0");
    assert!(matches!(
        error.downcast_ref::<Error>(),
        Some(Error::InvalidConfig(_))
    ));
    Ok(())
}
