use super::{
    autograd::Variable4,
    layer::{Forward, Layer},
    lenet5::LeNet5,
    optimizer::{Optimizer, SGD},
};
use crate::{
    dataset::Split,
    error::Error,
    learn::{
        criterion::{Accuracy, Criterion, MapLoss},
        EpochStats, Stats, Summary,
    },
    result::Result,
};
use anyhow::anyhow;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Instant};

/// Learning rate schedule.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRate {
    /// The same rate every epoch.
    Constant(f32),
    /// The global schedule of the paper.
    ///
    /// 0.0005 for 2 epochs, 0.0002 for 3, 0.0001 for 3, 0.00005 for 4 and 0.00001
    /// thereafter.
    Paper,
}

impl Default for LearningRate {
    fn default() -> Self {
        Self::Constant(0.01)
    }
}

impl LearningRate {
    /// The learning rate for `epoch`, starting at 1.
    pub fn at_epoch(&self, epoch: usize) -> f32 {
        match self {
            Self::Constant(learning_rate) => *learning_rate,
            Self::Paper => match epoch {
                0..=2 => 0.0005,
                3..=5 => 0.0002,
                6..=8 => 0.0001,
                9..=12 => 0.00005,
                _ => 0.00001,
            },
        }
    }
}

/// Training configuration.
///
/// Deserializes with defaults for missing fields.
///
///```
/// # use lenet5::{result::Result, learn::neural_network::trainer::{LearningRate, TrainConfig}};
/// # fn main() -> Result<()> {
/// let config: TrainConfig = serde_json::from_str(r#"{ "epochs": 2, "learning_rate": "paper" }"#)?;
/// assert_eq!(config.batch_size, 32);
/// assert_eq!(config.learning_rate, LearningRate::Paper);
/// config.validate()?;
/// # Ok(())
/// # }
///```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// The number of epochs. Default is 20.
    pub epochs: usize,
    /// The training batch size. Default is 32.
    pub batch_size: usize,
    /// The evaluation batch size. Default is 1000.
    pub test_batch_size: usize,
    /// The learning rate schedule. Default is 0.01.
    pub learning_rate: LearningRate,
    /// SGD momentum. Default is 0.
    pub momentum: f32,
    /// Evaluate every `eval_interval` epochs, and after the last. Default is 1.
    pub eval_interval: usize,
    /// Shuffle the training samples each epoch. Default is true.
    pub shuffle: bool,
    /// Seed for shuffling. Default is 0.
    pub seed: u64,
    /// The rubbish class constant of [`MapLoss`]. Default is None (infinite).
    pub map_j: Option<f32>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 32,
            test_batch_size: 1000,
            learning_rate: LearningRate::default(),
            momentum: 0.,
            eval_interval: 1,
            shuffle: true,
            seed: 0,
            map_j: None,
        }
    }
}

impl TrainConfig {
    /// Loads a json config from `path`.
    ///
    /// **Errors**
    ///
    /// The file could not be read or parsed, or the config is invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)
            .map_err(|e| anyhow!("Unable to parse config {path:?}: {e}"))?;
        config.validate()?;
        Ok(config)
    }
    /// Checks the config.
    ///
    /// **Errors**
    ///
    /// [`Error::InvalidConfig`] if a batch size or the eval interval is 0, a learning rate is
    /// not positive and finite, or momentum is not in \[0, 1).
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(Error::InvalidConfig(msg).into()) };
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return invalid(format!(
                "batch sizes must be positive, found {} and {}",
                self.batch_size, self.test_batch_size
            ));
        }
        if self.eval_interval == 0 {
            return invalid("eval_interval must be positive".into());
        }
        // the paper schedule is constant after epoch 13
        for epoch in 1..=self.epochs.clamp(1, 13) {
            let learning_rate = self.learning_rate.at_epoch(epoch);
            if !(learning_rate.is_finite() && learning_rate > 0.) {
                return invalid(format!(
                    "learning rate {learning_rate} at epoch {epoch} must be positive"
                ));
            }
        }
        if !(0. ..1.).contains(&self.momentum) {
            return invalid(format!("momentum {} must be in [0, 1)", self.momentum));
        }
        if self.map_j.map_or(false, f32::is_nan) {
            return invalid("map_j is NaN".into());
        }
        Ok(())
    }
}

/// The state of a [`Trainer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerState {
    /// Not started.
    Idle,
    /// Training an epoch, starting at 1.
    TrainingEpoch(usize),
    /// Evaluating after an epoch.
    Evaluating(usize),
    /// Finished, or stopped after divergence.
    Done,
}

/// Trains a [`LeNet5`] with SGD and the [`MapLoss`].
///
/// The state machine is advanced with [`.step()`](Self::step), or run to completion with
/// [`.fit()`](Self::fit).
#[derive(Debug)]
pub struct Trainer {
    model: LeNet5,
    config: TrainConfig,
    optimizer: SGD,
    criterion: MapLoss,
    rng: StdRng,
    state: TrainerState,
    pending: Option<EpochStats>,
    summary: Summary,
    history: Vec<EpochStats>,
}

impl Trainer {
    /// Creates a trainer.
    ///
    /// **Errors**
    ///
    /// The config is invalid, see [`TrainConfig::validate`].
    pub fn new(model: LeNet5, config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = SGD::builder().momentum(config.momentum).build();
        let criterion = MapLoss::new(config.map_j);
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            model,
            config,
            optimizer,
            criterion,
            rng,
            state: TrainerState::Idle,
            pending: None,
            summary: Summary::default(),
            history: Vec::new(),
        })
    }
    /// The model.
    pub fn model(&self) -> &LeNet5 {
        &self.model
    }
    /// Returns the model.
    pub fn into_model(self) -> LeNet5 {
        self.model
    }
    /// The config.
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }
    /// The state.
    pub fn state(&self) -> TrainerState {
        self.state
    }
    /// Summary of the completed epochs.
    pub fn summary(&self) -> &Summary {
        &self.summary
    }
    /// Stats of each completed epoch.
    pub fn history(&self) -> &[EpochStats] {
        &self.history
    }
    fn should_evaluate(&self, epoch: usize) -> bool {
        epoch % self.config.eval_interval == 0 || epoch == self.config.epochs
    }
    fn next_state(&self, epoch: usize) -> TrainerState {
        if epoch < self.config.epochs {
            TrainerState::TrainingEpoch(epoch + 1)
        } else {
            TrainerState::Done
        }
    }
    fn abort(&mut self) {
        self.pending = None;
        if self.state != TrainerState::Done {
            self.transition(TrainerState::Done);
        }
    }
    fn transition(&mut self, state: TrainerState) {
        tracing::info!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }
    fn finish_epoch(&mut self, stats: EpochStats) {
        tracing::info!(
            "epoch: {} lr: {} elapsed: {:?} train_loss: {:?} train_accuracy: {:?} test_loss: {:?} test_accuracy: {:?}",
            stats.epoch,
            stats.learning_rate,
            stats.elapsed,
            stats.train.mean_loss(),
            stats.train.accuracy(),
            stats.test.and_then(|x| x.mean_loss()),
            stats.test.and_then(|x| x.accuracy()),
        );
        self.summary.push(&stats);
        self.history.push(stats);
    }
    /// Advances the state machine.
    ///
    /// - Idle: moves to the first epoch, or Done if there are no epochs.
    /// - TrainingEpoch: trains one epoch on `train`.
    /// - Evaluating: measures loss and accuracy on `test`.
    /// - Done: does nothing.
    ///
    /// Returns the new state.
    ///
    /// **Errors**
    ///
    /// [`Error::Divergence`] if the loss is not finite, after which the trainer is Done.
    pub fn step(&mut self, train: &Split, test: &Split) -> Result<TrainerState> {
        match self.state {
            TrainerState::Idle => {
                let state = if self.config.epochs > 0 {
                    TrainerState::TrainingEpoch(1)
                } else {
                    TrainerState::Done
                };
                self.transition(state);
            }
            TrainerState::TrainingEpoch(epoch) => {
                let start = Instant::now();
                let learning_rate = self.config.learning_rate.at_epoch(epoch);
                let train = self.train_epoch(train, epoch)?;
                let stats = EpochStats {
                    epoch,
                    learning_rate,
                    elapsed: start.elapsed(),
                    train,
                    test: None,
                };
                if self.should_evaluate(epoch) {
                    self.pending.replace(stats);
                    self.transition(TrainerState::Evaluating(epoch));
                } else {
                    self.finish_epoch(stats);
                    self.transition(self.next_state(epoch));
                }
            }
            TrainerState::Evaluating(epoch) => {
                let start = Instant::now();
                let test = match self.evaluate(test) {
                    Ok(test) => test,
                    Err(error) => {
                        self.abort();
                        return Err(error);
                    }
                };
                let mut stats = self
                    .pending
                    .take()
                    .ok_or_else(|| anyhow!("Evaluating epoch {epoch} without training stats!"))?;
                stats.elapsed += start.elapsed();
                stats.test.replace(test);
                self.finish_epoch(stats);
                self.transition(self.next_state(epoch));
            }
            TrainerState::Done => (),
        }
        Ok(self.state)
    }
    /// Runs until Done, calling `f` after each epoch.
    ///
    /// Returns the summary.
    pub fn fit<F>(&mut self, train: &Split, test: &Split, mut f: F) -> Result<Summary>
    where
        F: FnMut(&Self, &EpochStats) -> Result<()>,
    {
        while self.state != TrainerState::Done {
            let epochs = self.history.len();
            self.step(train, test)?;
            if self.history.len() > epochs {
                if let Some(stats) = self.history.last() {
                    f(self, stats)?;
                }
            }
        }
        Ok(self.summary.clone())
    }
    /// Trains the model for one epoch on `train`.
    ///
    /// Batches are shuffled if configured. For each batch, computes the loss, performs the
    /// backward pass and updates the parameters.
    ///
    /// **Errors**
    ///
    /// - [`Error::InvalidInput`] if the images are not \[N, 1, 32, 32\].
    /// - [`Error::Divergence`] if the loss is not finite.
    ///
    /// On error training is disabled and the state is Done.
    pub fn train_epoch(&mut self, train: &Split, epoch: usize) -> Result<Stats> {
        let result = self.train_batches(train, epoch);
        let reset = self.model.set_training(false);
        match result {
            Ok(stats) => {
                reset?;
                Ok(stats)
            }
            Err(error) => {
                self.abort();
                Err(error)
            }
        }
    }
    fn train_batches(&mut self, train: &Split, epoch: usize) -> Result<Stats> {
        LeNet5::check_input(train.images().shape())?;
        let learning_rate = self.config.learning_rate.at_epoch(epoch);
        let batch_size = self.config.batch_size;
        let batches = if self.config.shuffle {
            train.shuffled_batches(batch_size, &mut self.rng)
        } else {
            train.batches(batch_size)
        };
        self.model.set_training(true)?;
        let mut stats = Stats::default();
        for (batch, (x, t)) in batches.enumerate() {
            let y = self.model.forward(Variable4::from(x))?;
            let correct = Accuracy.eval(y.value().view(), t.view())?;
            let loss = self.criterion.eval(y, t.view())?;
            let loss_value = loss.value()[()];
            if !loss_value.is_finite() {
                tracing::warn!(
                    "Training diverged at epoch {} batch {}, loss = {}!",
                    epoch,
                    batch,
                    loss_value
                );
                return Err(Error::Divergence {
                    epoch,
                    batch,
                    loss: loss_value,
                }
                .into());
            }
            loss.backward()?;
            for parameter in self.model.parameters_mut()? {
                self.optimizer.update(learning_rate, parameter)?;
            }
            tracing::debug!("epoch: {} batch: {} loss: {}", epoch, batch, loss_value);
            stats += Stats::new(t.len(), Some(loss_value), Some(correct));
        }
        Ok(stats)
    }
    /// Measures the loss and accuracy on `split`, without modifying the model.
    pub fn evaluate(&self, split: &Split) -> Result<Stats> {
        let mut stats = Stats::default();
        for (x, t) in split.batches(self.config.test_batch_size) {
            let y = self.model.infer(x.view())?;
            let loss = self.criterion.eval(y.view(), t.view())?;
            let correct = Accuracy.eval(y.view(), t.view())?;
            stats += Stats::new(t.len(), Some(loss), Some(correct));
        }
        Ok(stats)
    }
    /// The mean loss on `split`.
    ///
    /// **Errors**
    ///
    /// The split is empty.
    pub fn loss(&self, split: &Split) -> Result<f32> {
        self.evaluate(split)?
            .mean_loss()
            .ok_or_else(|| anyhow!("Unable to compute the loss of an empty split!"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array1};

    fn split(n: usize, value: f32) -> Result<Split> {
        let images = Array::from_shape_fn([n, 1, 32, 32], |(i, _, h, w)| {
            if (h + w + i) % 3 == 0 {
                value
            } else {
                -value
            }
        });
        let classes = Array1::from_shape_fn(n, |i| (i % 10) as u8);
        Split::new(images, classes)
    }

    #[test]
    fn paper_schedule() {
        let rates: Vec<f32> = (1..=14).map(|e| LearningRate::Paper.at_epoch(e)).collect();
        assert_eq!(&rates[..2], &[0.0005; 2]);
        assert_eq!(&rates[2..5], &[0.0002; 3]);
        assert_eq!(&rates[5..8], &[0.0001; 3]);
        assert_eq!(&rates[8..12], &[0.00005; 4]);
        assert_eq!(&rates[12..], &[0.00001; 2]);
    }

    #[test]
    fn validate_config() {
        assert!(TrainConfig::default().validate().is_ok());
        let invalid = [
            TrainConfig {
                batch_size: 0,
                ..TrainConfig::default()
            },
            TrainConfig {
                eval_interval: 0,
                ..TrainConfig::default()
            },
            TrainConfig {
                learning_rate: LearningRate::Constant(-0.1),
                ..TrainConfig::default()
            },
            TrainConfig {
                learning_rate: LearningRate::Constant(f32::NAN),
                ..TrainConfig::default()
            },
            TrainConfig {
                momentum: 1.,
                ..TrainConfig::default()
            },
        ];
        for config in invalid {
            let error = config.validate().unwrap_err();
            assert!(matches!(
                error.downcast_ref::<Error>(),
                Some(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn config_from_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "epochs": 3, "learning_rate": { "constant": 0.05 }, "map_j": 2.0 }"#,
        )?;
        let config = TrainConfig::from_path(&path)?;
        assert_eq!(config.epochs, 3);
        assert_eq!(config.learning_rate, LearningRate::Constant(0.05));
        assert_eq!(config.map_j, Some(2.));
        assert_eq!(config.test_batch_size, 1000);
        std::fs::write(&path, r#"{ "batch_size": 0 }"#)?;
        assert!(TrainConfig::from_path(&path).is_err());
        Ok(())
    }

    #[test]
    fn state_machine() -> Result<()> {
        let train = split(4, 1.)?;
        let test = split(3, 1.)?;
        let model = LeNet5::builder().seed(0).build()?;
        let config = TrainConfig {
            epochs: 3,
            batch_size: 2,
            eval_interval: 2,
            ..TrainConfig::default()
        };
        let mut trainer = Trainer::new(model, config)?;
        assert_eq!(trainer.state(), TrainerState::Idle);
        let mut states = Vec::new();
        while trainer.state() != TrainerState::Done {
            states.push(trainer.step(&train, &test)?);
        }
        use TrainerState::*;
        assert_eq!(
            states,
            vec![
                TrainingEpoch(1),
                TrainingEpoch(2),
                Evaluating(2),
                TrainingEpoch(3),
                Evaluating(3),
                Done
            ]
        );
        let history = trainer.history();
        assert_eq!(history.len(), 3);
        assert!(history[0].test.is_none());
        assert_eq!(history[1].test.map(|x| x.count()), Some(3));
        assert_eq!(history[2].train.count(), 4);
        assert_eq!(trainer.summary().epoch, 3);
        // Done is terminal
        assert_eq!(trainer.step(&train, &test)?, Done);
        Ok(())
    }

    #[test]
    fn no_epochs() -> Result<()> {
        let train = split(2, 1.)?;
        let model = LeNet5::builder().seed(0).build()?;
        let config = TrainConfig {
            epochs: 0,
            ..TrainConfig::default()
        };
        let mut trainer = Trainer::new(model, config)?;
        let mut calls = 0;
        trainer.fit(&train, &train, |_, _| {
            calls += 1;
            Ok(())
        })?;
        assert_eq!(calls, 0);
        assert_eq!(trainer.state(), TrainerState::Done);
        Ok(())
    }

    #[test]
    fn divergence() -> Result<()> {
        let train = split(4, f32::NAN)?;
        let model = LeNet5::builder().seed(0).build()?;
        let mut trainer = Trainer::new(model, TrainConfig::default())?;
        let error = trainer
            .fit(&train, &train, |_, _| Ok(()))
            .unwrap_err();
        match error.downcast_ref::<Error>() {
            Some(Error::Divergence { epoch, batch, loss }) => {
                assert_eq!((*epoch, *batch), (1, 0));
                assert!(!loss.is_finite());
            }
            _ => panic!("expected divergence, found {error}"),
        }
        assert_eq!(trainer.state(), TrainerState::Done);
        assert!(trainer.model().parameters().iter().all(|p| !p.training()));
        Ok(())
    }

    #[test]
    fn unpadded_images_stop_training() -> Result<()> {
        let images = Array::from_elem([2, 1, 28, 28], 0.5f32);
        let train = Split::new(images, Array1::from_vec(vec![0, 1]))?;
        let model = LeNet5::builder().seed(0).build()?;
        let mut trainer = Trainer::new(model, TrainConfig::default())?;
        assert_eq!(trainer.step(&train, &train)?, TrainerState::TrainingEpoch(1));
        let error = trainer.step(&train, &train).unwrap_err();
        assert_eq!(
            error.downcast_ref::<Error>(),
            Some(&Error::InvalidInput {
                expected: vec![1, 32, 32],
                found: vec![2, 1, 28, 28],
            })
        );
        assert_eq!(trainer.state(), TrainerState::Done);
        assert!(trainer.model().parameters().iter().all(|p| !p.training()));
        assert!(trainer.history().is_empty());
        Ok(())
    }

    #[test]
    fn validate_many_epochs() {
        let config = TrainConfig {
            epochs: usize::MAX,
            learning_rate: LearningRate::Paper,
            ..TrainConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
