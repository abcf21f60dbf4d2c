use serde::{Deserialize, Serialize};
use std::{ops::AddAssign, time::Duration};

/// Criteria (loss and accuracy).
pub mod criterion;

/// Confusion matrix and misclassifications.
pub mod analysis;

/// Neural networks.
pub mod neural_network;

/// Training / Testing statistics.
///
/// Accumulated over the batches of an epoch.
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: Option<f32>,
    correct: Option<usize>,
}

impl Stats {
    /// Stats for a batch of `count` samples with mean `loss` and `correct` predictions.
    pub fn new(count: usize, loss: Option<f32>, correct: Option<usize>) -> Self {
        Self {
            count,
            loss: loss.map(|loss| loss * count as f32),
            correct,
        }
    }
    /// The number of samples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The mean loss.
    pub fn mean_loss(&self) -> Option<f32> {
        if self.count > 0 {
            Some(self.loss? / self.count as f32)
        } else {
            None
        }
    }
    /// The number of correct predictions.
    pub fn correct(&self) -> Option<usize> {
        self.correct
    }
    /// The fraction of correct predictions.
    pub fn accuracy(&self) -> Option<f32> {
        if self.count > 0 {
            Some(self.correct? as f32 / self.count as f32)
        } else {
            None
        }
    }
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Self) {
        fn add<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a + b),
                (a, None) => a,
                (None, b) => b,
            }
        }
        self.count += rhs.count;
        self.loss = add(self.loss, rhs.loss);
        self.correct = add(self.correct, rhs.correct);
    }
}

/// Statistics of an epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// The epoch, starting at 1.
    pub epoch: usize,
    /// The learning rate used.
    pub learning_rate: f32,
    /// Time spent training and evaluating.
    pub elapsed: Duration,
    /// Training stats.
    pub train: Stats,
    /// Test stats, if evaluated this epoch.
    pub test: Option<Stats>,
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    /// The number of completed epochs.
    pub epoch: usize,
    /// Time of the last epoch.
    pub epoch_time: Duration,
    /// Total time.
    pub total_time: Duration,
    /// Training stats of the last epoch.
    pub train: Stats,
    /// The most recent test stats.
    pub test: Option<Stats>,
}

impl Summary {
    /// Accumulates the stats of a completed epoch.
    pub fn push(&mut self, stats: &EpochStats) {
        self.epoch = stats.epoch;
        self.epoch_time = stats.elapsed;
        self.total_time += stats.elapsed;
        self.train = stats.train;
        if stats.test.is_some() {
            self.test = stats.test;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn stats_accumulate() {
        let mut stats = Stats::default();
        assert_eq!(stats.mean_loss(), None);
        stats += Stats::new(10, Some(2.), Some(4));
        stats += Stats::new(30, Some(1.), Some(26));
        assert_eq!(stats.count(), 40);
        assert_relative_eq!(stats.mean_loss().unwrap(), 1.25);
        assert_relative_eq!(stats.accuracy().unwrap(), 0.75);
    }

    #[test]
    fn summary_keeps_last_test() {
        let mut summary = Summary::default();
        let mut stats = EpochStats {
            epoch: 1,
            learning_rate: 0.1,
            elapsed: Duration::from_secs(2),
            train: Stats::new(1, Some(1.), Some(1)),
            test: Some(Stats::new(1, Some(0.5), Some(1))),
        };
        summary.push(&stats);
        stats.epoch = 2;
        stats.test = None;
        summary.push(&stats);
        assert_eq!(summary.epoch, 2);
        assert_eq!(summary.total_time, Duration::from_secs(4));
        assert!(summary.test.is_some());
    }
}
