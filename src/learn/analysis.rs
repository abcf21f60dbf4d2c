use super::{
    criterion::{argmin, probabilities},
    neural_network::lenet5::LeNet5,
};
use crate::{dataset::Split, dataset::CLASSES, error::Error, result::Result};
use anyhow::ensure;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Counts of true vs predicted classes.
///
/// `counts[(class, predicted)]` is the number of samples of `class` predicted as `predicted`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Array2<usize>,
}

impl ConfusionMatrix {
    /// Counts `predictions` against `classes`.
    ///
    /// **Errors**
    /// - The lengths differ.
    /// - A class or prediction is not in 0..=9 ([`Error::InvalidLabel`]).
    pub fn from_classes(classes: ArrayView1<u8>, predictions: ArrayView1<u8>) -> Result<Self> {
        ensure!(
            classes.len() == predictions.len(),
            Error::ShapeMismatch {
                expected: classes.shape().to_vec(),
                found: predictions.shape().to_vec(),
            }
        );
        let mut counts = Array2::zeros([CLASSES, CLASSES]);
        for (class, predicted) in classes.iter().copied().zip(predictions.iter().copied()) {
            for label in [class, predicted] {
                if label as usize >= CLASSES {
                    return Err(Error::InvalidLabel(label).into());
                }
            }
            counts[(class as usize, predicted as usize)] += 1;
        }
        Ok(Self { counts })
    }
    /// Predicts `split` with `model` in batches of `batch_size` and counts the results.
    pub fn evaluate(model: &LeNet5, split: &Split, batch_size: usize) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive!");
        let mut predictions = Vec::with_capacity(split.len());
        for (x, _) in split.batches(batch_size) {
            predictions.extend(model.predict(x.view())?.iter().copied());
        }
        Self::from_classes(split.classes(), Array1::from(predictions).view())
    }
    /// The counts \[class, predicted\].
    pub fn counts(&self) -> ArrayView2<usize> {
        self.counts.view()
    }
    /// The total number of samples.
    pub fn total(&self) -> usize {
        self.counts.sum()
    }
    /// The number of samples of each class.
    pub fn row_sums(&self) -> Array1<usize> {
        self.counts.sum_axis(Axis(1))
    }
    /// The number of predictions of each class.
    pub fn column_sums(&self) -> Array1<usize> {
        self.counts.sum_axis(Axis(0))
    }
    /// The fraction of correct predictions, None if empty.
    pub fn accuracy(&self) -> Option<f32> {
        let total = self.total();
        if total > 0 {
            Some(self.counts.diag().sum() as f32 / total as f32)
        } else {
            None
        }
    }
    /// The accuracy of each class, None for classes without samples.
    pub fn per_class_accuracy(&self) -> Vec<Option<f32>> {
        self.counts
            .outer_iter()
            .enumerate()
            .map(|(class, row)| {
                let total = row.sum();
                if total > 0 {
                    Some(row[class] as f32 / total as f32)
                } else {
                    None
                }
            })
            .collect()
    }
}

impl Display for ConfusionMatrix {
    /// Rows are true classes, columns are predictions.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let width = self
            .counts
            .iter()
            .max()
            .map_or(1, |max| max.to_string().len())
            .max(3);
        write!(f, "{:>5} |", "")?;
        for predicted in 0..CLASSES {
            write!(f, " {predicted:>width$}")?;
        }
        writeln!(f, " | {:>6}", "acc")?;
        writeln!(f, "{}", "-".repeat(7 + CLASSES * (width + 1) + 9))?;
        for ((class, row), accuracy) in self
            .counts
            .outer_iter()
            .enumerate()
            .zip(self.per_class_accuracy())
        {
            write!(f, "{class:>5} |")?;
            for count in row.iter() {
                write!(f, " {count:>width$}")?;
            }
            match accuracy {
                Some(accuracy) => writeln!(f, " | {:>5.1}%", accuracy * 100.)?,
                None => writeln!(f, " | {:>6}", "-")?,
            }
        }
        if let Some(accuracy) = self.accuracy() {
            write!(f, "accuracy: {:.2}% of {}", accuracy * 100., self.total())?;
        }
        Ok(())
    }
}

/// A wrong prediction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Misclassification {
    /// The index of the sample in the split.
    pub index: usize,
    /// The true class.
    pub class: u8,
    /// The predicted class.
    pub predicted: u8,
    /// The probability of the predicted class, the softmax of the negated distances.
    pub confidence: f32,
}

/// The `k` wrong predictions with the highest confidence, most confident first.
///
/// Returns fewer than `k` when there are fewer errors.
pub fn most_confident_errors(
    model: &LeNet5,
    split: &Split,
    batch_size: usize,
    k: usize,
) -> Result<Vec<Misclassification>> {
    ensure!(batch_size > 0, "batch_size must be positive!");
    let mut errors = Vec::new();
    let mut index = 0;
    for (x, t) in split.batches(batch_size) {
        let output = model.infer(x.view())?;
        let probabilities = probabilities(output.view());
        for ((distances, p), class) in output
            .outer_iter()
            .zip(probabilities.outer_iter())
            .zip(t.iter().copied())
        {
            let predicted = argmin(distances);
            if predicted != class as usize {
                errors.push(Misclassification {
                    index,
                    class,
                    predicted: predicted as u8,
                    confidence: p[predicted],
                });
            }
            index += 1;
        }
    }
    errors.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    errors.truncate(k);
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    #[test]
    fn confusion_matrix() -> Result<()> {
        let classes = array![0u8, 0, 1, 2, 2, 2];
        let predictions = array![0u8, 1, 1, 2, 2, 0];
        let matrix = ConfusionMatrix::from_classes(classes.view(), predictions.view())?;
        assert_eq!(matrix.total(), 6);
        assert_eq!(matrix.counts()[(2, 0)], 1);
        assert_eq!(&matrix.row_sums().to_vec()[..3], &[2, 1, 3]);
        assert_eq!(&matrix.column_sums().to_vec()[..3], &[2, 2, 2]);
        assert_eq!(matrix.accuracy(), Some(4. / 6.));
        let per_class = matrix.per_class_accuracy();
        assert_eq!(per_class[1], Some(1.));
        assert_eq!(per_class[3], None);
        let text = matrix.to_string();
        assert_eq!(text.lines().count(), 2 + CLASSES + 1);
        assert!(text.contains("66.67%"));
        Ok(())
    }

    #[test]
    fn confusion_matrix_rejects() {
        assert!(ConfusionMatrix::from_classes(array![0u8].view(), array![0u8, 1].view()).is_err());
        let error = ConfusionMatrix::from_classes(array![0u8].view(), array![12u8].view())
            .unwrap_err();
        assert_eq!(error.downcast_ref::<Error>(), Some(&Error::InvalidLabel(12)));
    }

    #[test]
    fn errors_ranked() -> Result<()> {
        let model = LeNet5::builder().seed(3).build()?;
        let images = Array::from_shape_fn([20, 1, 32, 32], |(n, _, i, j)| {
            ((n * 7 + i * 3 + j) % 11) as f32 / 5. - 1.
        });
        let split = Split::new(images, Array1::from_shape_fn(20, |n| (n % 10) as u8))?;
        let predictions = model.predict(split.images())?;
        let wrong = predictions
            .iter()
            .zip(split.classes())
            .filter(|(p, c)| p != c)
            .count();
        let errors = most_confident_errors(&model, &split, 6, 5)?;
        assert_eq!(errors.len(), wrong.min(5));
        for pair in errors.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
        for error in errors.iter() {
            assert_ne!(error.class, error.predicted);
            assert_eq!(split.classes()[error.index], error.class);
            assert_eq!(predictions[error.index], error.predicted);
            assert!(error.confidence > 0. && error.confidence <= 1.);
        }
        let matrix = ConfusionMatrix::evaluate(&model, &split, 6)?;
        assert_eq!(matrix.total() - matrix.counts().diag().sum(), wrong);
        Ok(())
    }
}
