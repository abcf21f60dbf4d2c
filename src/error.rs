use thiserror::Error;

/// Failures specific to preparing data, evaluating and training the model.
///
/// Functions return [`anyhow::Error`], use [`downcast_ref`](anyhow::Error::downcast_ref) to
/// inspect these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// An image or array did not have the expected shape.
    #[error("Expected shape {expected:?}, found {found:?}!")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The shape found.
        found: Vec<usize>,
    },
    /// A class label was outside of 0..=9.
    #[error("Invalid label {0}, expected 0..=9!")]
    InvalidLabel(u8),
    /// The model was given an input of the wrong shape.
    #[error("Invalid input shape {found:?}, expected [N, {expected:?}]!")]
    InvalidInput {
        /// The expected shape of a single sample.
        expected: Vec<usize>,
        /// The shape of the input.
        found: Vec<usize>,
    },
    /// The loss became non-finite.
    #[error("Training diverged at epoch {epoch} batch {batch}, loss = {loss}!")]
    Divergence {
        /// The epoch, starting at 1.
        epoch: usize,
        /// The batch index within the epoch.
        batch: usize,
        /// The loss.
        loss: f32,
    },
    /// The configuration is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
