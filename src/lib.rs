/*!
# lenet5
A reproduction of [LeNet-5](<http://yann.lecun.com/exdb/publis/pdf/lecun-01a.pdf>)
(LeCun, Bottou, Bengio and Haffner, 1998) on MNIST.

The architecture follows the paper: scaled tanh activations, trainable
subsampling, the C3 connection table, an RBF output layer and fan-in scaled
uniform initialization. Training uses plain stochastic gradient descent instead
of the paper's stochastic diagonal Levenberg-Marquardt method.

```no_run
# use lenet5::{
#     result::Result,
#     dataset::{mnist::Mnist, Normalization, PrepareOptions},
#     learn::neural_network::{lenet5::LeNet5, trainer::{Trainer, TrainConfig}},
#     learn::analysis::ConfusionMatrix,
# };
# fn main() -> Result<()> {
let mnist = Mnist::builder().download(true).build()?;
let (train_images, train_classes) = mnist.train();
let (test_images, test_classes) = mnist.test();
let normalization = Normalization::from_images(train_images)?;
let options = PrepareOptions::default();
let train = options.prepare(train_images, train_classes, &normalization)?;
let test = options.prepare(test_images, test_classes, &normalization)?;
let model = LeNet5::builder().seed(0).build()?;
let mut trainer = Trainer::new(model, TrainConfig::default())?;
trainer.fit(&train, &test, |_, stats| {
    println!("{stats:?}");
    Ok(())
})?;
let confusion = ConfusionMatrix::evaluate(trainer.model(), &test, 1000)?;
println!("{confusion}");
# Ok(())
# }
```
*/
#![warn(missing_docs)]

// Allows the derive macros to refer to `::lenet5` from within this crate.
extern crate self as lenet5;

/// Result.
pub mod result {
    /// Result type alias, defaulting to [`anyhow::Error`].
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

/// Errors.
pub mod error;

/// Datasets.
pub mod dataset;

/// Machine learning.
pub mod learn;
