use super::{
    autograd::Variable4,
    layer::{impl_forward, Conv2, Dense, Flatten, Forward, Layer, Rbf, ScaledTanh, Subsample2},
};
use crate::{
    dataset::CLASSES,
    error::Error,
    learn::criterion::argmin,
    result::Result,
};
use ndarray::{Array1, Array2, ArrayView4, Ix2, Ix4};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

/// The shape of a single input, \[channels, height, width\].
pub const INPUT_SHAPE: [usize; 3] = [1, 32, 32];

/// The C3 connection table \[16, 6\] (Table I of the paper).
///
/// Maps 0..6 take 3 contiguous S2 maps, 6..12 take 4 contiguous maps, 12..15 take 4
/// discontinuous maps and map 15 takes all 6.
pub fn c3_connections() -> Array2<bool> {
    let mut table = Array2::from_elem([16, 6], false);
    for o in 0..6 {
        for c in o..o + 3 {
            table[(o, c % 6)] = true;
        }
    }
    for o in 6..12 {
        for c in o - 6..o - 2 {
            table[(o, c % 6)] = true;
        }
    }
    for (o, inputs) in [(12, [0, 1, 3, 4]), (13, [1, 2, 4, 5]), (14, [0, 2, 3, 5])] {
        for c in inputs {
            table[(o, c)] = true;
        }
    }
    table.row_mut(15).fill(true);
    table
}

/// LeNet5 builder.
pub mod builder {
    use super::*;

    /// Builder for creating a [`LeNet5`].
    pub struct LeNet5Builder {
        seed: Option<u64>,
        connection_table: bool,
        trainable_prototypes: bool,
        activation: ScaledTanh,
    }

    impl LeNet5Builder {
        pub(super) fn new() -> Self {
            Self {
                seed: None,
                connection_table: true,
                trainable_prototypes: false,
                activation: ScaledTanh::default(),
            }
        }
        /// Seed for initialization.
        ///
        /// Without a seed the parameters are initialized from entropy.
        pub fn seed(self, seed: u64) -> Self {
            Self {
                seed: Some(seed),
                ..self
            }
        }
        /// Whether C3 uses the sparse connection table. Default is true.
        ///
        /// See [`c3_connections`].
        pub fn connection_table(self, connection_table: bool) -> Self {
            Self {
                connection_table,
                ..self
            }
        }
        /// Whether the output prototypes are learned. Default is false.
        pub fn trainable_prototypes(self, trainable_prototypes: bool) -> Self {
            Self {
                trainable_prototypes,
                ..self
            }
        }
        /// The activation of the hidden layers. Default is [`ScaledTanh::default()`].
        pub fn activation(self, activation: ScaledTanh) -> Self {
            Self { activation, ..self }
        }
        /// Builds the model.
        pub fn build(self) -> Result<LeNet5> {
            let Self {
                seed,
                connection_table,
                trainable_prototypes,
                activation,
            } = self;
            let mut rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
            let rng = &mut rng;
            let c1 = Conv2::builder()
                .inputs(1)
                .outputs(6)
                .filter([5, 5])
                .activation(activation)
                .build_with(rng)?;
            let s2 = Subsample2::builder()
                .channels(6)
                .activation(activation)
                .build_with(rng)?;
            let mut c3 = Conv2::builder()
                .inputs(6)
                .outputs(16)
                .filter([5, 5])
                .activation(activation);
            if connection_table {
                c3 = c3.connections(c3_connections());
            }
            let c3 = c3.build_with(rng)?;
            let s4 = Subsample2::builder()
                .channels(16)
                .activation(activation)
                .build_with(rng)?;
            let c5 = Conv2::builder()
                .inputs(16)
                .outputs(120)
                .filter([5, 5])
                .activation(activation)
                .build_with(rng)?;
            let f6 = Dense::builder()
                .inputs(120)
                .outputs(84)
                .activation(activation)
                .build_with(rng)?;
            let output = Rbf::builder()
                .inputs(84)
                .outputs(CLASSES)
                .trainable(trainable_prototypes)
                .build_with(rng)?;
            Ok(LeNet5 {
                c1,
                s2,
                c3,
                s4,
                c5,
                flatten: Flatten,
                f6,
                output,
            })
        }
    }
}
use builder::LeNet5Builder;

/// LeNet-5.
///
/// Input \[N, 1, 32, 32\] produces \[N, 10\] distances to the class prototypes.
///
/// | layer | output |
/// |---|---|
/// | c1 | \[N, 6, 28, 28\] |
/// | s2 | \[N, 6, 14, 14\] |
/// | c3 | \[N, 16, 10, 10\] |
/// | s4 | \[N, 16, 5, 5\] |
/// | c5 | \[N, 120, 1, 1\] |
/// | f6 | \[N, 84\] |
/// | output | \[N, 10\] |
#[impl_forward(Ix4, Ix2)]
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
pub struct LeNet5 {
    c1: Conv2<ScaledTanh>,
    s2: Subsample2<ScaledTanh>,
    c3: Conv2<ScaledTanh>,
    s4: Subsample2<ScaledTanh>,
    c5: Conv2<ScaledTanh>,
    flatten: Flatten,
    f6: Dense<ScaledTanh>,
    output: Rbf,
}

impl LeNet5 {
    /// Returns a builder for creating the model.
    ///
    ///```
    /// # use lenet5::{result::Result, learn::neural_network::{layer::Layer, lenet5::LeNet5}};
    /// # fn main() -> Result<()> {
    /// let model = LeNet5::builder()
    ///     .seed(0)
    ///     .build()?;
    /// assert_eq!(model.parameter_count(), 60_000);
    /// # Ok(())
    /// # }
    ///```
    pub fn builder() -> LeNet5Builder {
        LeNet5Builder::new()
    }
    /// The C3 layer.
    pub fn c3(&self) -> &Conv2<ScaledTanh> {
        &self.c3
    }
    /// The output layer.
    pub fn output(&self) -> &Rbf {
        &self.output
    }
    /// Checks that `shape` is \[N, 1, 32, 32\].
    ///
    /// **Errors**
    ///
    /// [`Error::InvalidInput`] otherwise.
    pub fn check_input(shape: &[usize]) -> Result<()> {
        if shape.len() != 1 + INPUT_SHAPE.len() || shape[1..] != INPUT_SHAPE {
            return Err(Error::InvalidInput {
                expected: INPUT_SHAPE.to_vec(),
                found: shape.to_vec(),
            }
            .into());
        }
        Ok(())
    }
    /// Computes the distances to each class for `input`.
    ///
    /// Does not record a graph, so it is safe to call while training.
    ///
    /// **Errors**
    ///
    /// [`Error::InvalidInput`] if the input is not \[N, 1, 32, 32\].
    pub fn infer(&self, input: ArrayView4<f32>) -> Result<Array2<f32>> {
        Self::check_input(input.shape())?;
        let mut model = self.clone();
        model.set_training(false)?;
        Ok(model
            .forward(Variable4::from(input.to_owned()))?
            .into_value()
            .into_owned())
    }
    /// Predicts the class of each image, the arg min distance.
    ///
    /// See [`.infer()`](Self::infer).
    pub fn predict(&self, input: ArrayView4<f32>) -> Result<Array1<u8>> {
        let output = self.infer(input)?;
        Ok(output
            .outer_iter()
            .map(|x| argmin(x) as u8)
            .collect())
    }
    /// Saves the parameters to `path` as json.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
    /// Loads a model saved with [`.save()`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
