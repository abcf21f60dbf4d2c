//!
/*!
# Example
A small LeNet style network, built from the layers in [`layer`]:
```
use lenet5::{
    learn::neural_network::{
        autograd::Variable4,
        layer::{Conv2, Dense, Flatten, Forward, Layer, Rbf, ScaledTanh, Subsample2},
    },
    result::Result,
};
use ndarray::{Array, Ix2, Ix4};

#[lenet5::learn::neural_network::layer::impl_forward(Ix4, Ix2)]
#[derive(Layer)]
struct Net {
    conv: Conv2<ScaledTanh>,
    pool: Subsample2<ScaledTanh>,
    flatten: Flatten,
    dense: Dense<ScaledTanh>,
    output: Rbf,
}

fn main() -> Result<()> {
    let tanh = ScaledTanh::default();
    let net = Net {
        conv: Conv2::builder().outputs(6).filter([5, 5]).activation(tanh).build()?,
        pool: Subsample2::builder().channels(6).activation(tanh).build()?,
        flatten: Flatten,
        dense: Dense::builder().inputs(6 * 2 * 2).outputs(84).activation(tanh).build()?,
        output: Rbf::builder().build()?,
    };
    let y = net.forward(Variable4::from(Array::zeros([1, 1, 8, 8])))?;
    assert_eq!(y.shape(), &[1, 10]);
    Ok(())
}
```
*/

/// Variables and Parameters
pub mod autograd;

/// Layers
pub mod layer;

/// Weight initialization.
pub mod init;

/// Optimizers
pub mod optimizer;

/// The LeNet-5 model.
pub mod lenet5;

/// Training and evaluation.
pub mod trainer;
