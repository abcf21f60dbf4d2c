use lenet5::{
    learn::neural_network::{
        autograd::Variable4,
        layer::{Conv2, Dense, Flatten, Forward, Identity, Layer, Rbf, ScaledTanh, Subsample2},
    },
    result::Result,
};
use lenet5_derive::impl_forward;
use ndarray::{Array, Ix2, Ix4};

#[impl_forward(Ix2, Ix2)]
#[derive(Layer)]
struct DenseNet(Dense<ScaledTanh>);

#[impl_forward(Ix4, Ix2)]
#[derive(Layer)]
struct Small {
    conv: Conv2<ScaledTanh>,
    pool: Subsample2<ScaledTanh>,
    flatten: Flatten,
    dense: Dense<ScaledTanh>,
    output: Rbf,
}

impl Small {
    fn new() -> Result<Self> {
        Ok(Self {
            conv: Conv2::builder()
                .outputs(2)
                .filter([3, 3])
                .activation(ScaledTanh::default())
                .build()?,
            pool: Subsample2::builder()
                .channels(2)
                .activation(ScaledTanh::default())
                .build()?,
            flatten: Flatten,
            dense: Dense::builder()
                .inputs(2 * 3 * 3)
                .outputs(4)
                .activation(ScaledTanh::default())
                .build()?,
            output: Rbf::builder().inputs(4).outputs(3).build()?,
        })
    }
}

#[impl_forward(Ix4, Ix4)]
#[derive(Layer)]
struct WithSkip {
    identity: Identity,
    #[layer(skip)]
    #[allow(dead_code)]
    name: String,
}

#[test]
fn derive_tuple() -> Result<()> {
    let mut net = DenseNet(
        Dense::builder()
            .inputs(3)
            .outputs(2)
            .activation(ScaledTanh::default())
            .build()?,
    );
    assert_eq!(net.parameters().len(), 2);
    assert_eq!(net.parameter_count(), 8);
    assert_eq!(net.parameters_mut()?.len(), 2);
    Ok(())
}

#[test]
fn derive_sequential() -> Result<()> {
    let mut small = Small::new()?;
    // conv weight, conv bias, pool weight, pool bias, dense weight, dense bias
    assert_eq!(small.parameters().len(), 6);
    assert_eq!(small.parameter_count(), 18 + 2 + 2 + 2 + 72 + 4);
    small.set_training(true)?;
    assert!(small.parameters().iter().all(|p| p.training()));
    let y = small.forward(Variable4::from(Array::zeros([5, 1, 8, 8])))?;
    assert_eq!(y.shape(), &[5, 3]);
    small.set_training(false)?;
    assert!(small.parameters().iter().all(|p| !p.training()));
    Ok(())
}

#[test]
fn derive_skip() -> Result<()> {
    let layer = WithSkip {
        identity: Identity,
        name: "skipped".to_string(),
    };
    assert!(layer.parameters().is_empty());
    let y = layer.forward(Variable4::from(Array::zeros([1, 1, 2, 2])))?;
    assert_eq!(y.shape(), &[1, 1, 2, 2]);
    Ok(())
}
