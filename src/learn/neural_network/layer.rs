use super::{
    autograd::{
        Parameter, Parameter1, Parameter2, Parameter4, ParameterD, ParameterViewMutD, Variable,
        Variable2, Variable4,
    },
    init,
};
use crate::result::Result;
use anyhow::{bail, ensure};
#[doc(hidden)]
pub use lenet5_derive::*;
use ndarray::{
    s, Array, Array2, Array4, ArcArray, ArrayView2, ArrayViewMut4, Axis, Dimension, Ix1, Ix2,
    Ix4, Zip,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

mod im2col;
use im2col::{col2im, im2col};

/// A trait for networks and layers.
///
/// [`Layer`] provides reflection and utility methods.
///
/// # Derive
/// [`Layer`] should be [derived](lenet5_derive) for models composed of other layers.
///
/// # Clone
/// Implement [`Clone`] (typically this can be derived) to make it easier to share the layer (potentially between threads).
///
/// # serde
/// Implement [`Serialize`](serde::Serialize) and [`Deserialize`](serde::Deserialize) for saving and loading the layer. This can generally be [derived](<https://serde.rs/derive.html>).
pub trait Layer {
    /// Prepares for training or inference.
    ///
    /// When training, variables created from parameters have a node, so that
    /// gradients are computed in the backward pass.
    #[allow(unused)]
    fn set_training(&mut self, training: bool) -> Result<()> {
        Ok(())
    }
    /// Enumerates the parameters of the layer, including child layers.
    fn parameters(&self) -> Vec<ParameterD> {
        Vec::new()
    }
    /// Enumerates mutable views of the parameters of the layer, including child layers.
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        Ok(Vec::new())
    }
    /// The number of trainable values.
    ///
    /// Weights excluded by a connection table are not counted.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(ParameterD::len).sum()
    }
}

/// A trait for the forward pass.
///
/// [`Layer`]'s implement [`Forward`], which computes the output as a function of the input.
///
/// # Derive
/// [`Forward`] can be implemented for sequential layers (ie typical feed-foward networks)
/// with `#[impl_forward(InputDim, OutputDim)]`.
pub trait Forward<X> {
    /// The type of the output.
    type Output;
    /// Computes the forward pass.
    ///
    /// # Autograd
    /// Operations on [`Variable`]'s are expected to apply backward ops via [`VariableBuilder`](super::autograd::builder::VariableBuilder).
    ///
    /// **Errors**
    ///
    /// Returns an error if the operation could not be performed. Generally the implemenation should return an error instead of panicking.
    fn forward(&self, input: X) -> Result<Self::Output>;
}

/// Layer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Conv2`].
    pub struct Conv2Builder<A = Identity> {
        inputs: usize,
        outputs: usize,
        filter: [usize; 2],
        bias: bool,
        connections: Option<Array2<bool>>,
        activation: A,
    }

    impl Conv2Builder {
        pub(super) fn new() -> Self {
            Self {
                inputs: 1,
                outputs: 1,
                filter: [1, 1],
                bias: true,
                connections: None,
                activation: Identity,
            }
        }
    }

    impl<A> Conv2Builder<A> {
        /// Number of input channels. Default is 1.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// Number of output channels. Default is 1.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// Size of the filter. Default is \[1, 1\].
        pub fn filter(self, filter: [usize; 2]) -> Self {
            Self { filter, ..self }
        }
        /// Whether to add a bias. Default is true.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        /// Connection table \[outputs, inputs\].
        ///
        /// Output map `o` is computed only from the inputs `c` where `connections[(o, c)]`.
        pub fn connections(self, connections: Array2<bool>) -> Self {
            Self {
                connections: Some(connections),
                ..self
            }
        }
        /// Activation applied after the convolution. Default is [`Identity`].
        pub fn activation<A2>(self, activation: A2) -> Conv2Builder<A2> {
            let Self {
                inputs,
                outputs,
                filter,
                bias,
                connections,
                activation: _,
            } = self;
            Conv2Builder {
                inputs,
                outputs,
                filter,
                bias,
                connections,
                activation,
            }
        }
        /// Builds the layer, initializing parameters with `rng`.
        ///
        /// See [`init::conv2`].
        ///
        /// **Errors**
        /// - The inputs, outputs or filter are 0.
        /// - The connection table is not \[outputs, inputs\].
        /// - An output is not connected to any input.
        pub fn build_with<R: Rng>(self, rng: &mut R) -> Result<Conv2<A>> {
            let Self {
                inputs,
                outputs,
                filter,
                bias,
                connections,
                activation,
            } = self;
            ensure!(
                inputs > 0 && outputs > 0 && filter.iter().all(|x| *x > 0),
                "Conv2 inputs {inputs}, outputs {outputs} and filter {filter:?} must be positive!"
            );
            if let Some(connections) = connections.as_ref() {
                ensure!(
                    connections.dim() == (outputs, inputs),
                    "Conv2 connections {:?} expected [{outputs}, {inputs}]!",
                    connections.shape()
                );
                if let Some(o) = connections
                    .outer_iter()
                    .position(|row| !row.iter().any(|x| *x))
                {
                    bail!("Conv2 output {o} is not connected!");
                }
            }
            let (weight, bias_value) = init::conv2(
                rng,
                outputs,
                inputs,
                filter,
                connections.as_ref().map(Array2::view),
            );
            Ok(Conv2 {
                weight: Parameter::from(weight),
                bias: bias.then(|| Parameter::from(bias_value)),
                connections,
                activation,
            })
        }
        /// Builds the layer.
        ///
        /// See [`.build_with()`](Self::build_with).
        pub fn build(self) -> Result<Conv2<A>> {
            self.build_with(&mut rand::thread_rng())
        }
    }

    /// Builder for creating a [`Subsample2`].
    pub struct Subsample2Builder<A = Identity> {
        channels: usize,
        size: usize,
        activation: A,
    }

    impl Subsample2Builder {
        pub(super) fn new() -> Self {
            Self {
                channels: 1,
                size: 2,
                activation: Identity,
            }
        }
    }

    impl<A> Subsample2Builder<A> {
        /// Number of channels (maps). Default is 1.
        pub fn channels(self, channels: usize) -> Self {
            Self { channels, ..self }
        }
        /// Size of the square window, also the stride. Default is 2.
        pub fn size(self, size: usize) -> Self {
            Self { size, ..self }
        }
        /// Activation applied after subsampling. Default is [`Identity`].
        pub fn activation<A2>(self, activation: A2) -> Subsample2Builder<A2> {
            Subsample2Builder {
                channels: self.channels,
                size: self.size,
                activation,
            }
        }
        /// Builds the layer, initializing parameters with `rng`.
        ///
        /// **Errors**
        ///
        /// The channels or size are 0.
        pub fn build_with<R: Rng>(self, rng: &mut R) -> Result<Subsample2<A>> {
            let Self {
                channels,
                size,
                activation,
            } = self;
            ensure!(
                channels > 0 && size > 0,
                "Subsample2 channels {channels} and size {size} must be positive!"
            );
            let (weight, bias) = init::subsample2(rng, channels, size);
            Ok(Subsample2 {
                weight: Parameter::from(weight),
                bias: Parameter::from(bias),
                size,
                activation,
            })
        }
        /// Builds the layer.
        pub fn build(self) -> Result<Subsample2<A>> {
            self.build_with(&mut rand::thread_rng())
        }
    }

    /// Builder for creating a [`Dense`].
    pub struct DenseBuilder<A = Identity> {
        inputs: usize,
        outputs: usize,
        bias: bool,
        activation: A,
    }

    impl DenseBuilder {
        pub(super) fn new() -> Self {
            Self {
                inputs: 1,
                outputs: 1,
                bias: true,
                activation: Identity,
            }
        }
    }

    impl<A> DenseBuilder<A> {
        /// Number of inputs. Default is 1.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// Number of outputs. Default is 1.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// Whether to add a bias. Default is true.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        /// Activation. Default is [`Identity`].
        pub fn activation<A2>(self, activation: A2) -> DenseBuilder<A2> {
            DenseBuilder {
                inputs: self.inputs,
                outputs: self.outputs,
                bias: self.bias,
                activation,
            }
        }
        /// Builds the layer, initializing parameters with `rng`.
        ///
        /// **Errors**
        ///
        /// The inputs or outputs are 0.
        pub fn build_with<R: Rng>(self, rng: &mut R) -> Result<Dense<A>> {
            let Self {
                inputs,
                outputs,
                bias,
                activation,
            } = self;
            ensure!(
                inputs > 0 && outputs > 0,
                "Dense inputs {inputs} and outputs {outputs} must be positive!"
            );
            let (weight, bias_value) = init::dense(rng, inputs, outputs);
            Ok(Dense {
                weight: Parameter::from(weight),
                bias: bias.then(|| Parameter::from(bias_value)),
                activation,
            })
        }
        /// Builds the layer.
        pub fn build(self) -> Result<Dense<A>> {
            self.build_with(&mut rand::thread_rng())
        }
    }

    /// Builder for creating a [`Rbf`].
    pub struct RbfBuilder {
        inputs: usize,
        outputs: usize,
        trainable: bool,
    }

    impl RbfBuilder {
        pub(super) fn new() -> Self {
            Self {
                inputs: 84,
                outputs: 10,
                trainable: false,
            }
        }
        /// Number of inputs. Default is 84.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// Number of classes. Default is 10.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// Whether the prototypes are learned. Default is false.
        pub fn trainable(self, trainable: bool) -> Self {
            Self { trainable, ..self }
        }
        /// Builds the layer, drawing +-1 prototypes with `rng`.
        ///
        /// **Errors**
        ///
        /// The inputs or outputs are 0.
        pub fn build_with<R: Rng>(self, rng: &mut R) -> Result<Rbf> {
            let Self {
                inputs,
                outputs,
                trainable,
            } = self;
            ensure!(
                inputs > 0 && outputs > 0,
                "Rbf inputs {inputs} and outputs {outputs} must be positive!"
            );
            Ok(Rbf {
                prototypes: Parameter::from(init::prototypes(rng, inputs, outputs)),
                trainable,
            })
        }
        /// Builds the layer.
        pub fn build(self) -> Result<Rbf> {
            self.build_with(&mut rand::thread_rng())
        }
    }
}
use builder::*;

/// Identity activation.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Identity;

impl Layer for Identity {}

impl<D: Dimension> Forward<Variable<D>> for Identity {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        Ok(input)
    }
}

/// Scaled hyperbolic tangent.
///
/// `f(a) = amplitude * tanh(slope * a)`, by default amplitude = 1.7159 and slope = 2 / 3,
/// so that f(1) = 1 and f(-1) = -1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaledTanh {
    amplitude: f32,
    slope: f32,
}

impl ScaledTanh {
    /// Creates a scaled tanh with `amplitude` and `slope`.
    pub fn new(amplitude: f32, slope: f32) -> Self {
        Self { amplitude, slope }
    }
    /// The amplitude, which bounds the output.
    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }
    /// The slope.
    pub fn slope(&self) -> f32 {
        self.slope
    }
}

impl Default for ScaledTanh {
    fn default() -> Self {
        Self::new(1.7159, 2. / 3.)
    }
}

impl Layer for ScaledTanh {}

impl<D: Dimension + 'static> Forward<Variable<D>> for ScaledTanh {
    type Output = Variable<D>;
    fn forward(&self, input: Variable<D>) -> Result<Variable<D>> {
        let Self { amplitude, slope } = *self;
        let output = input
            .value()
            .mapv(|x| amplitude * (slope * x).tanh())
            .into_shared();
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let output = output.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, D>| {
                let mut dx = output_grad.into_owned();
                Zip::from(&mut dx).and(&output).for_each(|dx, y| {
                    *dx *= slope * (amplitude - y * y / amplitude);
                });
                Ok(dx.into_shared())
            });
        }
        Ok(builder.build(output))
    }
}

/// Flattens \[N, C, H, W\] into \[N, C * H * W\].
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Flatten;

impl Layer for Flatten {}

impl Forward<Variable4> for Flatten {
    type Output = Variable2;
    fn forward(&self, input: Variable4) -> Result<Variable2> {
        Ok(input.flatten()?)
    }
}

/// Rearranges \[N, O, OH, OW\] into \[N * OH * OW, O\].
fn output_grad_matrix(output_grad: ArcArray<f32, Ix4>) -> Result<Array2<f32>> {
    let (n, outputs, oh, ow) = output_grad.dim();
    Ok(output_grad
        .permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .into_owned()
        .into_shape([n * oh * ow, outputs])?)
}

fn mask_disconnected(weight: ArrayViewMut4<f32>, connections: ArrayView2<bool>) {
    let mask = connections.insert_axis(Axis(2)).insert_axis(Axis(3));
    Zip::from(weight)
        .and_broadcast(mask)
        .for_each(|w, &connected| {
            if !connected {
                *w = 0.;
            }
        });
}

/// 2D convolution.
///
/// Valid (no padding), stride 1, with an optional per output bias.
/// Input \[N, C, H, W\] produces \[N, O, H - kh + 1, W - kw + 1\].
///
/// An optional connection table restricts which inputs contribute to each output map. Weights
/// of disconnected pairs are excluded from the forward pass and their gradient is 0.
///
/// Implemented with im2col and a matrix multiply.
#[derive(Clone, Serialize, Deserialize)]
pub struct Conv2<A = Identity> {
    weight: Parameter4,
    bias: Option<Parameter1>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connections: Option<Array2<bool>>,
    activation: A,
}

impl Conv2 {
    /// Returns a builder for creating a [`Conv2`].
    pub fn builder() -> Conv2Builder {
        Conv2Builder::new()
    }
}

impl<A> Conv2<A> {
    /// The weight \[outputs, inputs, kh, kw\].
    pub fn weight(&self) -> &Parameter4 {
        &self.weight
    }
    /// The bias \[outputs\].
    pub fn bias(&self) -> Option<&Parameter1> {
        self.bias.as_ref()
    }
    /// The connection table \[outputs, inputs\].
    pub fn connections(&self) -> Option<ArrayView2<bool>> {
        self.connections.as_ref().map(Array2::view)
    }
    /// The activation.
    pub fn activation(&self) -> &A {
        &self.activation
    }
    fn weight_dim(&self) -> [usize; 4] {
        let (outputs, inputs, kh, kw) = self.weight.value().dim();
        [outputs, inputs, kh, kw]
    }
    /// The weight as \[outputs, inputs * kh * kw\], with disconnected weights zeroed.
    fn weight_matrix(&self) -> Result<Array2<f32>> {
        let [outputs, inputs, kh, kw] = self.weight_dim();
        let mut weight = self.weight.value().as_standard_layout().into_owned();
        if let Some(connections) = self.connections.as_ref() {
            mask_disconnected(weight.view_mut(), connections.view());
        }
        Ok(weight.into_shape([outputs, inputs * kh * kw])?)
    }
}

impl<A: Debug> Debug for Conv2<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [outputs, inputs, kh, kw] = self.weight_dim();
        let mut builder = f.debug_struct("Conv2");
        builder
            .field("inputs", &inputs)
            .field("outputs", &outputs)
            .field("filter", &[kh, kw])
            .field("bias", &self.bias.is_some())
            .field("connections", &self.connections.is_some())
            .field("activation", &self.activation)
            .finish()
    }
}

impl<A: Layer> Layer for Conv2<A> {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.weight.set_training(training);
        if let Some(bias) = self.bias.as_mut() {
            bias.set_training(training);
        }
        self.activation.set_training(training)
    }
    fn parameters(&self) -> Vec<ParameterD> {
        let mut parameters = vec![self.weight.clone().into_dyn()];
        parameters.extend(self.bias.clone().map(Parameter::into_dyn));
        parameters.extend(self.activation.parameters());
        parameters
    }
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        let mut parameters = vec![self.weight.make_view_mut().into_dyn()];
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias.make_view_mut().into_dyn());
        }
        parameters.extend(self.activation.parameters_mut()?);
        Ok(parameters)
    }
    fn parameter_count(&self) -> usize {
        let [_, _, kh, kw] = self.weight_dim();
        let weights = if let Some(connections) = self.connections.as_ref() {
            connections.iter().filter(|x| **x).count() * kh * kw
        } else {
            self.weight.len()
        };
        weights + self.bias.as_ref().map_or(0, Parameter::len) + self.activation.parameter_count()
    }
}

impl<A: Forward<Variable4, Output = Variable4>> Forward<Variable4> for Conv2<A> {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (n, c, h, w) = input.dim();
        let [outputs, inputs, kh, kw] = self.weight_dim();
        ensure!(
            c == inputs && h >= kh && w >= kw,
            "Conv2 expected input [N, {inputs}, >= {kh}, >= {kw}], found {:?}!",
            input.shape()
        );
        let (oh, ow) = (h + 1 - kh, w + 1 - kw);
        let weight = self.weight.to_variable();
        let bias = self.bias.as_ref().map(Parameter::to_variable);
        let weight_matrix = self.weight_matrix()?;
        let cols = im2col(input.value().view(), [kh, kw])?;
        let mut output = cols.dot(&weight_matrix.t());
        if let Some(bias) = bias.as_ref() {
            output += bias.value();
        }
        let output = output
            .into_shape([n, oh, ow, outputs])?
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned();
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let weight_matrix = weight_matrix.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let dcols = output_grad_matrix(output_grad)?.dot(&weight_matrix);
                Ok(col2im(dcols, [n, c, h, w], [kh, kw])?.into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let connections = self.connections.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let mut dw = output_grad_matrix(output_grad)?
                    .t()
                    .dot(&cols)
                    .into_shape([outputs, inputs, kh, kw])?;
                if let Some(connections) = connections.as_ref() {
                    mask_disconnected(dw.view_mut(), connections.view());
                }
                Ok(dw.into_shared())
            });
        }
        if let Some(node) = bias.as_ref().and_then(Variable::node) {
            builder.edge(node, |output_grad: ArcArray<f32, Ix4>| {
                Ok(output_grad_matrix(output_grad)?
                    .sum_axis(Axis(0))
                    .into_shared())
            });
        }
        builder.build(output.into_shared()).forward(&self.activation)
    }
}

/// Trainable subsampling.
///
/// Each output is `weight[c] * sum(window) + bias[c]` over non-overlapping `size` x `size`
/// windows of map `c`. Input \[N, C, H, W\] produces \[N, C, H / size, W / size\], trailing
/// rows and columns that do not fill a window are ignored.
#[derive(Clone, Serialize, Deserialize)]
pub struct Subsample2<A = Identity> {
    weight: Parameter1,
    bias: Parameter1,
    size: usize,
    activation: A,
}

impl Subsample2 {
    /// Returns a builder for creating a [`Subsample2`].
    pub fn builder() -> Subsample2Builder {
        Subsample2Builder::new()
    }
}

impl<A> Subsample2<A> {
    /// The coefficient per map.
    pub fn weight(&self) -> &Parameter1 {
        &self.weight
    }
    /// The bias per map.
    pub fn bias(&self) -> &Parameter1 {
        &self.bias
    }
    /// The window size.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl<A: Debug> Debug for Subsample2<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subsample2")
            .field("channels", &self.weight.len())
            .field("size", &self.size)
            .field("activation", &self.activation)
            .finish()
    }
}

impl<A: Layer> Layer for Subsample2<A> {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.weight.set_training(training);
        self.bias.set_training(training);
        self.activation.set_training(training)
    }
    fn parameters(&self) -> Vec<ParameterD> {
        let mut parameters = vec![self.weight.clone().into_dyn(), self.bias.clone().into_dyn()];
        parameters.extend(self.activation.parameters());
        parameters
    }
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        let mut parameters = vec![
            self.weight.make_view_mut().into_dyn(),
            self.bias.make_view_mut().into_dyn(),
        ];
        parameters.extend(self.activation.parameters_mut()?);
        Ok(parameters)
    }
}

impl<A: Forward<Variable4, Output = Variable4>> Forward<Variable4> for Subsample2<A> {
    type Output = Variable4;
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (n, c, h, w) = input.dim();
        let size = self.size;
        ensure!(
            c == self.weight.len() && h >= size && w >= size,
            "Subsample2 expected input [N, {}, >= {size}, >= {size}], found {:?}!",
            self.weight.len(),
            input.shape()
        );
        let (oh, ow) = (h / size, w / size);
        let window = [1, 1, size, size];
        let mut sums = Array4::zeros([n, c, oh, ow]);
        Zip::from(&mut sums)
            .and(
                input
                    .value()
                    .slice(s![.., .., ..oh * size, ..ow * size])
                    .exact_chunks(window),
            )
            .par_for_each(|y, x| *y = x.sum());
        let weight = self.weight.to_variable();
        let bias = self.bias.to_variable();
        let mut output = sums.clone();
        {
            let (weight, bias) = (weight.value(), bias.value());
            Zip::indexed(&mut output).par_for_each(|(_, c, _, _), y| {
                *y = weight[c] * *y + bias[c];
            });
        }
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let weight = weight.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let mut dx = Array4::zeros([n, c, h, w]);
                let mut dx_windows = dx.slice_mut(s![.., .., ..oh * size, ..ow * size]);
                Zip::indexed(dx_windows.exact_chunks_mut(window))
                    .and(&output_grad)
                    .par_for_each(|(_, c, _, _), mut chunk, dy| chunk.fill(weight[c] * dy));
                Ok(dx.into_shared())
            });
        }
        if let Some(node) = weight.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                Ok(sum_maps(&output_grad * &sums).into_shared())
            });
        }
        if let Some(node) = bias.node() {
            builder.edge(node, |output_grad: ArcArray<f32, Ix4>| {
                Ok(sum_maps(output_grad.into_owned()).into_shared())
            });
        }
        builder.build(output.into_shared()).forward(&self.activation)
    }
}

/// Sums \[N, C, H, W\] into \[C\].
fn sum_maps(x: Array4<f32>) -> Array<f32, Ix1> {
    x.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0))
}

/// Fully connected layer.
///
/// Input \[N, inputs\] produces \[N, outputs\] = input * weight^T + bias.
#[derive(Clone, Serialize, Deserialize)]
pub struct Dense<A = Identity> {
    weight: Parameter2,
    bias: Option<Parameter1>,
    activation: A,
}

impl Dense {
    /// Returns a builder for creating a [`Dense`].
    pub fn builder() -> DenseBuilder {
        DenseBuilder::new()
    }
}

impl<A> Dense<A> {
    /// The weight \[outputs, inputs\].
    pub fn weight(&self) -> &Parameter2 {
        &self.weight
    }
    /// The bias \[outputs\].
    pub fn bias(&self) -> Option<&Parameter1> {
        self.bias.as_ref()
    }
}

impl<A: Debug> Debug for Dense<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (outputs, inputs) = self.weight.value().dim();
        f.debug_struct("Dense")
            .field("inputs", &inputs)
            .field("outputs", &outputs)
            .field("bias", &self.bias.is_some())
            .field("activation", &self.activation)
            .finish()
    }
}

impl<A: Layer> Layer for Dense<A> {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.weight.set_training(training);
        if let Some(bias) = self.bias.as_mut() {
            bias.set_training(training);
        }
        self.activation.set_training(training)
    }
    fn parameters(&self) -> Vec<ParameterD> {
        let mut parameters = vec![self.weight.clone().into_dyn()];
        parameters.extend(self.bias.clone().map(Parameter::into_dyn));
        parameters.extend(self.activation.parameters());
        parameters
    }
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        let mut parameters = vec![self.weight.make_view_mut().into_dyn()];
        if let Some(bias) = self.bias.as_mut() {
            parameters.push(bias.make_view_mut().into_dyn());
        }
        parameters.extend(self.activation.parameters_mut()?);
        Ok(parameters)
    }
}

impl<A: Forward<Variable2, Output = Variable2>> Forward<Variable2> for Dense<A> {
    type Output = Variable2;
    fn forward(&self, input: Variable2) -> Result<Variable2> {
        let (outputs, inputs) = self.weight.value().dim();
        ensure!(
            input.shape()[1] == inputs,
            "Dense expected input [N, {inputs}], found {:?}!",
            input.shape()
        );
        let weight = self.weight.to_variable();
        let bias = self.bias.as_ref().map(Parameter::to_variable);
        let mut output = input.value().dot(&weight.value().t());
        if let Some(bias) = bias.as_ref() {
            output += bias.value();
        }
        debug_assert_eq!(output.shape()[1], outputs);
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let weight = weight.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix2>| {
                Ok(output_grad.dot(&weight).into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let x = input.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix2>| {
                Ok(output_grad.t().dot(&x).into_shared())
            });
        }
        if let Some(node) = bias.as_ref().and_then(Variable::node) {
            builder.edge(node, |output_grad: ArcArray<f32, Ix2>| {
                Ok(output_grad.sum_axis(Axis(0)).into_shared())
            });
        }
        builder.build(output.into_shared()).forward(&self.activation)
    }
}

/// Euclidean radial basis function output layer.
///
/// Input \[N, inputs\] produces \[N, outputs\] where `y[n, k] = sum_j (x[n, j] - w[k, j])^2`,
/// the squared distance to the prototype of class `k`. Smaller is more likely, the prediction
/// is the arg min.
///
/// Prototypes are +-1 and fixed unless built with [`.trainable(true)`](RbfBuilder::trainable).
#[derive(Clone, Serialize, Deserialize)]
pub struct Rbf {
    prototypes: Parameter2,
    trainable: bool,
}

impl Rbf {
    /// Returns a builder for creating a [`Rbf`].
    pub fn builder() -> RbfBuilder {
        RbfBuilder::new()
    }
    /// The prototypes \[outputs, inputs\].
    pub fn prototypes(&self) -> &Parameter2 {
        &self.prototypes
    }
    /// Whether the prototypes are learned.
    pub fn trainable(&self) -> bool {
        self.trainable
    }
}

impl Debug for Rbf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (outputs, inputs) = self.prototypes.value().dim();
        f.debug_struct("Rbf")
            .field("inputs", &inputs)
            .field("outputs", &outputs)
            .field("trainable", &self.trainable)
            .finish()
    }
}

impl Layer for Rbf {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.prototypes.set_training(training && self.trainable);
        Ok(())
    }
    fn parameters(&self) -> Vec<ParameterD> {
        if self.trainable {
            vec![self.prototypes.clone().into_dyn()]
        } else {
            Vec::new()
        }
    }
    fn parameters_mut(&mut self) -> Result<Vec<ParameterViewMutD>> {
        if self.trainable {
            Ok(vec![self.prototypes.make_view_mut().into_dyn()])
        } else {
            Ok(Vec::new())
        }
    }
}

impl Forward<Variable2> for Rbf {
    type Output = Variable2;
    fn forward(&self, input: Variable2) -> Result<Variable2> {
        let (outputs, inputs) = self.prototypes.value().dim();
        let (n, features) = input.dim();
        ensure!(
            features == inputs,
            "Rbf expected input [N, {inputs}], found {:?}!",
            input.shape()
        );
        let prototypes = self.prototypes.to_variable();
        let mut output = Array2::zeros([n, outputs]);
        {
            let (x, w) = (input.value(), prototypes.value());
            Zip::indexed(&mut output).par_for_each(|(n, k), y| {
                *y = x
                    .row(n)
                    .iter()
                    .zip(w.row(k))
                    .map(|(x, w)| (x - w) * (x - w))
                    .sum();
            });
        }
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let x = input.value().clone();
            let w = prototypes.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix2>| {
                // 2 (rowsum(dy) x - dy w)
                let dy_sum = output_grad.sum_axis(Axis(1)).insert_axis(Axis(1));
                let dx = (&x * &dy_sum - output_grad.dot(&w)) * 2.;
                Ok(dx.into_shared())
            });
        }
        if let Some(node) = prototypes.node() {
            let x = input.value().clone();
            let w = prototypes.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix2>| {
                // -2 (dy^T x - colsum(dy) w)
                let dy_sum = output_grad.sum_axis(Axis(0)).insert_axis(Axis(1));
                let dw = (&w * &dy_sum - output_grad.t().dot(&x)) * 2.;
                Ok(dw.into_shared())
            });
        }
        Ok(builder.build(output.into_shared()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Variable0;
    use approx::assert_relative_eq;
    use ndarray::{arr0, array, ArrayView, Ix0};
    use rand::{rngs::StdRng, SeedableRng};

    fn random<D: Dimension>(dim: D, rng: &mut StdRng) -> Array<f32, D> {
        Array::from_shape_simple_fn(dim, || rng.gen_range(-1f32..1.))
    }

    /// sum(output * weights), so that d loss / d output = weights.
    fn weighted_sum<D: Dimension + 'static>(
        output: Variable<D>,
        weights: ArcArray<f32, D>,
    ) -> Variable0 {
        let loss = (output.value() * &weights).sum();
        let mut builder = Variable::builder();
        if let Some(node) = output.node() {
            builder.edge(node, move |_: ArcArray<f32, Ix0>| Ok(weights));
        }
        builder.build(arr0(loss).into_shared())
    }

    fn assert_grad_eq<D: Dimension>(grad: ArrayView<f32, D>, expected: &[f32]) {
        assert_eq!(grad.len(), expected.len());
        for (g, e) in grad.iter().zip(expected) {
            let tolerance = 1e-2 * (1. + e.abs());
            assert!((g - e).abs() <= tolerance, "{g} != {e}");
        }
    }

    /// Compares the gradients of the input and parameters against central finite differences.
    fn check_gradients<L, D1, D2>(layer: &mut L, input: Array<f32, D1>) -> Result<()>
    where
        L: Layer + Forward<Variable<D1>, Output = Variable<D2>>,
        D1: Dimension + 'static,
        D2: Dimension + 'static,
    {
        let mut rng = StdRng::seed_from_u64(11);
        layer.set_training(true)?;
        let x = Variable::builder().node().build(input.clone().into_shared());
        let output = layer.forward(x.clone())?;
        let weights = random(output.raw_dim(), &mut rng).into_shared();
        weighted_sum(output, weights.clone()).backward()?;
        let input_grad = x.node().unwrap().grad().unwrap();
        let parameter_grads: Vec<_> = layer
            .parameters()
            .iter()
            .map(|parameter| parameter.grad().unwrap())
            .collect();
        layer.set_training(false)?;
        let loss = |layer: &L, input: &Array<f32, D1>| -> Result<f32> {
            let output = layer.forward(Variable::from(input.clone()))?;
            Ok((output.value() * &weights).sum())
        };
        let eps = 1e-2;
        let mut expected = Vec::with_capacity(input.len());
        for i in 0..input.len() {
            let mut plus = input.clone();
            let mut minus = input.clone();
            *plus.iter_mut().nth(i).unwrap() += eps;
            *minus.iter_mut().nth(i).unwrap() -= eps;
            expected.push((loss(&*layer, &plus)? - loss(&*layer, &minus)?) / (2. * eps));
        }
        assert_grad_eq(input_grad.view(), &expected);
        for (p, grad) in parameter_grads.iter().enumerate() {
            let mut expected = Vec::with_capacity(grad.len());
            for i in 0..grad.len() {
                let perturb = |layer: &mut L, delta: f32| -> Result<()> {
                    let mut parameters = layer.parameters_mut()?;
                    *parameters[p].value_view_mut().iter_mut().nth(i).unwrap() += delta;
                    Ok(())
                };
                perturb(&mut *layer, eps)?;
                let plus = loss(&*layer, &input)?;
                perturb(&mut *layer, -2. * eps)?;
                let minus = loss(&*layer, &input)?;
                perturb(&mut *layer, eps)?;
                expected.push((plus - minus) / (2. * eps));
            }
            assert_grad_eq(grad.view(), &expected);
        }
        Ok(())
    }

    #[test]
    fn scaled_tanh_bounded() -> Result<()> {
        let tanh = ScaledTanh::default();
        let x = Variable::from(array![-1e6f32, -3., -1., 0., 1., 3., 1e6]);
        let y = tanh.forward(x)?;
        assert!(y.value().iter().all(|y| y.abs() <= tanh.amplitude()));
        assert_relative_eq!(y.value()[2], -1., epsilon = 1e-3);
        assert_relative_eq!(y.value()[4], 1., epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn scaled_tanh_gradient() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        check_gradients(&mut ScaledTanh::default(), random(ndarray::Dim([3, 4]), &mut rng))
    }

    #[test]
    fn conv2_forward() -> Result<()> {
        let mut conv = Conv2::builder().filter([2, 2]).bias(false).build()?;
        conv.parameters_mut()?[0].value_view_mut().fill(1.);
        let x = Array::from_shape_vec([1, 1, 3, 3], (0..9).map(|x| x as f32).collect())?;
        let y = conv.forward(Variable4::from(x))?;
        assert_eq!(y.value().shape(), &[1, 1, 2, 2]);
        assert_eq!(y.value().iter().copied().collect::<Vec<_>>(), vec![8., 12., 20., 24.]);
        Ok(())
    }

    #[test]
    fn conv2_gradient() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = Conv2::builder()
            .inputs(2)
            .outputs(3)
            .filter([3, 2])
            .activation(ScaledTanh::default())
            .build_with(&mut rng)?;
        check_gradients(&mut conv, random(ndarray::Dim([2, 2, 4, 4]), &mut rng))
    }

    #[test]
    fn conv2_connections() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let connections = array![[true, false], [false, true], [true, true]];
        let mut conv = Conv2::builder()
            .inputs(2)
            .outputs(3)
            .filter([2, 2])
            .connections(connections)
            .build_with(&mut rng)?;
        assert_eq!(conv.parameter_count(), 4 * 4 + 3);
        check_gradients(&mut conv, random(ndarray::Dim([1, 2, 3, 3]), &mut rng))?;
        // output 0 ignores input 1
        let mut x = random(ndarray::Dim([1, 2, 3, 3]), &mut rng);
        let y1 = conv.forward(Variable4::from(x.clone()))?;
        x.slice_mut(s![.., 1, .., ..]).fill(100.);
        let y2 = conv.forward(Variable4::from(x))?;
        assert_eq!(
            y1.value().slice(s![.., 0, .., ..]),
            y2.value().slice(s![.., 0, .., ..])
        );
        Ok(())
    }

    #[test]
    fn conv2_rejects_unconnected_output() {
        let connections = array![[true, false], [false, false]];
        assert!(Conv2::builder()
            .inputs(2)
            .outputs(2)
            .connections(connections)
            .build()
            .is_err());
    }

    #[test]
    fn subsample2_output_size() -> Result<()> {
        let pool = Subsample2::builder().channels(2).build()?;
        for (h, w) in [(28, 28), (10, 10), (5, 5), (7, 4)] {
            let y = pool.forward(Variable4::from(Array::zeros([1, 2, h, w])))?;
            assert_eq!(y.dim(), (1, 2, h / 2, w / 2));
        }
        Ok(())
    }

    #[test]
    fn subsample2_gradient() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let mut pool = Subsample2::builder()
            .channels(3)
            .activation(ScaledTanh::default())
            .build_with(&mut rng)?;
        check_gradients(&mut pool, random(ndarray::Dim([2, 3, 5, 4]), &mut rng))
    }

    #[test]
    fn dense_gradient() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let mut dense = Dense::builder()
            .inputs(5)
            .outputs(3)
            .activation(ScaledTanh::default())
            .build_with(&mut rng)?;
        check_gradients(&mut dense, random(ndarray::Dim([4, 5]), &mut rng))
    }

    #[test]
    fn rbf_distances() -> Result<()> {
        let rbf = Rbf::builder().inputs(3).outputs(2).build()?;
        let w = rbf.prototypes().value().clone();
        let y = rbf.forward(Variable::from(w.clone()))?;
        assert_eq!(y.value()[(0, 0)], 0.);
        assert_eq!(y.value()[(1, 1)], 0.);
        let d: f32 = w.row(0).iter().zip(w.row(1)).map(|(a, b)| (a - b).powi(2)).sum();
        assert_eq!(y.value()[(0, 1)], d);
        Ok(())
    }

    #[test]
    fn rbf_gradient() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let mut rbf = Rbf::builder()
            .inputs(6)
            .outputs(4)
            .trainable(true)
            .build_with(&mut rng)?;
        assert_eq!(rbf.parameter_count(), 24);
        check_gradients(&mut rbf, random(ndarray::Dim([3, 6]), &mut rng))
    }

    #[test]
    fn rbf_fixed_prototypes() -> Result<()> {
        let mut rbf = Rbf::builder().build()?;
        rbf.set_training(true)?;
        assert_eq!(rbf.parameter_count(), 0);
        assert!(rbf.prototypes().to_variable().node().is_none());
        Ok(())
    }
}
