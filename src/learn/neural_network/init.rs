//! Fan-in scaled uniform initialization.
//!
//! Weights and biases of a unit with `F` incoming connections are drawn from
//! `U(-2.4 / F, 2.4 / F)`.
use ndarray::{Array, Array1, Array2, Array4, ArrayView2};
use rand::{distributions::Uniform, Rng};

/// The numerator of the bound.
pub const SCALE: f32 = 2.4;

/// The bound `2.4 / fan_in`.
pub fn bound(fan_in: usize) -> f32 {
    SCALE / fan_in.max(1) as f32
}

/// The distribution for a unit with `fan_in` inputs.
pub fn uniform(fan_in: usize) -> Uniform<f32> {
    let a = bound(fan_in);
    Uniform::new_inclusive(-a, a)
}

/// The fan in of each output map of a convolution.
///
/// `connections` is the \[outputs, inputs\] table, None means fully connected.
pub fn conv2_fan_in(
    outputs: usize,
    inputs: usize,
    filter: [usize; 2],
    connections: Option<ArrayView2<bool>>,
) -> Vec<usize> {
    let [kh, kw] = filter;
    (0..outputs)
        .map(|o| {
            let connected = connections.map_or(inputs, |connections| {
                connections.row(o).iter().filter(|x| **x).count()
            });
            connected * kh * kw
        })
        .collect()
}

/// Weight \[outputs, inputs, kh, kw\] and bias \[outputs\] of a convolution.
///
/// Disconnected weights are 0.
pub fn conv2<R: Rng>(
    rng: &mut R,
    outputs: usize,
    inputs: usize,
    filter: [usize; 2],
    connections: Option<ArrayView2<bool>>,
) -> (Array4<f32>, Array1<f32>) {
    let [kh, kw] = filter;
    let distributions: Vec<_> = conv2_fan_in(outputs, inputs, filter, connections)
        .into_iter()
        .map(uniform)
        .collect();
    let weight = Array::from_shape_fn([outputs, inputs, kh, kw], |(o, c, _, _)| {
        let connected = connections.map_or(true, |connections| connections[(o, c)]);
        if connected {
            rng.sample(&distributions[o])
        } else {
            0.
        }
    });
    let bias = Array::from_shape_fn(outputs, |o| rng.sample(&distributions[o]));
    (weight, bias)
}

/// Coefficient and bias \[channels\] of a subsampling layer.
pub fn subsample2<R: Rng>(
    rng: &mut R,
    channels: usize,
    size: usize,
) -> (Array1<f32>, Array1<f32>) {
    let distribution = uniform(size * size);
    let weight = Array::from_shape_simple_fn(channels, || rng.sample(&distribution));
    let bias = Array::from_shape_simple_fn(channels, || rng.sample(&distribution));
    (weight, bias)
}

/// Weight \[outputs, inputs\] and bias \[outputs\] of a dense layer.
pub fn dense<R: Rng>(rng: &mut R, inputs: usize, outputs: usize) -> (Array2<f32>, Array1<f32>) {
    let distribution = uniform(inputs);
    let weight = Array::from_shape_simple_fn([outputs, inputs], || rng.sample(&distribution));
    let bias = Array::from_shape_simple_fn(outputs, || rng.sample(&distribution));
    (weight, bias)
}

/// Prototypes \[outputs, inputs\] of +-1.
pub fn prototypes<R: Rng>(rng: &mut R, inputs: usize, outputs: usize) -> Array2<f32> {
    Array::from_shape_simple_fn([outputs, inputs], || if rng.gen() { 1. } else { -1. })
}
