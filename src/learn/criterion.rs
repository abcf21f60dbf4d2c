use super::neural_network::autograd::{Variable, Variable0, Variable2};
use crate::{error::Error, result::Result};
use anyhow::ensure;
use ndarray::{arr0, Array1, Array2, ArrayView1, ArrayView2, ArcArray, Axis, Ix0};
use serde::{Deserialize, Serialize};

/// A criterion computes a value from the output of a model and the target.
pub trait Criterion<X, T> {
    /// The type of the output.
    type Output;
    /// Evaluates the criterion.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// The index of the smallest value.
///
/// Ties and NaN keep the first index.
pub fn argmin(x: ArrayView1<f32>) -> usize {
    let mut min = f32::INFINITY;
    let mut min_index = 0;
    for (i, x) in x.iter().copied().enumerate() {
        if x < min {
            min = x;
            min_index = i;
        }
    }
    min_index
}

/// Accuracy.
///
/// The number of rows where the smallest distance is the target class.
#[derive(Default, Debug)]
pub struct Accuracy;

impl<'a, 'b> Criterion<ArrayView2<'a, f32>, ArrayView1<'b, u8>> for Accuracy {
    type Output = usize;
    fn eval(&self, input: ArrayView2<'a, f32>, target: ArrayView1<'b, u8>) -> Result<usize> {
        ensure!(
            input.nrows() == target.len(),
            "Accuracy input {:?} does not match target {:?}!",
            input.shape(),
            target.shape()
        );
        Ok(input
            .outer_iter()
            .zip(target.iter().copied())
            .filter(|(input, class)| argmin(input.view()) == *class as usize)
            .count())
    }
}

/// Maximum a posteriori loss over distances.
///
/// For the distances `y` of a sample with class `D`:
///
/// `E = y[D] + ln(exp(-j) + sum_i exp(-y[i]))`
///
/// The `exp(-j)` term is a "rubbish" class that keeps the loss from collapsing all
/// prototypes together. With `j` = None (infinite) this is the cross entropy of the
/// softmax of `-y`. The loss is averaged over the batch.
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapLoss {
    j: Option<f32>,
}

impl MapLoss {
    /// Creates the loss with the rubbish class constant `j`.
    pub fn new(j: Option<f32>) -> Self {
        Self { j }
    }
    /// The rubbish class constant, None is infinite.
    pub fn j(&self) -> Option<f32> {
        self.j
    }
    /// Loss per sample and the gradient of the summed loss.
    fn losses_grad(
        &self,
        input: ArrayView2<f32>,
        target: ArrayView1<u8>,
    ) -> Result<(Array1<f32>, Array2<f32>)> {
        let (batch_size, classes) = input.dim();
        ensure!(
            batch_size == target.len(),
            "MapLoss input {:?} does not match target {:?}!",
            input.shape(),
            target.shape()
        );
        ensure!(batch_size > 0, "MapLoss batch is empty!");
        if let Some(class) = target.iter().copied().find(|x| *x as usize >= classes) {
            return Err(Error::InvalidLabel(class).into());
        }
        let j = self.j.unwrap_or(f32::INFINITY);
        let mut losses = Array1::zeros(batch_size);
        let mut grad = Array2::zeros([batch_size, classes]);
        for (((x, class), loss), mut dx) in input
            .outer_iter()
            .zip(target.iter().map(|x| *x as usize))
            .zip(losses.iter_mut())
            .zip(grad.outer_iter_mut())
        {
            // shift by the smallest exponent, including j
            let m = x.iter().copied().fold(j, f32::min);
            let z = (m - j).exp() + x.iter().map(|x| (m - x).exp()).sum::<f32>();
            *loss = x[class] - m + z.ln();
            for (dx, x) in dx.iter_mut().zip(x.iter()) {
                *dx = -(m - x).exp() / z;
            }
            dx[class] += 1.;
        }
        Ok((losses, grad))
    }
}

impl<'a, 'b> Criterion<ArrayView2<'a, f32>, ArrayView1<'b, u8>> for MapLoss {
    type Output = f32;
    fn eval(&self, input: ArrayView2<'a, f32>, target: ArrayView1<'b, u8>) -> Result<f32> {
        let (losses, _) = self.losses_grad(input, target)?;
        Ok(losses.mean().unwrap_or_default())
    }
}

impl<'a> Criterion<Variable2, ArrayView1<'a, u8>> for MapLoss {
    type Output = Variable0;
    fn eval(&self, input: Variable2, target: ArrayView1<'a, u8>) -> Result<Variable0> {
        let (losses, grad) = self.losses_grad(input.value().view(), target)?;
        let batch_size = losses.len() as f32;
        let loss = losses.sum() / batch_size;
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let scale = output_grad[()] / batch_size;
                Ok((grad * scale).into_shared())
            });
        }
        Ok(builder.build(arr0(loss).into_shared()))
    }
}

/// Softmax of the negated distances, the probability of each class.
pub fn probabilities(input: ArrayView2<f32>) -> Array2<f32> {
    let mut output = input.to_owned();
    for mut x in output.axis_iter_mut(Axis(0)) {
        let m = x.iter().copied().fold(f32::INFINITY, f32::min);
        x.mapv_inplace(|x| (m - x).exp());
        let z = x.sum();
        x.mapv_inplace(|x| x / z);
    }
    output
}
