use crate::{error::Error, result::Result};
use anyhow::ensure;
use ndarray::{s, Array1, Array4, ArrayView1, ArrayView2, ArrayView4, Axis};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// MNIST.
pub mod mnist;

/// The number of classes (digits).
pub const CLASSES: usize = 10;

/// Normalization constants.
///
/// Computed once from the training split and applied identically to every split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    mean: f32,
    std: f32,
}

impl Normalization {
    /// Creates from `mean` and `std` of intensities scaled to \[0, 1\].
    ///
    /// **Errors**
    /// - `std` is not positive and finite.
    pub fn new(mean: f32, std: f32) -> Result<Self> {
        ensure!(
            mean.is_finite() && std.is_finite() && std > 0.,
            Error::InvalidConfig(format!("normalization mean = {mean}, std = {std}"))
        );
        Ok(Self { mean, std })
    }
    /// Computes the mean and standard deviation of `images`.
    ///
    /// Pixels are scaled from \[0, 255\] to \[0, 1\] first.
    ///
    /// **Errors**
    /// - `images` is empty.
    /// - All pixels are equal.
    pub fn from_images(images: ArrayView4<u8>) -> Result<Self> {
        ensure!(!images.is_empty(), "Can not normalize an empty dataset!");
        let (min, max) = images
            .iter()
            .fold((u8::MAX, u8::MIN), |(min, max), x| (min.min(*x), max.max(*x)));
        ensure!(
            min != max,
            Error::InvalidConfig(format!("can not normalize constant pixels = {min}"))
        );
        let len = images.len() as f64;
        let sum: f64 = images.iter().map(|x| *x as f64 / 255.).sum();
        let mean = sum / len;
        let var = images
            .iter()
            .map(|x| (*x as f64 / 255. - mean).powi(2))
            .sum::<f64>()
            / len;
        Self::new(mean as f32, var.sqrt() as f32)
    }
    /// The mean.
    pub fn mean(&self) -> f32 {
        self.mean
    }
    /// The standard deviation.
    pub fn std(&self) -> f32 {
        self.std
    }
    /// Normalizes a raw pixel.
    pub fn apply(&self, pixel: u8) -> f32 {
        (pixel as f32 / 255. - self.mean) / self.std
    }
}

/// Options for [`prepare`](PrepareOptions::prepare).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOptions {
    /// The expected resolution of the raw images, \[height, width\].
    pub native: [usize; 2],
    /// The resolution after padding, \[height, width\].
    pub target: [usize; 2],
}

impl Default for PrepareOptions {
    /// 28 x 28 images padded to 32 x 32, as in the paper.
    fn default() -> Self {
        Self {
            native: [28, 28],
            target: [32, 32],
        }
    }
}

impl PrepareOptions {
    /// Pads and normalizes `images` and checks `classes`.
    ///
    /// Images are centered in the target grid, with the border filled with the
    /// normalized background (a raw 0).
    ///
    /// **Errors**
    /// - The images are not \[N, 1, native\] ([`Error::ShapeMismatch`]).
    /// - The number of classes is not N ([`Error::ShapeMismatch`]).
    /// - A class is not in 0..=9 ([`Error::InvalidLabel`]).
    /// - The target is smaller than the native resolution ([`Error::InvalidConfig`]).
    pub fn prepare(
        &self,
        images: ArrayView4<u8>,
        classes: ArrayView1<u8>,
        normalization: &Normalization,
    ) -> Result<Split> {
        let [nh, nw] = self.native;
        let [th, tw] = self.target;
        ensure!(
            th >= nh && tw >= nw,
            Error::InvalidConfig(format!(
                "target {:?} is smaller than native {:?}",
                self.target, self.native
            ))
        );
        let (n, c, h, w) = images.dim();
        ensure!(
            c == 1 && h == nh && w == nw,
            Error::ShapeMismatch {
                expected: vec![1, nh, nw],
                found: images.shape()[1..].to_vec(),
            }
        );
        ensure!(
            classes.len() == n,
            Error::ShapeMismatch {
                expected: vec![n],
                found: classes.shape().to_vec(),
            }
        );
        if let Some(class) = classes.iter().copied().find(|x| *x as usize >= CLASSES) {
            return Err(Error::InvalidLabel(class).into());
        }
        let (top, left) = ((th - nh) / 2, (tw - nw) / 2);
        let mut output = Array4::from_elem([n, 1, th, tw], normalization.apply(0));
        output
            .slice_mut(s![.., .., top..top + nh, left..left + nw])
            .zip_mut_with(&images, |y, x| *y = normalization.apply(*x));
        Ok(Split {
            images: output,
            classes: classes.to_owned(),
        })
    }
}

/// A prepared image with its class.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    /// The padded, normalized image.
    pub image: ArrayView2<'a, f32>,
    /// The class, 0..=9.
    pub class: u8,
}

/// A set of prepared samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    images: Array4<f32>,
    classes: Array1<u8>,
}

impl Split {
    /// Creates a split from prepared `images` \[N, 1, H, W\] and `classes` \[N\].
    ///
    /// **Errors**
    /// - The number of classes is not N.
    /// - The images do not have 1 channel.
    /// - A class is not in 0..=9.
    pub fn new(images: Array4<f32>, classes: Array1<u8>) -> Result<Self> {
        let (n, c, h, w) = images.dim();
        ensure!(
            c == 1,
            Error::ShapeMismatch {
                expected: vec![1, h, w],
                found: images.shape()[1..].to_vec(),
            }
        );
        ensure!(
            classes.len() == n,
            Error::ShapeMismatch {
                expected: vec![n],
                found: classes.shape().to_vec(),
            }
        );
        if let Some(class) = classes.iter().copied().find(|x| *x as usize >= CLASSES) {
            return Err(Error::InvalidLabel(class).into());
        }
        Ok(Self { images, classes })
    }
    /// The number of samples.
    pub fn len(&self) -> usize {
        self.classes.len()
    }
    /// Whether the split is empty.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
    /// The images, \[N, 1, H, W\].
    pub fn images(&self) -> ArrayView4<f32> {
        self.images.view()
    }
    /// The classes, \[N\].
    pub fn classes(&self) -> ArrayView1<u8> {
        self.classes.view()
    }
    /// The sample at `index`.
    pub fn sample(&self, index: usize) -> Option<Sample> {
        let class = *self.classes.get(index)?;
        let image = self
            .images
            .index_axis(Axis(0), index)
            .index_axis_move(Axis(0), 0);
        Some(Sample { image, class })
    }
    /// Iterates over the samples.
    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        (0..self.len()).filter_map(|i| self.sample(i))
    }
    /// The number of samples of each class.
    pub fn class_counts(&self) -> [usize; CLASSES] {
        let mut counts = [0; CLASSES];
        for class in self.classes.iter() {
            counts[*class as usize] += 1;
        }
        counts
    }
    /// Selects the samples at `indices`.
    ///
    /// **Panics**
    ///
    /// If an index is out of bounds.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            images: self.images.select(Axis(0), indices),
            classes: self.classes.select(Axis(0), indices),
        }
    }
    /// Iterates over batches of `batch_size` in order.
    ///
    /// The last batch may be smaller.
    ///
    /// **Panics**
    ///
    /// If `batch_size` is 0.
    pub fn batches(&self, batch_size: usize) -> Batches {
        assert!(batch_size > 0, "batch_size must be positive!");
        Batches {
            split: self,
            order: None,
            range: 0..self.len(),
            batch_size,
        }
    }
    /// Iterates over batches of `batch_size` in an order shuffled by `rng`.
    ///
    /// See [`.batches()`](Self::batches).
    pub fn shuffled_batches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Batches {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        Batches {
            order: Some(order),
            ..self.batches(batch_size)
        }
    }
}

/// Iterator over batches of a [`Split`].
///
/// Yields (images, classes).
#[derive(Debug, Clone)]
pub struct Batches<'a> {
    split: &'a Split,
    order: Option<Vec<usize>>,
    range: Range<usize>,
    batch_size: usize,
}

impl Iterator for Batches<'_> {
    type Item = (Array4<f32>, Array1<u8>);
    fn next(&mut self) -> Option<Self::Item> {
        if self.range.is_empty() {
            return None;
        }
        let start = self.range.start;
        let end = self.range.end.min(start + self.batch_size);
        self.range.start = end;
        let split = self.split;
        if let Some(order) = self.order.as_ref() {
            let indices = &order[start..end];
            Some((
                split.images.select(Axis(0), indices),
                split.classes.select(Axis(0), indices),
            ))
        } else {
            Some((
                split.images.slice(s![start..end, .., .., ..]).to_owned(),
                split.classes.slice(s![start..end]).to_owned(),
            ))
        }
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = (self.range.len() + self.batch_size - 1) / self.batch_size;
        (len, Some(len))
    }
}

impl ExactSizeIterator for Batches<'_> {}
