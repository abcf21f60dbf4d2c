use crate::result::Result;
use ndarray::{Array2, Array3, Array4, ArrayView4, Axis, Zip};

/// Unfolds the \[kh, kw\] windows of `input` \[N, C, H, W\] into rows.
///
/// Returns \[N * OH * OW, C * kh * kw\], where OH = H - kh + 1 and OW = W - kw + 1.
pub(super) fn im2col(input: ArrayView4<f32>, filter: [usize; 2]) -> Result<Array2<f32>> {
    let (n, c, h, w) = input.dim();
    let [kh, kw] = filter;
    let (oh, ow) = (h + 1 - kh, w + 1 - kw);
    let mut cols = Array3::zeros([n, oh * ow, c * kh * kw]);
    Zip::from(cols.axis_iter_mut(Axis(0)))
        .and(input.axis_iter(Axis(0)))
        .par_for_each(|mut cols, x| {
            for ((p, k), y) in cols.indexed_iter_mut() {
                let (i, j) = (p / ow, p % ow);
                let (ci, r) = (k / (kh * kw), k % (kh * kw));
                *y = x[(ci, i + r / kw, j + r % kw)];
            }
        });
    Ok(cols.into_shape([n * oh * ow, c * kh * kw])?)
}

/// Folds `cols` back into an array of `shape`, summing overlapping windows.
///
/// The adjoint of [`im2col`].
pub(super) fn col2im(
    cols: Array2<f32>,
    shape: [usize; 4],
    filter: [usize; 2],
) -> Result<Array4<f32>> {
    let [n, c, h, w] = shape;
    let [kh, kw] = filter;
    let (oh, ow) = (h + 1 - kh, w + 1 - kw);
    let cols = cols
        .as_standard_layout()
        .into_owned()
        .into_shape([n, oh * ow, c * kh * kw])?;
    let mut output = Array4::zeros(shape);
    Zip::from(output.axis_iter_mut(Axis(0)))
        .and(cols.axis_iter(Axis(0)))
        .par_for_each(|mut y, cols| {
            for ((p, k), x) in cols.indexed_iter() {
                let (i, j) = (p / ow, p % ow);
                let (ci, r) = (k / (kh * kw), k % (kh * kw));
                y[(ci, i + r / kw, j + r % kw)] += *x;
            }
        });
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn im2col_windows() -> Result<()> {
        let input = Array::from_shape_vec([1, 1, 3, 3], (0..9).map(|x| x as f32).collect())?;
        let cols = im2col(input.view(), [2, 2])?;
        assert_eq!(cols.shape(), &[4, 4]);
        assert_eq!(cols.row(0).to_vec(), vec![0., 1., 3., 4.]);
        assert_eq!(cols.row(3).to_vec(), vec![4., 5., 7., 8.]);
        Ok(())
    }

    #[test]
    fn col2im_counts_overlaps() -> Result<()> {
        let output = col2im(Array2::ones([4, 4]), [1, 1, 3, 3], [2, 2])?;
        let counts = output.iter().copied().collect::<Vec<_>>();
        assert_eq!(counts, vec![1., 2., 1., 2., 4., 2., 1., 2., 1.]);
        Ok(())
    }
}
