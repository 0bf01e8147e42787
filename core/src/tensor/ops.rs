//! Tensor operations.
//!
//! # Overview
//!
//! - **Element-wise arithmetic**: `+`, `-`, `*`, `/` on `&Tensor` with exact shape matching.
//! - **Linear algebra**: batched `matmul` and last-two-axes `transpose`.
//! - **Layout**: `permute`, `narrow`, `concat`, `expand` and its reverse `sum_to`.
//! - **Convolution**: `conv2d` / `conv3d` and their backward passes.
//!
//! Element-wise arithmetic is strict: shapes must match exactly. Broadcasting is explicit
//! through [`Tensor::expand`], which keeps a prediction of one frame from silently being
//! compared against a ten-frame target.
//!
//! ```rust
//! use sa_convlstm::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//!
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Result, Tensor, TensorElem, TensorError, compute_strides};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

macro_rules! elementwise {
    ($($trait:ident :: $method:ident),*) => {
        $(
            impl<T: TensorElem, const RANK: usize> $trait for &Tensor<T, RANK> {
                type Output = Result<Tensor<T, RANK>>;

                fn $method(self, rhs: Self) -> Self::Output {
                    self.zip_map(rhs, |a, b| $trait::$method(a, b))
                }
            }
        )*
    };
}

elementwise!(Add::add, Sub::sub, Mul::mul, Div::div);

/// Splits `shape` around `dim` into `(outer, extent, inner)` element counts.
fn axis_split(shape: &[usize], dim: usize) -> (usize, usize, usize) {
    let outer = shape[..dim].iter().product();
    let inner = shape[dim + 1..].iter().product();
    (outer, shape[dim], inner)
}

/// Output length of one convolution axis whose input was already validated by a kernel.
fn conv_out_len(input: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> usize {
    (input + 2 * padding - dilation * (kernel - 1) - 1) / stride + 1
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies a function element-wise to the tensor.
    ///
    /// ```rust
    /// use sa_convlstm::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let data: Vec<T> = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::from_parts(data, self.shape)
    }

    /// Combines two tensors of identical shape element-wise.
    pub fn zip_map<F>(&self, rhs: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }

        let data: Vec<T> = self
            .data
            .par_iter()
            .zip(rhs.data.par_iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Tensor::from_parts(data, self.shape))
    }

    /// Sum of all elements, accumulated sequentially so results are reproducible.
    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// Arithmetic mean of all elements.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` for an empty tensor.
    pub fn mean(&self) -> Result<T> {
        let n = self.size();
        if n == 0 {
            return Err(TensorError::Unsupported("mean of an empty tensor".into()));
        }
        let n = T::from_usize(n)
            .ok_or_else(|| TensorError::Unsupported(format!("{} is not representable", n)))?;
        Ok(self.sum() / n)
    }

    /// Batched matrix multiplication over the last two axes.
    ///
    /// - Rank 2: `[M, K] x [K, N] -> [M, N]`
    /// - Rank 3: `[B, M, K] x [B, K, N] -> [B, M, N]`
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        if self.shape[..RANK - 2] != rhs.shape[..RANK - 2] {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 1];

        let out_data =
            sa_convlstm_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;
        Ok(Tensor::from_parts(out_data, out_shape))
    }

    /// Reorders axes: output axis `d` is input axis `axes[d]`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` for an axis `>= RANK` and
    /// `TensorError::ShapeMismatch` when `axes` repeats an axis.
    pub fn permute(&self, axes: [usize; RANK]) -> Result<Self> {
        if let Some(&bad) = axes.iter().find(|&&a| a >= RANK) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![bad],
                shape: self.shape.to_vec(),
            });
        }

        let (data, permuted) = sa_convlstm_kernels::cpu_permute(&self.data, &self.shape, &axes)?;
        let mut shape = [0; RANK];
        shape.copy_from_slice(&permuted);
        Ok(Tensor::from_parts(data, shape))
    }

    /// Swaps two axes of the tensor.
    pub fn transpose_axes(&self, ax1: usize, ax2: usize) -> Result<Self> {
        if ax1 >= RANK || ax2 >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![ax1, ax2],
                shape: self.shape.to_vec(),
            });
        }
        if ax1 == ax2 {
            return Ok(self.clone());
        }

        let mut axes = [0; RANK];
        for (d, axis) in axes.iter_mut().enumerate() {
            *axis = d;
        }
        axes.swap(ax1, ax2);
        self.permute(axes)
    }

    /// Swaps the last two axes, turning `[..., M, N]` into `[..., N, M]`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` below rank 2.
    pub fn transpose(&self) -> Result<Self> {
        if RANK < 2 {
            return Err(TensorError::Unsupported(format!(
                "transpose needs rank >= 2, got {RANK}"
            )));
        }
        self.transpose_axes(RANK - 2, RANK - 1)
    }

    /// Selects `len` consecutive entries starting at `start` along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        if dim >= RANK || start + len > self.shape[dim] {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim, start + len],
                shape: self.shape.to_vec(),
            });
        }

        let (outer, extent, inner) = axis_split(&self.shape, dim);
        let mut shape = self.shape;
        shape[dim] = len;

        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * extent + start) * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }
        Ok(Tensor::from_parts(data, shape))
    }

    /// Scatters this tensor back into zeros of extent `full_len` along `dim`, at `start`.
    ///
    /// This is the gradient of [`Tensor::narrow`].
    pub fn narrow_backward(&self, dim: usize, start: usize, full_len: usize) -> Result<Self> {
        if dim >= RANK || start + self.shape[dim] > full_len {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim, start + self.shape.get(dim).copied().unwrap_or(0)],
                shape: vec![full_len],
            });
        }

        let (outer, len, inner) = axis_split(&self.shape, dim);
        let mut shape = self.shape;
        shape[dim] = full_len;

        let mut data = vec![T::zero(); outer * full_len * inner];
        for o in 0..outer {
            let src = o * len * inner;
            let dst = (o * full_len + start) * inner;
            data[dst..dst + len * inner].copy_from_slice(&self.data[src..src + len * inner]);
        }
        Ok(Tensor::from_parts(data, shape))
    }

    /// Concatenates tensors along `dim`. All other extents must agree.
    pub fn concat(parts: &[&Self], dim: usize) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| TensorError::Unsupported("concat of zero tensors".into()))?;
        if dim >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim],
                shape: first.shape.to_vec(),
            });
        }

        let mut shape = first.shape;
        shape[dim] = 0;
        for part in parts {
            let compatible = (0..RANK).all(|d| d == dim || part.shape[d] == first.shape[d]);
            if !compatible {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.to_vec(),
                    got: part.shape.to_vec(),
                });
            }
            shape[dim] += part.shape[dim];
        }

        let (outer, _, inner) = axis_split(&first.shape, dim);
        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for part in parts {
                let chunk = part.shape[dim] * inner;
                data.extend_from_slice(&part.data[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(Tensor::from_parts(data, shape))
    }

    /// Broadcasts size-1 axes to `shape`. Every other axis must already match.
    pub fn expand(&self, shape: [usize; RANK]) -> Result<Self> {
        let compatible = (0..RANK).all(|d| self.shape[d] == shape[d] || self.shape[d] == 1);
        if !compatible {
            return Err(TensorError::ShapeMismatch {
                expected: shape.to_vec(),
                got: self.shape.to_vec(),
            });
        }
        if shape == self.shape {
            return Ok(self.clone());
        }

        let mut src_strides = self.strides;
        for d in 0..RANK {
            if self.shape[d] == 1 {
                src_strides[d] = 0;
            }
        }
        let out_strides = compute_strides(&shape);
        let size: usize = shape.iter().product();

        let data: Vec<T> = (0..size)
            .into_par_iter()
            .map(|i| {
                let mut rem = i;
                let mut offset = 0;
                for d in 0..RANK {
                    offset += (rem / out_strides[d]) * src_strides[d];
                    rem %= out_strides[d];
                }
                self.data[offset]
            })
            .collect();
        Ok(Tensor::from_parts(data, shape))
    }

    /// Sums over the axes where `shape` is 1, producing a tensor of `shape`.
    ///
    /// This is the gradient of [`Tensor::expand`].
    pub fn sum_to(&self, shape: [usize; RANK]) -> Result<Self> {
        let compatible = (0..RANK).all(|d| self.shape[d] == shape[d] || shape[d] == 1);
        if !compatible {
            return Err(TensorError::ShapeMismatch {
                expected: shape.to_vec(),
                got: self.shape.to_vec(),
            });
        }
        if shape == self.shape {
            return Ok(self.clone());
        }

        let mut dst_strides = compute_strides(&shape);
        for d in 0..RANK {
            if shape[d] == 1 {
                dst_strides[d] = 0;
            }
        }

        let mut data = vec![T::zero(); shape.iter().product()];
        for (i, &value) in self.data.iter().enumerate() {
            let mut rem = i;
            let mut offset = 0;
            for d in 0..RANK {
                offset += (rem / self.strides[d]) * dst_strides[d];
                rem %= self.strides[d];
            }
            data[offset] += value;
        }
        Ok(Tensor::from_parts(data, shape))
    }
}

impl<T> Tensor<T, 4>
where
    T: TensorElem,
{
    /// 2D convolution of `[B, C, H, W]` with a `[O, C, kH, kW]` weight.
    ///
    /// Output shape: `[B, O, out_h, out_w]`.
    pub fn conv2d(
        &self,
        weight: &Tensor<T, 4>,
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
    ) -> Result<Self> {
        let out_data = sa_convlstm_kernels::cpu_conv2d(
            &self.data,
            &weight.data,
            &self.shape,
            &weight.shape,
            stride,
            padding,
            dilation,
        )?;

        let out_shape = [
            self.shape[0],
            weight.shape[0],
            conv_out_len(self.shape[2], weight.shape[2], stride[0], padding[0], dilation[0]),
            conv_out_len(self.shape[3], weight.shape[3], stride[1], padding[1], dilation[1]),
        ];
        Ok(Tensor::from_parts(out_data, out_shape))
    }

    /// Gradients of [`Tensor::conv2d`]: returns `(grad_input, grad_weight)`.
    pub fn conv2d_backward(
        input: &Self,
        weight: &Self,
        grad_output: &Self,
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
    ) -> Result<(Self, Self)> {
        let grad_input = sa_convlstm_kernels::cpu_conv2d_backward_input(
            &grad_output.data,
            &weight.data,
            &input.shape,
            &weight.shape,
            stride,
            padding,
            dilation,
        )?;
        let grad_weight = sa_convlstm_kernels::cpu_conv2d_backward_weight(
            &input.data,
            &grad_output.data,
            &input.shape,
            &weight.shape,
            stride,
            padding,
            dilation,
        )?;
        Ok((
            Tensor::from_parts(grad_input, input.shape),
            Tensor::from_parts(grad_weight, weight.shape),
        ))
    }
}

impl<T> Tensor<T, 5>
where
    T: TensorElem,
{
    /// 3D convolution of `[B, C, D, H, W]` with a `[O, C, kD, kH, kW]` weight.
    ///
    /// Output shape: `[B, O, out_d, out_h, out_w]`.
    pub fn conv3d(
        &self,
        weight: &Tensor<T, 5>,
        stride: [usize; 3],
        padding: [usize; 3],
        dilation: [usize; 3],
    ) -> Result<Self> {
        let geometry = sa_convlstm_kernels::Conv3dGeometry::new(
            &self.shape,
            &weight.shape,
            stride,
            padding,
            dilation,
        )?;
        let out_data = sa_convlstm_kernels::cpu_conv3d(
            &self.data,
            &weight.data,
            &self.shape,
            &weight.shape,
            stride,
            padding,
            dilation,
        )?;
        Ok(Tensor::from_parts(out_data, geometry.output_shape()))
    }

    /// Gradients of [`Tensor::conv3d`]: returns `(grad_input, grad_weight)`.
    pub fn conv3d_backward(
        input: &Self,
        weight: &Self,
        grad_output: &Self,
        stride: [usize; 3],
        padding: [usize; 3],
        dilation: [usize; 3],
    ) -> Result<(Self, Self)> {
        let grad_input = sa_convlstm_kernels::cpu_conv3d_backward_input(
            &grad_output.data,
            &weight.data,
            &input.shape,
            &weight.shape,
            stride,
            padding,
            dilation,
        )?;
        let grad_weight = sa_convlstm_kernels::cpu_conv3d_backward_weight(
            &input.data,
            &grad_output.data,
            &input.shape,
            &weight.shape,
            stride,
            padding,
            dilation,
        )?;
        Ok((
            Tensor::from_parts(grad_input, input.shape),
            Tensor::from_parts(grad_weight, weight.shape),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange<const RANK: usize>(shape: [usize; RANK]) -> Tensor<f32, RANK> {
        let size = shape.iter().product::<usize>();
        Tensor::new((0..size).map(|i| i as f32).collect(), shape).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();

        assert_eq!((&a + &b).unwrap().data(), &[4.0, 6.0]);
        assert_eq!((&a - &b).unwrap().data(), &[-2.0, -2.0]);
        assert_eq!((&a * &b).unwrap().data(), &[3.0, 8.0]);
        assert_eq!((&b / &a).unwrap().data(), &[3.0, 2.0]);

        let c = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
        assert!(matches!(&a + &c, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_sum_mean() {
        let t = arange([2, 3]);
        assert_eq!(t.sum(), 15.0);
        assert_eq!(t.mean().unwrap(), 2.5);

        let empty = Tensor::<f32, 1>::zeros([0]);
        assert!(empty.mean().is_err());
    }

    #[test]
    fn test_matmul_2d() {
        let a = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
        let b = Tensor::<f32, 2>::new(vec![7.0, 8.0, 9.0, 1.0, 2.0, 3.0], [3, 2]).unwrap();

        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[31.0, 19.0, 85.0, 55.0]);
    }

    #[test]
    fn test_matmul_3d() {
        let a = Tensor::<f32, 3>::new(vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0], [2, 2, 2])
            .unwrap();
        let b = arange([2, 2, 2]);

        let c = a.matmul(&b).unwrap();
        assert_eq!(c.data(), &[0.0, 1.0, 2.0, 3.0, 8.0, 10.0, 12.0, 14.0]);
    }

    #[test]
    fn test_matmul_batch_mismatch() {
        let a = Tensor::<f32, 3>::zeros([2, 2, 2]);
        let b = Tensor::<f32, 3>::zeros([3, 2, 2]);
        assert!(matches!(a.matmul(&b), Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_transpose() {
        let t = arange([2, 3]);
        let t_t = t.transpose().unwrap();
        assert_eq!(t_t.shape(), &[3, 2]);
        assert_eq!(t_t.data(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_transpose_axes() {
        // [B, S, H, D] -> [B, H, S, D]
        let t = arange([1, 2, 2, 2]);
        let permuted = t.transpose_axes(1, 2).unwrap();
        assert_eq!(permuted.data(), &[0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]);

        assert!(matches!(
            t.transpose_axes(0, 4),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_permute_video_to_time_major() {
        // [B=1, C=2, T=3, H=1, W=1] -> [T, B, C, H, W]
        let t = arange([1, 2, 3, 1, 1]);
        let p = t.permute([2, 0, 1, 3, 4]).unwrap();
        assert_eq!(p.shape(), &[3, 1, 2, 1, 1]);
        assert_eq!(p.data(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_narrow_and_backward() {
        // [1, 2, 3]: take time steps 1..3 of both channels
        let t = arange([1, 2, 3]);
        let n = t.narrow(2, 1, 2).unwrap();
        assert_eq!(n.shape(), &[1, 2, 2]);
        assert_eq!(n.data(), &[1.0, 2.0, 4.0, 5.0]);

        let back = n.narrow_backward(2, 1, 3).unwrap();
        assert_eq!(back.data(), &[0.0, 1.0, 2.0, 0.0, 4.0, 5.0]);

        assert!(matches!(
            t.narrow(2, 2, 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_concat() {
        let a = arange([1, 2, 1]);
        let b = Tensor::<f32, 3>::full([1, 2, 2], 9.0);
        let c = Tensor::concat(&[&a, &b], 2).unwrap();
        assert_eq!(c.shape(), &[1, 2, 3]);
        assert_eq!(c.data(), &[0.0, 9.0, 9.0, 1.0, 9.0, 9.0]);

        let wrong = Tensor::<f32, 3>::zeros([1, 3, 1]);
        assert!(matches!(
            Tensor::concat(&[&a, &wrong], 2),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_expand_and_sum_to() {
        let bias = Tensor::<f32, 4>::new(vec![1.0, 2.0], [1, 2, 1, 1]).unwrap();
        let wide = bias.expand([2, 2, 1, 2]).unwrap();
        assert_eq!(wide.data(), &[1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);

        let folded = wide.sum_to([1, 2, 1, 1]).unwrap();
        assert_eq!(folded.data(), &[4.0, 8.0]);

        assert!(matches!(
            bias.expand([1, 3, 1, 1]),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_conv2d_shape() {
        let x = Tensor::<f32, 4>::ones([2, 3, 8, 8]);
        let w = Tensor::<f32, 4>::ones([4, 3, 3, 3]);
        let y = x.conv2d(&w, [1, 1], [1, 1], [1, 1]).unwrap();
        assert_eq!(y.shape(), &[2, 4, 8, 8]);
        // Interior pixel sees all 27 taps
        assert_eq!(y.data()[8 + 1], 27.0);

        let valid = x.conv2d(&w, [2, 2], [0, 0], [1, 1]).unwrap();
        assert_eq!(valid.shape(), &[2, 4, 3, 3]);
    }

    #[test]
    fn test_conv3d_backward_shapes() {
        let x = Tensor::<f64, 5>::ones([1, 2, 3, 4, 4]);
        let w = Tensor::<f64, 5>::ones([1, 2, 3, 3, 3]);
        let y = x.conv3d(&w, [1; 3], [1; 3], [1; 3]).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3, 4, 4]);

        let (gx, gw) = Tensor::conv3d_backward(&x, &w, &y, [1; 3], [1; 3], [1; 3]).unwrap();
        assert_eq!(gx.shape(), x.shape());
        assert_eq!(gw.shape(), w.shape());
    }
}
