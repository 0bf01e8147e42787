use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Resolved sizes of a 3D convolution over `[batch, channels, depth, height, width]` data.
///
/// The 2D kernels reuse this geometry with a depth of one, so the index arithmetic for the
/// forward and both backward passes lives in exactly one place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv3dGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub input: [usize; 3],
    pub kernel: [usize; 3],
    pub output: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
}

impl Conv3dGeometry {
    /// Validates the shapes and computes the output extent of every spatial axis.
    ///
    /// `out = floor((in + 2 * pad - dil * (k - 1) - 1) / stride) + 1`
    pub fn new(
        input_shape: &[usize],
        weight_shape: &[usize],
        stride: [usize; 3],
        padding: [usize; 3],
        dilation: [usize; 3],
    ) -> Result<Self> {
        if input_shape.len() != 5 {
            return Err(KernelError::ShapeMismatch {
                expected: vec![5], // Rank 5
                got: vec![input_shape.len()],
            });
        }
        if weight_shape.len() != 5 {
            return Err(KernelError::ShapeMismatch {
                expected: vec![5], // Rank 5
                got: vec![weight_shape.len()],
            });
        }
        if input_shape[1] != weight_shape[1] {
            return Err(KernelError::ShapeMismatch {
                expected: vec![input_shape[1]],
                got: vec![weight_shape[1]],
            });
        }

        let input = [input_shape[2], input_shape[3], input_shape[4]];
        let kernel = [weight_shape[2], weight_shape[3], weight_shape[4]];
        let mut output = [0; 3];

        for axis in 0..3 {
            if kernel[axis] == 0 || stride[axis] == 0 || dilation[axis] == 0 {
                return Err(KernelError::ShapeMismatch {
                    expected: vec![1],
                    got: vec![kernel[axis].min(stride[axis]).min(dilation[axis])],
                });
            }
            let span = dilation[axis] * (kernel[axis] - 1) + 1;
            let padded = input[axis] + 2 * padding[axis];
            if padded < span {
                return Err(KernelError::ShapeMismatch {
                    expected: vec![span], // Minimum padded extent
                    got: vec![padded],
                });
            }
            output[axis] = (padded - span) / stride[axis] + 1;
        }

        Ok(Self {
            batch: input_shape[0],
            in_channels: input_shape[1],
            out_channels: weight_shape[0],
            input,
            kernel,
            output,
            stride,
            padding,
            dilation,
        })
    }

    /// Output shape `[batch, out_channels, out_d, out_h, out_w]`.
    pub fn output_shape(&self) -> [usize; 5] {
        [
            self.batch,
            self.out_channels,
            self.output[0],
            self.output[1],
            self.output[2],
        ]
    }

    fn input_volume(&self) -> usize {
        self.input.iter().product()
    }

    fn output_volume(&self) -> usize {
        self.output.iter().product()
    }

    fn kernel_volume(&self) -> usize {
        self.kernel.iter().product()
    }

    /// Input coordinate touched by output coordinate `o` and kernel tap `k`, if inside the
    /// unpadded input.
    #[inline]
    fn input_index(&self, axis: usize, o: usize, k: usize) -> Option<usize> {
        let pos = (o * self.stride[axis] + k * self.dilation[axis]) as isize
            - self.padding[axis] as isize;
        if pos >= 0 && (pos as usize) < self.input[axis] {
            Some(pos as usize)
        } else {
            None
        }
    }

    /// Output coordinate that reads input coordinate `i` through kernel tap `k`, if any.
    #[inline]
    fn output_index(&self, axis: usize, i: usize, k: usize) -> Option<usize> {
        let num = (i + self.padding[axis]) as isize - (k * self.dilation[axis]) as isize;
        if num < 0 || num as usize % self.stride[axis] != 0 {
            return None;
        }
        let o = num as usize / self.stride[axis];
        (o < self.output[axis]).then_some(o)
    }
}

fn check_len(len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if len != expected {
        return Err(KernelError::ShapeMismatch {
            expected: vec![expected],
            got: vec![len],
        });
    }
    Ok(())
}

/// Performs 3D Convolution on CPU.
///
/// # Arguments
///
/// * `input` - Input data (flattened). Shape: `[batch_size, in_channels, depth, height, width]`
/// * `weight` - Weight data (flattened). Shape: `[out_channels, in_channels, k_d, k_h, k_w]`
/// * `stride`, `padding`, `dilation` - Per spatial axis, `[d, h, w]`.
///
/// # Returns
///
/// Output shape: `[batch_size, out_channels, out_d, out_h, out_w]`
pub fn cpu_conv3d<T: KernelElem>(
    input: &[T],
    weight: &[T],
    input_shape: &[usize],
    weight_shape: &[usize],
    stride: [usize; 3],
    padding: [usize; 3],
    dilation: [usize; 3],
) -> Result<Vec<T>> {
    let geo = Conv3dGeometry::new(input_shape, weight_shape, stride, padding, dilation)?;
    check_len(input.len(), input_shape)?;
    check_len(weight.len(), weight_shape)?;

    let in_volume = geo.input_volume();
    let out_volume = geo.output_volume();
    let k_volume = geo.kernel_volume();
    let [_, in_h, in_w] = geo.input;
    let [k_d, k_h, k_w] = geo.kernel;
    let [out_d, out_h, out_w] = geo.output;

    let mut output = vec![T::zero(); geo.batch * geo.out_channels * out_volume];
    if output.is_empty() {
        return Ok(output);
    }

    // One chunk per (batch, out_channel) plane
    output
        .par_chunks_mut(out_volume)
        .enumerate()
        .for_each(|(plane, out_plane)| {
            let b = plane / geo.out_channels;
            let oc = plane % geo.out_channels;

            for od in 0..out_d {
                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let mut sum = T::zero();

                        for ic in 0..geo.in_channels {
                            let in_base = (b * geo.in_channels + ic) * in_volume;
                            let w_base = (oc * geo.in_channels + ic) * k_volume;

                            for kd in 0..k_d {
                                let Some(id) = geo.input_index(0, od, kd) else {
                                    continue;
                                };
                                for kh in 0..k_h {
                                    let Some(ih) = geo.input_index(1, oh, kh) else {
                                        continue;
                                    };
                                    for kw in 0..k_w {
                                        let Some(iw) = geo.input_index(2, ow, kw) else {
                                            continue;
                                        };
                                        let in_idx = in_base + (id * in_h + ih) * in_w + iw;
                                        let w_idx = w_base + (kd * k_h + kh) * k_w + kw;
                                        sum += input[in_idx] * weight[w_idx];
                                    }
                                }
                            }
                        }

                        out_plane[(od * out_h + oh) * out_w + ow] = sum;
                    }
                }
            }
        });

    Ok(output)
}

/// Gradient of a 3D convolution with respect to its input.
///
/// `grad_output` has the forward output shape; the result has `input_shape`.
pub fn cpu_conv3d_backward_input<T: KernelElem>(
    grad_output: &[T],
    weight: &[T],
    input_shape: &[usize],
    weight_shape: &[usize],
    stride: [usize; 3],
    padding: [usize; 3],
    dilation: [usize; 3],
) -> Result<Vec<T>> {
    let geo = Conv3dGeometry::new(input_shape, weight_shape, stride, padding, dilation)?;
    check_len(grad_output.len(), &geo.output_shape())?;
    check_len(weight.len(), weight_shape)?;

    let in_volume = geo.input_volume();
    let out_volume = geo.output_volume();
    let k_volume = geo.kernel_volume();
    let [in_d, in_h, in_w] = geo.input;
    let [k_d, k_h, k_w] = geo.kernel;
    let [_, out_h, out_w] = geo.output;

    let mut grad_input = vec![T::zero(); geo.batch * geo.in_channels * in_volume];
    if grad_input.is_empty() {
        return Ok(grad_input);
    }

    // One chunk per (batch, in_channel) plane
    grad_input
        .par_chunks_mut(in_volume)
        .enumerate()
        .for_each(|(plane, in_plane)| {
            let b = plane / geo.in_channels;
            let ic = plane % geo.in_channels;

            for id in 0..in_d {
                for ih in 0..in_h {
                    for iw in 0..in_w {
                        let mut sum = T::zero();

                        for oc in 0..geo.out_channels {
                            let g_base = (b * geo.out_channels + oc) * out_volume;
                            let w_base = (oc * geo.in_channels + ic) * k_volume;

                            for kd in 0..k_d {
                                let Some(od) = geo.output_index(0, id, kd) else {
                                    continue;
                                };
                                for kh in 0..k_h {
                                    let Some(oh) = geo.output_index(1, ih, kh) else {
                                        continue;
                                    };
                                    for kw in 0..k_w {
                                        let Some(ow) = geo.output_index(2, iw, kw) else {
                                            continue;
                                        };
                                        let g_idx = g_base + (od * out_h + oh) * out_w + ow;
                                        let w_idx = w_base + (kd * k_h + kh) * k_w + kw;
                                        sum += grad_output[g_idx] * weight[w_idx];
                                    }
                                }
                            }
                        }

                        in_plane[(id * in_h + ih) * in_w + iw] = sum;
                    }
                }
            }
        });

    Ok(grad_input)
}

/// Gradient of a 3D convolution with respect to its weight.
///
/// Sums over the batch; the result has `weight_shape`.
pub fn cpu_conv3d_backward_weight<T: KernelElem>(
    input: &[T],
    grad_output: &[T],
    input_shape: &[usize],
    weight_shape: &[usize],
    stride: [usize; 3],
    padding: [usize; 3],
    dilation: [usize; 3],
) -> Result<Vec<T>> {
    let geo = Conv3dGeometry::new(input_shape, weight_shape, stride, padding, dilation)?;
    check_len(input.len(), input_shape)?;
    check_len(grad_output.len(), &geo.output_shape())?;

    let in_volume = geo.input_volume();
    let out_volume = geo.output_volume();
    let k_volume = geo.kernel_volume();
    let [_, in_h, in_w] = geo.input;
    let [_, k_h, k_w] = geo.kernel;
    let [out_d, out_h, out_w] = geo.output;

    let mut grad_weight = vec![T::zero(); geo.out_channels * geo.in_channels * k_volume];
    if grad_weight.is_empty() {
        return Ok(grad_weight);
    }

    // One chunk per (out_channel, in_channel) filter
    grad_weight
        .par_chunks_mut(k_volume)
        .enumerate()
        .for_each(|(filter, w_plane)| {
            let oc = filter / geo.in_channels;
            let ic = filter % geo.in_channels;

            for (tap, slot) in w_plane.iter_mut().enumerate() {
                let kd = tap / (k_h * k_w);
                let kh = (tap / k_w) % k_h;
                let kw = tap % k_w;
                let mut sum = T::zero();

                for b in 0..geo.batch {
                    let in_base = (b * geo.in_channels + ic) * in_volume;
                    let g_base = (b * geo.out_channels + oc) * out_volume;

                    for od in 0..out_d {
                        let Some(id) = geo.input_index(0, od, kd) else {
                            continue;
                        };
                        for oh in 0..out_h {
                            let Some(ih) = geo.input_index(1, oh, kh) else {
                                continue;
                            };
                            for ow in 0..out_w {
                                let Some(iw) = geo.input_index(2, ow, kw) else {
                                    continue;
                                };
                                let g_idx = g_base + (od * out_h + oh) * out_w + ow;
                                let in_idx = in_base + (id * in_h + ih) * in_w + iw;
                                sum += grad_output[g_idx] * input[in_idx];
                            }
                        }
                    }
                }

                *slot = sum;
            }
        });

    Ok(grad_weight)
}
