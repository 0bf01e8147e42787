use crate::cpu_conv3d::{cpu_conv3d, cpu_conv3d_backward_input, cpu_conv3d_backward_weight};
use crate::{KernelElem, KernelError, Result};

/// Lifts `[B, C, H, W]` / `[O, C, kH, kW]` shapes to their unit-depth 3D equivalents.
///
/// Row-major memory is identical for both views, so no data is copied.
fn lift_shapes(input_shape: &[usize], weight_shape: &[usize]) -> Result<([usize; 5], [usize; 5])> {
    if input_shape.len() != 4 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![4], // Rank 4
            got: vec![input_shape.len()],
        });
    }
    if weight_shape.len() != 4 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![4], // Rank 4
            got: vec![weight_shape.len()],
        });
    }

    let input = [
        input_shape[0],
        input_shape[1],
        1,
        input_shape[2],
        input_shape[3],
    ];
    let weight = [
        weight_shape[0],
        weight_shape[1],
        1,
        weight_shape[2],
        weight_shape[3],
    ];
    Ok((input, weight))
}

/// Performs 2D Convolution on CPU.
///
/// # Arguments
///
/// * `input` - Input tensor data (flattened). Shape: `[batch_size, in_channels, height, width]`
/// * `weight` - Weight tensor data (flattened). Shape: `[out_channels, in_channels, kernel_h, kernel_w]`
/// * `input_shape` - Shape of the input tensor.
/// * `weight_shape` - Shape of the weight tensor.
/// * `stride` - Stride of the convolution: `[stride_h, stride_w]`
/// * `padding` - Padding added to both sides of the input: `[pad_h, pad_w]`
/// * `dilation` - Dilation of the kernel: `[dil_h, dil_w]`
///
/// # Returns
///
/// A flattened vector containing the result of the convolution.
/// Output shape: `[batch_size, out_channels, out_h, out_w]`
pub fn cpu_conv2d<T: KernelElem>(
    input: &[T],
    weight: &[T],
    input_shape: &[usize],
    weight_shape: &[usize],
    stride: [usize; 2],
    padding: [usize; 2],
    dilation: [usize; 2],
) -> Result<Vec<T>> {
    let (input_5d, weight_5d) = lift_shapes(input_shape, weight_shape)?;
    cpu_conv3d(
        input,
        weight,
        &input_5d,
        &weight_5d,
        [1, stride[0], stride[1]],
        [0, padding[0], padding[1]],
        [1, dilation[0], dilation[1]],
    )
}

/// Gradient of [`cpu_conv2d`] with respect to its input. Result shape: `input_shape`.
pub fn cpu_conv2d_backward_input<T: KernelElem>(
    grad_output: &[T],
    weight: &[T],
    input_shape: &[usize],
    weight_shape: &[usize],
    stride: [usize; 2],
    padding: [usize; 2],
    dilation: [usize; 2],
) -> Result<Vec<T>> {
    let (input_5d, weight_5d) = lift_shapes(input_shape, weight_shape)?;
    cpu_conv3d_backward_input(
        grad_output,
        weight,
        &input_5d,
        &weight_5d,
        [1, stride[0], stride[1]],
        [0, padding[0], padding[1]],
        [1, dilation[0], dilation[1]],
    )
}

/// Gradient of [`cpu_conv2d`] with respect to its weight. Result shape: `weight_shape`.
pub fn cpu_conv2d_backward_weight<T: KernelElem>(
    input: &[T],
    grad_output: &[T],
    input_shape: &[usize],
    weight_shape: &[usize],
    stride: [usize; 2],
    padding: [usize; 2],
    dilation: [usize; 2],
) -> Result<Vec<T>> {
    let (input_5d, weight_5d) = lift_shapes(input_shape, weight_shape)?;
    cpu_conv3d_backward_weight(
        input,
        grad_output,
        &input_5d,
        &weight_5d,
        [1, stride[0], stride[1]],
        [0, padding[0], padding[1]],
        [1, dilation[0], dilation[1]],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv2d_simple() {
        // 1x1x3x3 input, 1x1x2x2 kernel of ones, no padding -> 2x2 sums of windows
        let input = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let weight = vec![1.0; 4];
        let out = cpu_conv2d(
            &input,
            &weight,
            &[1, 1, 3, 3],
            &[1, 1, 2, 2],
            [1, 1],
            [0, 0],
            [1, 1],
        )
        .unwrap();
        assert_eq!(out, vec![12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn test_conv2d_same_padding() {
        // Center tap only: a 3x3 identity kernel with padding 1 returns the input.
        let input: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let mut weight = vec![0.0; 9];
        weight[4] = 1.0;
        let out = cpu_conv2d(
            &input,
            &weight,
            &[1, 1, 4, 4],
            &[1, 1, 3, 3],
            [1, 1],
            [1, 1],
            [1, 1],
        )
        .unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_conv2d_rank_error() {
        let err = cpu_conv2d(&[0.0; 4], &[0.0; 4], &[2, 2], &[1, 1, 2, 2], [1, 1], [0, 0], [1, 1]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_conv2d_backward_input_single_tap() {
        // One 1x1 kernel with weight 2 -> gradient is 2 * grad_output.
        let grad = vec![1.0, -1.0, 0.5, 3.0];
        let dx = cpu_conv2d_backward_input(
            &grad,
            &[2.0],
            &[1, 1, 2, 2],
            &[1, 1, 1, 1],
            [1, 1],
            [0, 0],
            [1, 1],
        )
        .unwrap();
        assert_eq!(dx, vec![2.0, -2.0, 1.0, 6.0]);
    }

    #[test]
    fn test_conv2d_backward_weight_sums_batch() {
        // 1x1 kernel: dL/dw = sum(x * g) over batch and pixels.
        let input = vec![1.0, 2.0, 3.0, 4.0];
        let grad = vec![1.0, 1.0, 1.0, 1.0];
        let dw = cpu_conv2d_backward_weight(
            &input,
            &grad,
            &[2, 1, 1, 2],
            &[1, 1, 1, 1],
            [1, 1],
            [0, 0],
            [1, 1],
        )
        .unwrap();
        assert_eq!(dw, vec![10.0]);
    }
}
