use crate::{KernelElem, KernelError, Result, check_len};
use rayon::prelude::*;

/// Reorders the axes of a row-major buffer.
///
/// Output axis `d` is input axis `axes[d]`, so `axes = [0, 2, 1]` swaps the last two axes of
/// a rank-3 buffer. The returned shape is the permuted input shape.
pub fn cpu_permute<T: KernelElem>(
    data: &[T],
    shape: &[usize],
    axes: &[usize],
) -> Result<(Vec<T>, Vec<usize>)> {
    let rank = shape.len();
    let mut seen = vec![false; rank];
    let valid = axes.len() == rank
        && axes.iter().all(|&a| {
            if a >= rank || seen[a] {
                return false;
            }
            seen[a] = true;
            true
        });
    if !valid {
        return Err(KernelError::ShapeMismatch {
            expected: (0..rank).collect(),
            got: axes.to_vec(),
        });
    }

    let size = check_len(data, shape)?;

    let mut in_strides = vec![1; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        in_strides[d] = in_strides[d + 1] * shape[d + 1];
    }
    let out_shape: Vec<usize> = axes.iter().map(|&a| shape[a]).collect();
    let src_strides: Vec<usize> = axes.iter().map(|&a| in_strides[a]).collect();

    let mut out = vec![T::zero(); size];
    if size == 0 {
        return Ok((out, out_shape));
    }

    let row = out_shape.last().copied().unwrap_or(1);
    let row_stride = src_strides.last().copied().unwrap_or(1);

    out.par_chunks_mut(row)
        .enumerate()
        .for_each(|(row_idx, out_row)| {
            // Decompose the row index over the leading output axes
            let mut rem = row_idx;
            let mut base = 0;
            for d in (0..rank.saturating_sub(1)).rev() {
                base += (rem % out_shape[d]) * src_strides[d];
                rem /= out_shape[d];
            }
            for (j, slot) in out_row.iter_mut().enumerate() {
                *slot = data[base + j * row_stride];
            }
        });

    Ok((out, out_shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permute_swaps_last_axes() {
        // Two 2x3 matrices
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let (out, shape) = cpu_permute(&data, &[2, 2, 3], &[0, 2, 1]).unwrap();
        assert_eq!(shape, vec![2, 3, 2]);
        assert_eq!(
            out,
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0, 7.0, 10.0, 8.0, 11.0, 9.0, 12.0]
        );
    }

    #[test]
    fn test_permute_length_mismatch() {
        let err = cpu_permute(&[1.0; 5], &[2, 3], &[1, 0]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_permute_time_major() {
        // [B=1, C=2, T=2, N=2] -> [B, T, C, N]
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let (out, shape) = cpu_permute(&data, &[1, 2, 2, 2], &[0, 2, 1, 3]).unwrap();
        assert_eq!(shape, vec![1, 2, 2, 2]);
        assert_eq!(out, vec![1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0]);
    }

    #[test]
    fn test_permute_rejects_duplicate_axes() {
        let err = cpu_permute(&[1.0; 4], &[2, 2], &[0, 0]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
