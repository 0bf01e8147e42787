use crate::{KernelElem, KernelError, Result, check_len};
use rayon::prelude::*;

/// Batched matrix product over the last two axes.
///
/// `lhs` is `[..., M, K]` and `rhs` is `[..., K, N]` with identical leading axes; the result
/// is `[..., M, N]`. Each output row accumulates `lhs[i, k] * rhs[k, ..]` row by row, so both
/// operands are read in storage order.
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if RANK < 2 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![2],
            got: vec![RANK],
        });
    }
    let (m, k, n) = (lhs_shape[RANK - 2], lhs_shape[RANK - 1], rhs_shape[RANK - 1]);
    if rhs_shape[RANK - 2] != k {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 2]],
        });
    }
    if lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape[..RANK - 2].to_vec(),
            got: rhs_shape[..RANK - 2].to_vec(),
        });
    }
    check_len(lhs_data, lhs_shape)?;
    check_len(rhs_data, rhs_shape)?;

    let batch: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out = vec![T::zero(); batch * m * n];
    if out.is_empty() {
        return Ok(out);
    }

    out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
        let b = row / m;
        let a_row = &lhs_data[row * k..(row + 1) * k];
        let rhs_batch = &rhs_data[b * k * n..(b + 1) * k * n];
        for (&a, rhs_row) in a_row.iter().zip(rhs_batch.chunks_exact(n)) {
            if a == T::zero() {
                continue;
            }
            for (slot, &r) in out_row.iter_mut().zip(rhs_row) {
                *slot += a * r;
            }
        }
    });

    Ok(out)
}
