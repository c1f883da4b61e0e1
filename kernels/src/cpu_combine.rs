use crate::{check_row_offset, Combiner, KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Reduces CSR segments of looked-up rows into one vector per segment.
///
/// # Arguments
///
/// * `rows` - Flattened `[num_rows, vec_size]` buffer of gathered embedding rows.
/// * `row_index` - For every key in the CSR value array, the row in `rows` holding its vector.
/// * `row_offset` - CSR boundaries; segment `i` covers `row_index[row_offset[i]..row_offset[i + 1]]`.
/// * `vec_size` - Embedding vector width.
/// * `combiner` - `Sum` adds the rows, `Mean` divides the sum by the segment length.
///
/// # Returns
///
/// A flattened `[row_offset.len() - 1, vec_size]` buffer. Empty segments produce zeros.
pub fn cpu_combine_forward<T: KernelElem>(
    rows: &[T],
    row_index: &[usize],
    row_offset: &[usize],
    vec_size: usize,
    combiner: Combiner,
) -> Result<Vec<T>> {
    check_row_offset(row_offset, row_index.len())?;
    if vec_size == 0 || rows.len() % vec_size != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![vec_size],
            got: vec![rows.len()],
        });
    }
    let num_rows = rows.len() / vec_size;
    if let Some(&bad) = row_index.iter().find(|&&i| i >= num_rows) {
        return Err(KernelError::IndexOutOfBounds {
            index: bad,
            len: num_rows,
        });
    }

    let segments = row_offset.len() - 1;
    let mut out = vec![T::zero(); segments * vec_size];

    out.par_chunks_mut(vec_size)
        .enumerate()
        .for_each(|(seg, dst)| {
            let (start, end) = (row_offset[seg], row_offset[seg + 1]);
            for &row in &row_index[start..end] {
                let src = &rows[row * vec_size..(row + 1) * vec_size];
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += *s;
                }
            }
            if combiner == Combiner::Mean && end > start {
                let scale = T::from_usize(end - start).unwrap_or_else(T::one);
                for d in dst.iter_mut() {
                    *d = *d / scale;
                }
            }
        });

    Ok(out)
}

/// Backward of [`cpu_combine_forward`]: expands one gradient per segment into one gradient
/// per key occurrence.
///
/// Returns a flattened `[row_offset[last], vec_size]` buffer where occurrence `j` of segment
/// `i` receives `top_grad[i]` (divided by the segment length for `Mean`).
pub fn cpu_combine_backward<T: KernelElem>(
    top_grad: &[T],
    row_offset: &[usize],
    vec_size: usize,
    combiner: Combiner,
) -> Result<Vec<T>> {
    let Some(&nnz) = row_offset.last() else {
        return Err(KernelError::MalformedOffsets(
            "row_offset must hold at least one entry".to_string(),
        ));
    };
    check_row_offset(row_offset, nnz)?;
    let segments = row_offset.len() - 1;
    if top_grad.len() != segments * vec_size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![segments, vec_size],
            got: vec![top_grad.len()],
        });
    }

    let mut out = vec![T::zero(); nnz * vec_size];
    // Segment of every occurrence, so the output can be filled row-parallel.
    let mut owner = vec![0usize; nnz];
    for seg in 0..segments {
        owner[row_offset[seg]..row_offset[seg + 1]].fill(seg);
    }

    out.par_chunks_mut(vec_size)
        .zip(owner.par_iter())
        .for_each(|(dst, &seg)| {
            let src = &top_grad[seg * vec_size..(seg + 1) * vec_size];
            match combiner {
                Combiner::Sum => dst.copy_from_slice(src),
                Combiner::Mean => {
                    let len = row_offset[seg + 1] - row_offset[seg];
                    let scale = T::from_usize(len).unwrap_or_else(T::one);
                    for (d, s) in dst.iter_mut().zip(src) {
                        *d = *s / scale;
                    }
                }
            }
        });

    Ok(out)
}
