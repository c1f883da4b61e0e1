use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::hash::Hash;

/// Deduplicates `keys` in first-occurrence order.
///
/// Returns `(unique, index)` where `unique[index[j]] == keys[j]` for every `j`.
pub fn unique_index<K: Copy + Eq + Hash>(keys: &[K]) -> (Vec<K>, Vec<usize>) {
    let mut position: HashMap<K, usize> = HashMap::with_capacity(keys.len());
    let mut unique = Vec::new();
    let index = keys
        .iter()
        .map(|&k| {
            *position.entry(k).or_insert_with(|| {
                unique.push(k);
                unique.len() - 1
            })
        })
        .collect();
    (unique, index)
}

/// Sums per-occurrence gradients into one gradient per unique key.
///
/// # Arguments
///
/// * `grads` - Flattened `[occurrences, vec_size]` gradients.
/// * `unique_index` - For every occurrence, the unique slot it accumulates into.
/// * `num_unique` - Number of unique slots.
/// * `vec_size` - Embedding vector width.
///
/// Summation order within a slot follows occurrence order, so the result is deterministic.
pub fn cpu_accumulate_unique<T: KernelElem>(
    grads: &[T],
    unique_index: &[usize],
    num_unique: usize,
    vec_size: usize,
) -> Result<Vec<T>> {
    if grads.len() != unique_index.len() * vec_size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![unique_index.len(), vec_size],
            got: vec![grads.len()],
        });
    }
    if let Some(&bad) = unique_index.iter().find(|&&u| u >= num_unique) {
        return Err(KernelError::IndexOutOfBounds {
            index: bad,
            len: num_unique,
        });
    }

    // Occurrence lists per unique slot, so every output row has a single writer.
    let mut occurrences: Vec<Vec<usize>> = vec![Vec::new(); num_unique];
    for (j, &u) in unique_index.iter().enumerate() {
        occurrences[u].push(j);
    }

    let mut out = vec![T::zero(); num_unique * vec_size];
    out.par_chunks_mut(vec_size)
        .zip(occurrences.par_iter())
        .for_each(|(dst, occ)| {
            for &j in occ {
                let src = &grads[j * vec_size..(j + 1) * vec_size];
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += *s;
                }
            }
        });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_index_preserves_first_occurrence() {
        let (unique, index) = unique_index(&[5u64, 5, 9, 5, 1]);
        assert_eq!(unique, vec![5, 9, 1]);
        assert_eq!(index, vec![0, 0, 1, 0, 2]);
    }

    #[test]
    fn test_accumulate_duplicates() {
        let grads = vec![1.0, 1.0, 1.0, 1.0, 3.0, 3.0];
        let out = cpu_accumulate_unique(&grads, &[0, 0, 1], 2, 2).unwrap();
        assert_eq!(out, vec![2.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_accumulate_rejects_bad_index() {
        let grads = vec![1.0f32; 2];
        assert!(cpu_accumulate_unique(&grads, &[1], 1, 2).is_err());
    }
}
