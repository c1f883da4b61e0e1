//! Request routing for modulo-placed keys.

use super::owner_of;
use crate::error::{EmbeddingError, Result};
use crate::input::EmbeddingKey;
use crate::storage::RowStore;
use sparsectr_kernels::unique_index;

/// How one origin GPU resolves the keys of its batch.
///
/// Keys are deduplicated first, so every distinct key is requested from its owner once per
/// origin no matter how often it repeats in the batch.
#[derive(Debug, Clone, Default)]
pub(crate) struct LookupPlan<K> {
    /// Distinct keys in first-occurrence order.
    pub unique: Vec<K>,
    /// For every key occurrence, its position in `unique`.
    pub index: Vec<usize>,
    /// Keys requested from every owner.
    pub requests: Vec<Vec<K>>,
    /// For every distinct key, `(owner, position in requests[owner])`, or `None` if the
    /// origin resolves it locally.
    pub placement: Vec<Option<(usize, usize)>>,
}

impl<K: EmbeddingKey> LookupPlan<K> {
    /// Routes every key to `key % num_gpus`.
    pub fn new(keys: &[K], num_gpus: usize) -> Self {
        Self::with_local(keys, num_gpus, |_| false)
    }

    /// Routes every key for which `is_local` is false to `key % num_gpus`.
    pub fn with_local(keys: &[K], num_gpus: usize, is_local: impl Fn(K) -> bool) -> Self {
        let (unique, index) = unique_index(keys);
        let mut requests = vec![Vec::new(); num_gpus];
        let placement = unique
            .iter()
            .map(|&k| {
                if is_local(k) {
                    return None;
                }
                let owner = owner_of(k, num_gpus);
                requests[owner].push(k);
                Some((owner, requests[owner].len() - 1))
            })
            .collect();
        Self {
            unique,
            index,
            requests,
            placement,
        }
    }

    /// Number of keys sent to other GPUs or to the origin's own table.
    pub fn remote_count(&self) -> usize {
        self.requests.iter().map(Vec::len).sum()
    }

    /// Builds one row per distinct key from the owners' replies. Locally resolved keys are
    /// filled by `local`.
    pub fn assemble(
        &self,
        replies: &[Vec<f32>],
        vec_size: usize,
        mut local: impl FnMut(K, &mut [f32]) -> Result<()>,
    ) -> Result<Vec<f32>> {
        let mut rows = vec![0.0f32; self.unique.len() * vec_size];
        for ((dst, &key), place) in rows
            .chunks_exact_mut(vec_size)
            .zip(&self.unique)
            .zip(&self.placement)
        {
            match *place {
                Some((owner, pos)) => {
                    let reply = replies.get(owner).ok_or_else(|| {
                        EmbeddingError::Communication(format!("no reply from GPU {owner}"))
                    })?;
                    let src = reply
                        .get(pos * vec_size..(pos + 1) * vec_size)
                        .ok_or_else(|| {
                            EmbeddingError::Communication(format!(
                                "GPU {owner} replied with {} values, row {pos} missing",
                                reply.len()
                            ))
                        })?;
                    dst.copy_from_slice(src);
                }
                None => local(key, dst)?,
            }
        }
        Ok(rows)
    }

    /// Splits per-distinct-key gradients into one buffer per owner, in request order.
    /// Gradients of locally resolved keys are handed to `local`.
    pub fn scatter(
        &self,
        unique_grads: &[f32],
        vec_size: usize,
        mut local: impl FnMut(K, &[f32]),
    ) -> Vec<Vec<f32>> {
        let mut out: Vec<Vec<f32>> = self
            .requests
            .iter()
            .map(|r| Vec::with_capacity(r.len() * vec_size))
            .collect();
        for ((grad, &key), place) in unique_grads
            .chunks_exact(vec_size)
            .zip(&self.unique)
            .zip(&self.placement)
        {
            match *place {
                Some((owner, _)) => out[owner].extend_from_slice(grad),
                None => local(key, grad),
            }
        }
        out
    }
}

/// Owner side of a lookup: the rows of `keys`, inserting missing keys when training and
/// reading them as zeros otherwise.
pub(crate) fn lookup_rows<K: EmbeddingKey, S: RowStore<K>>(
    table: &mut S,
    keys: &[K],
    is_train: bool,
    vec_size: usize,
) -> Result<Vec<f32>> {
    let mut out = vec![0.0f32; keys.len() * vec_size];
    for (&key, dst) in keys.iter().zip(out.chunks_exact_mut(vec_size)) {
        let row = if is_train {
            Some(table.find_or_insert(key)?)
        } else {
            table.find(key)
        };
        if let Some(row) = row {
            dst.copy_from_slice(table.weight(row));
        }
    }
    Ok(out)
}
