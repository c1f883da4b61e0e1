//! Sparse categorical input.
//!
//! A batch of categorical features is stored per GPU in CSR form: row `sample * slot_num + slot`
//! holds the keys of one slot (feature field) of one sample, delimited by `row_offset`.

pub mod encoder;

pub use encoder::{Sample, SlotEncoder};

use crate::error::{EmbeddingError, Result};
use parking_lot::RwLock;
use sparsectr_kernels::check_row_offset;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Key type of a categorical feature.
pub trait EmbeddingKey: Copy + Eq + Hash + Ord + Debug + Send + Sync + 'static {
    /// Bit pattern used for routing and hashing.
    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
}

impl EmbeddingKey for u32 {
    fn to_u64(self) -> u64 {
        self as u64
    }

    fn from_u64(v: u64) -> Self {
        v as u32
    }
}

impl EmbeddingKey for u64 {
    fn to_u64(self) -> u64 {
        self
    }

    fn from_u64(v: u64) -> Self {
        v
    }
}

impl EmbeddingKey for i64 {
    fn to_u64(self) -> u64 {
        self as u64
    }

    fn from_u64(v: u64) -> Self {
        v as i64
    }
}

/// One GPU's share of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseTensor<K> {
    keys: Vec<K>,
    row_offset: Vec<usize>,
    batch_size: usize,
    slot_num: usize,
}

impl<K: EmbeddingKey> SparseTensor<K> {
    /// An empty batch: every segment has zero keys.
    pub fn empty(batch_size: usize, slot_num: usize) -> Self {
        Self {
            keys: Vec::new(),
            row_offset: vec![0; batch_size * slot_num + 1],
            batch_size,
            slot_num,
        }
    }

    pub fn new(
        keys: Vec<K>,
        row_offset: Vec<usize>,
        batch_size: usize,
        slot_num: usize,
    ) -> Result<Self> {
        if row_offset.len() != batch_size * slot_num + 1 {
            return Err(EmbeddingError::DataCheck(format!(
                "row_offset holds {} entries, expected {} for {batch_size} samples of {slot_num} slots",
                row_offset.len(),
                batch_size * slot_num + 1
            )));
        }
        check_row_offset(&row_offset, keys.len())?;
        Ok(Self {
            keys,
            row_offset,
            batch_size,
            slot_num,
        })
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn row_offset(&self) -> &[usize] {
        &self.row_offset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn slot_num(&self) -> usize {
        self.slot_num
    }

    /// Number of keys.
    pub fn nnz(&self) -> usize {
        self.keys.len()
    }

    /// Number of CSR rows, `batch_size * slot_num`.
    pub fn rows(&self) -> usize {
        self.batch_size * self.slot_num
    }

    /// Keys of CSR row `row`.
    pub fn row_keys(&self, row: usize) -> &[K] {
        &self.keys[self.row_offset[row]..self.row_offset[row + 1]]
    }

    /// Keys of `slot` in `sample`.
    pub fn segment(&self, sample: usize, slot: usize) -> &[K] {
        self.row_keys(sample * self.slot_num + slot)
    }
}

/// Per-GPU sparse tensors, refilled every batch.
pub type SparseTensorBag<K> = Arc<RwLock<Vec<SparseTensor<K>>>>;

/// A named sparse input with separate train and evaluate buffers.
///
/// Embeddings hold clones of the `Arc`s: they read the buffers the encoder fills, never copies.
#[derive(Debug, Clone)]
pub struct SparseInput<K> {
    pub train: SparseTensorBag<K>,
    pub evaluate: SparseTensorBag<K>,
    pub slot_num: usize,
    pub max_feature_num_per_sample: usize,
}

impl<K: EmbeddingKey> SparseInput<K> {
    /// Allocates empty buffers for `num_gpus` GPUs.
    pub fn new(
        num_gpus: usize,
        batch_size_per_gpu: usize,
        batch_size_eval_per_gpu: usize,
        slot_num: usize,
        max_feature_num_per_sample: usize,
    ) -> Self {
        let bag = |batch| {
            Arc::new(RwLock::new(
                (0..num_gpus)
                    .map(|_| SparseTensor::empty(batch, slot_num))
                    .collect(),
            ))
        };
        Self {
            train: bag(batch_size_per_gpu),
            evaluate: bag(batch_size_eval_per_gpu),
            slot_num,
            max_feature_num_per_sample,
        }
    }

    pub fn bag(&self, is_train: bool) -> &SparseTensorBag<K> {
        if is_train {
            &self.train
        } else {
            &self.evaluate
        }
    }
}
