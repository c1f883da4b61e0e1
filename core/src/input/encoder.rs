use super::{EmbeddingKey, SparseTensor, SparseTensorBag};
use crate::error::{EmbeddingError, Result};
use tracing::trace;

/// Keys of one sample, one `Vec` per slot.
pub type Sample<K> = Vec<Vec<K>>;

/// Splits a global batch into per-GPU CSR tensors.
///
/// GPU `g` receives samples `g * batch_size_per_gpu .. (g + 1) * batch_size_per_gpu`.
#[derive(Debug, Clone)]
pub struct SlotEncoder {
    num_gpus: usize,
    slot_num: usize,
    max_feature_num_per_sample: usize,
    slot_offsets: Option<Vec<u64>>,
}

impl SlotEncoder {
    pub fn new(num_gpus: usize, slot_num: usize, max_feature_num_per_sample: usize) -> Self {
        Self {
            num_gpus,
            slot_num,
            max_feature_num_per_sample,
            slot_offsets: None,
        }
    }

    /// Treats raw keys as slot-local ids in `0..slot_size_array[s]` and shifts them by the
    /// prefix sum of the slot sizes, so every slot owns a disjoint key range.
    pub fn with_slot_offsets(mut self, slot_size_array: &[usize]) -> Result<Self> {
        if slot_size_array.len() != self.slot_num {
            return Err(EmbeddingError::wrong_input(format!(
                "slot_size_array has {} entries for {} slots",
                slot_size_array.len(),
                self.slot_num
            )));
        }
        let mut offsets = Vec::with_capacity(slot_size_array.len());
        let mut start = 0u64;
        for &size in slot_size_array {
            offsets.push(start);
            start = start.checked_add(size as u64).ok_or_else(|| {
                EmbeddingError::wrong_input("sum of slot_size_array overflows the key range")
            })?;
        }
        self.slot_offsets = Some(offsets);
        Ok(self)
    }

    pub fn slot_num(&self) -> usize {
        self.slot_num
    }

    /// Encodes `batch` into one tensor per GPU.
    pub fn encode<K: EmbeddingKey>(&self, batch: &[Sample<K>]) -> Result<Vec<SparseTensor<K>>> {
        if self.num_gpus == 0 || batch.len() % self.num_gpus != 0 {
            return Err(EmbeddingError::DataCheck(format!(
                "batch of {} samples does not split across {} GPUs",
                batch.len(),
                self.num_gpus
            )));
        }
        let per_gpu = batch.len() / self.num_gpus;
        batch
            .chunks(per_gpu.max(1))
            .take(self.num_gpus)
            .map(|samples| self.encode_block(samples, per_gpu))
            .collect::<Result<Vec<_>>>()
            .map(|mut tensors| {
                // an empty batch still yields one empty tensor per GPU
                tensors.resize_with(self.num_gpus, || SparseTensor::empty(0, self.slot_num));
                tensors
            })
    }

    /// Encodes `batch` and swaps the result into `bag`.
    pub fn encode_into<K: EmbeddingKey>(
        &self,
        batch: &[Sample<K>],
        bag: &SparseTensorBag<K>,
    ) -> Result<()> {
        let tensors = self.encode(batch)?;
        let mut guard = bag.write();
        if guard.len() != tensors.len() {
            return Err(EmbeddingError::DataCheck(format!(
                "input buffer holds {} GPUs, encoder produced {}",
                guard.len(),
                tensors.len()
            )));
        }
        if let Some((gpu, old)) = guard
            .iter()
            .enumerate()
            .find(|(g, old)| old.batch_size() != tensors[*g].batch_size())
        {
            return Err(EmbeddingError::DataCheck(format!(
                "GPU {gpu} expects {} samples per batch, got {}",
                old.batch_size(),
                tensors[gpu].batch_size()
            )));
        }
        *guard = tensors;
        Ok(())
    }

    fn encode_block<K: EmbeddingKey>(
        &self,
        samples: &[Sample<K>],
        batch_size: usize,
    ) -> Result<SparseTensor<K>> {
        let mut keys = Vec::new();
        let mut row_offset = Vec::with_capacity(batch_size * self.slot_num + 1);
        row_offset.push(0);
        for (i, sample) in samples.iter().enumerate() {
            if sample.len() != self.slot_num {
                return Err(EmbeddingError::DataCheck(format!(
                    "sample {i} has {} slots, expected {}",
                    sample.len(),
                    self.slot_num
                )));
            }
            let features: usize = sample.iter().map(Vec::len).sum();
            if features > self.max_feature_num_per_sample {
                return Err(EmbeddingError::DataCheck(format!(
                    "sample {i} has {features} features, limit is {}",
                    self.max_feature_num_per_sample
                )));
            }
            for (slot, slot_keys) in sample.iter().enumerate() {
                match &self.slot_offsets {
                    Some(offsets) => {
                        for k in slot_keys {
                            let shifted = k.to_u64().checked_add(offsets[slot]).ok_or_else(|| {
                                EmbeddingError::WrongInput(format!(
                                    "key {} of slot {slot} overflows with slot offset {}",
                                    k.to_u64(),
                                    offsets[slot]
                                ))
                            })?;
                            keys.push(K::from_u64(shifted));
                        }
                    }
                    None => keys.extend_from_slice(slot_keys),
                }
                row_offset.push(keys.len());
            }
        }
        trace!(samples = samples.len(), nnz = keys.len(), "encoded block");
        SparseTensor::new(keys, row_offset, batch_size, self.slot_num)
    }
}
