//! Slot-localized embeddings: every slot lives entirely on one GPU.
//!
//! The owner of a slot combines the keys of that slot for every sample of every GPU, so the
//! all-to-all carries one combined vector per (sample, slot) instead of per key.

use super::{merge_wgrad, BuildContext, Embedding, EmbeddingData, GradientBuffer};
use crate::checkpoint::TableSnapshot;
use crate::config::{EmbeddingType, SparseEmbedding};
use crate::distributed::CollectiveBackend;
use crate::error::{EmbeddingError, Result};
use crate::input::EmbeddingKey;
use crate::optim::GpuLearningRateSchedulers;
use crate::storage::{DirectTable, HashTable, RowStore};
use crate::tensor::SharedTensor;
use rayon::prelude::*;
use sparsectr_kernels::{cpu_combine_backward, cpu_combine_forward, Combiner};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Storage of the slots owned by one GPU.
pub trait SlotTable<K: EmbeddingKey>: Send + Sync {
    type Store: RowStore<K>;

    /// Whether every (sample, slot) segment must hold exactly one key.
    const ONE_HOT: bool;

    fn store(&self) -> &Self::Store;

    fn store_mut(&mut self) -> &mut Self::Store;

    /// Row of `key` in `slot`. Training may create it; evaluation reads unknown keys as
    /// `None`.
    fn resolve(&mut self, slot: usize, key: K, is_train: bool) -> Result<Option<usize>>;

    /// Slot a stored key belongs to.
    fn slot_of(&self, key: K) -> Option<usize>;

    /// Writes a complete row of `slot`.
    fn restore(
        &mut self,
        slot: usize,
        key: K,
        weight: &[f32],
        state: &[f32],
        updates: u64,
    ) -> Result<()>;
}

/// Hash table that remembers the slot of each key.
#[derive(Debug, Clone)]
pub struct SlotHashTable<K> {
    table: HashTable<K>,
    slots: HashMap<K, usize>,
}

impl<K: EmbeddingKey> SlotHashTable<K> {
    pub fn new(table: HashTable<K>) -> Self {
        Self {
            table,
            slots: HashMap::new(),
        }
    }
}

impl<K: EmbeddingKey> SlotTable<K> for SlotHashTable<K> {
    type Store = HashTable<K>;

    const ONE_HOT: bool = false;

    fn store(&self) -> &HashTable<K> {
        &self.table
    }

    fn store_mut(&mut self) -> &mut HashTable<K> {
        &mut self.table
    }

    fn resolve(&mut self, slot: usize, key: K, is_train: bool) -> Result<Option<usize>> {
        if !is_train {
            return Ok(self.table.find(key));
        }
        let row = self.table.find_or_insert(key)?;
        self.slots.entry(key).or_insert(slot);
        Ok(Some(row))
    }

    fn slot_of(&self, key: K) -> Option<usize> {
        self.slots.get(&key).copied()
    }

    fn restore(
        &mut self,
        slot: usize,
        key: K,
        weight: &[f32],
        state: &[f32],
        updates: u64,
    ) -> Result<()> {
        self.table.insert_row(key, weight, state, updates)?;
        self.slots.insert(key, slot);
        Ok(())
    }
}

impl<K: EmbeddingKey> SlotTable<K> for DirectTable {
    type Store = DirectTable;

    const ONE_HOT: bool = true;

    fn store(&self) -> &DirectTable {
        self
    }

    fn store_mut(&mut self) -> &mut DirectTable {
        self
    }

    fn resolve(&mut self, slot: usize, key: K, _is_train: bool) -> Result<Option<usize>> {
        self.row_in_slot(slot, key.to_u64()).map(Some).ok_or_else(|| {
            EmbeddingError::DataCheck(format!("key {key:?} is outside the range of slot {slot}"))
        })
    }

    fn slot_of(&self, key: K) -> Option<usize> {
        let key = key.to_u64();
        self.ranges()
            .iter()
            .find(|r| key >= r.key_start && key < r.key_start + r.size as u64)
            .map(|r| r.slot)
    }

    fn restore(
        &mut self,
        slot: usize,
        key: K,
        weight: &[f32],
        state: &[f32],
        updates: u64,
    ) -> Result<()> {
        SlotTable::<K>::resolve(self, slot, key, false)?;
        RowStore::<K>::insert_row(self, key, weight, state, updates)
    }
}

/// Slot-localized embedding over any [`SlotTable`].
pub struct LocalizedSlotEmbedding<K: EmbeddingKey, S> {
    data: EmbeddingData<K>,
    slot_owner: Vec<usize>,
    owned_slots: Vec<Vec<usize>>,
    tables: Vec<S>,
    /// Per owner GPU and source GPU, the `(slot, keys)` segments of the last training forward.
    served: Vec<Vec<Vec<(usize, Vec<K>)>>>,
    wgrad: Vec<GradientBuffer<K>>,
}

pub type LocalizedSlotSparseEmbeddingHash<K> = LocalizedSlotEmbedding<K, SlotHashTable<K>>;

pub type LocalizedSlotSparseEmbeddingOneHot<K> = LocalizedSlotEmbedding<K, DirectTable>;

/// Assigns every slot to a GPU.
///
/// Without slot sizes, slot `s` goes to GPU `s % num_gpus`. With sizes, slots are placed
/// largest first on the GPU with the smallest total so far (lowest index on ties).
pub fn assign_slots(
    slot_num: usize,
    slot_size_array: &[usize],
    num_gpus: usize,
) -> Result<Vec<usize>> {
    if num_gpus == 0 {
        return Err(EmbeddingError::wrong_input("no GPU to place slots on"));
    }
    if slot_size_array.is_empty() {
        return Ok((0..slot_num).map(|s| s % num_gpus).collect());
    }
    if slot_size_array.len() != slot_num {
        return Err(EmbeddingError::wrong_input(format!(
            "slot_size_array has {} entries, the input has {slot_num} slots",
            slot_size_array.len()
        )));
    }
    let mut order: Vec<usize> = (0..slot_num).collect();
    order.sort_by(|&a, &b| slot_size_array[b].cmp(&slot_size_array[a]).then(a.cmp(&b)));
    let mut load = vec![0usize; num_gpus];
    let mut owner = vec![0usize; slot_num];
    for slot in order {
        let gpu = (0..num_gpus).min_by_key(|&g| load[g]).unwrap_or(0);
        owner[slot] = gpu;
        load[gpu] += slot_size_array[slot];
    }
    Ok(owner)
}

impl<K: EmbeddingKey> LocalizedSlotSparseEmbeddingHash<K> {
    pub fn new_hash(params: SparseEmbedding, ctx: &BuildContext<K>) -> Result<Self> {
        Self::build(params, ctx, |data, owned| {
            let sizes = &data.params.slot_size_array;
            let capacity = if data.params.max_vocabulary_size_per_gpu > 0 || sizes.is_empty() {
                data.params.max_vocabulary_size_per_gpu
            } else {
                owned.iter().map(|&s| sizes[s]).sum()
            };
            let hp = data.engine.params().hyperparams;
            Ok(SlotHashTable::new(HashTable::new(
                capacity,
                data.vec_size(),
                &hp,
                data.init,
            )))
        })
    }
}

impl<K: EmbeddingKey> LocalizedSlotSparseEmbeddingOneHot<K> {
    pub fn new_one_hot(params: SparseEmbedding, ctx: &BuildContext<K>) -> Result<Self> {
        if params.slot_size_array.is_empty() {
            return Err(EmbeddingError::wrong_input(
                "LocalizedSlotSparseEmbeddingOneHot needs slot_size_array",
            ));
        }
        Self::build(params, ctx, |data, owned| {
            let hp = data.engine.params().hyperparams;
            DirectTable::new(
                &data.params.slot_size_array,
                owned,
                data.vec_size(),
                &hp,
                data.init,
            )
        })
    }
}

impl<K: EmbeddingKey, S: SlotTable<K>> LocalizedSlotEmbedding<K, S> {
    fn build(
        params: SparseEmbedding,
        ctx: &BuildContext<K>,
        make_table: impl Fn(&EmbeddingData<K>, &[usize]) -> Result<S>,
    ) -> Result<Self> {
        let data = EmbeddingData::new(params, ctx)?;
        let n = data.num_gpus();
        let slot_owner = assign_slots(data.slot_num(), &data.params.slot_size_array, n)?;
        let mut owned_slots = vec![Vec::new(); n];
        for (slot, &gpu) in slot_owner.iter().enumerate() {
            owned_slots[gpu].push(slot);
        }
        let tables = owned_slots
            .iter()
            .map(|owned| make_table(&data, owned))
            .collect::<Result<Vec<_>>>()?;
        debug!(?slot_owner, "slots placed");
        let wgrad = (0..n).map(|_| GradientBuffer::new(data.vec_size())).collect();
        Ok(Self {
            data,
            slot_owner,
            owned_slots,
            tables,
            served: Vec::new(),
            wgrad,
        })
    }

    /// GPU of every slot.
    pub fn slot_owner(&self) -> &[usize] {
        &self.slot_owner
    }

    pub fn owned_slots(&self, gpu: usize) -> &[usize] {
        self.owned_slots.get(gpu).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Owner side of the forward: one combined vector per received segment.
fn combine_segments<K: EmbeddingKey, S: SlotTable<K>>(
    table: &mut S,
    segments: &[(usize, Vec<K>)],
    is_train: bool,
    vec_size: usize,
    combiner: Combiner,
) -> Result<Vec<f32>> {
    let mut rows = Vec::new();
    let mut row_offset = Vec::with_capacity(segments.len() + 1);
    row_offset.push(0);
    for (slot, keys) in segments {
        if S::ONE_HOT && keys.len() != 1 {
            return Err(EmbeddingError::DataCheck(format!(
                "one-hot slot {slot} takes exactly one key per sample, got {}",
                keys.len()
            )));
        }
        for &key in keys {
            match table.resolve(*slot, key, is_train)? {
                Some(row) => rows.extend_from_slice(table.store().weight(row)),
                None => rows.resize(rows.len() + vec_size, 0.0),
            }
        }
        row_offset.push(row_offset[row_offset.len() - 1] + keys.len());
    }
    let identity: Vec<usize> = (0..rows.len() / vec_size).collect();
    Ok(cpu_combine_forward(&rows, &identity, &row_offset, vec_size, combiner)?)
}

impl<K: EmbeddingKey, S: SlotTable<K>> Embedding<K> for LocalizedSlotEmbedding<K, S> {
    fn name(&self) -> &str {
        &self.data.params.sparse_embedding_name
    }

    fn embedding_type(&self) -> EmbeddingType {
        if S::ONE_HOT {
            EmbeddingType::LocalizedSlotSparseEmbeddingOneHot
        } else {
            EmbeddingType::LocalizedSlotSparseEmbeddingHash
        }
    }

    fn params(&self) -> &SparseEmbedding {
        &self.data.params
    }

    fn forward(&mut self, is_train: bool) -> Result<()> {
        let vec_size = self.data.vec_size();
        let slot_num = self.data.slot_num();
        let combiner = self.data.params.combiner;
        let resource = Arc::clone(&self.data.resource);
        let comm = resource.collective();
        let bag = Arc::clone(self.data.input.bag(is_train));
        let batch = bag.read();

        let sends: Vec<Vec<Vec<(usize, Vec<K>)>>> = batch
            .iter()
            .map(|t| {
                self.owned_slots
                    .iter()
                    .map(|slots| {
                        let mut segs = Vec::with_capacity(t.batch_size() * slots.len());
                        for sample in 0..t.batch_size() {
                            for &slot in slots {
                                segs.push((slot, t.segment(sample, slot).to_vec()));
                            }
                        }
                        segs
                    })
                    .collect()
            })
            .collect();
        let received = comm.all_to_all_v(sends)?;

        let replies = self
            .tables
            .par_iter_mut()
            .zip(received.par_iter())
            .map(|(table, per_src)| {
                per_src
                    .iter()
                    .map(|segs| combine_segments(table, segs, is_train, vec_size, combiner))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let replies = comm.all_to_all_v(replies)?;

        let owned_slots = &self.owned_slots;
        self.data
            .output(is_train)
            .par_iter()
            .zip(replies.par_iter())
            .zip(batch.par_iter())
            .try_for_each(|((out, per_owner), t)| -> Result<()> {
                let mut out = out.write();
                let dst = out.data_mut();
                for (owner, combined) in per_owner.iter().enumerate() {
                    let mut vectors = combined.chunks_exact(vec_size);
                    for sample in 0..t.batch_size() {
                        for &slot in &owned_slots[owner] {
                            let src = vectors.next().ok_or_else(|| {
                                EmbeddingError::Communication(format!(
                                    "GPU {owner} returned too few combined vectors"
                                ))
                            })?;
                            let at = (sample * slot_num + slot) * vec_size;
                            dst[at..at + vec_size].copy_from_slice(src);
                        }
                    }
                }
                Ok(())
            })?;

        if is_train {
            self.served = received;
        }
        Ok(())
    }

    fn backward(&mut self) -> Result<()> {
        if self.served.is_empty() {
            return Err(EmbeddingError::IllegalCall(
                "backward called before a training forward".to_string(),
            ));
        }
        let vec_size = self.data.vec_size();
        let slot_num = self.data.slot_num();
        let combiner = self.data.params.combiner;
        let resource = Arc::clone(&self.data.resource);

        let batch = self.data.input.train.read();
        let sends: Vec<Vec<Vec<f32>>> = batch
            .iter()
            .zip(&self.data.train_output)
            .map(|(t, top)| {
                let top = top.read();
                let grad = top.data();
                self.owned_slots
                    .iter()
                    .map(|slots| {
                        let mut buf = Vec::with_capacity(t.batch_size() * slots.len() * vec_size);
                        for sample in 0..t.batch_size() {
                            for &slot in slots {
                                let at = (sample * slot_num + slot) * vec_size;
                                buf.extend_from_slice(&grad[at..at + vec_size]);
                            }
                        }
                        buf
                    })
                    .collect()
            })
            .collect();
        drop(batch);
        let received = resource.collective().all_to_all_v(sends)?;

        self.wgrad
            .par_iter_mut()
            .zip(self.served.par_iter())
            .zip(received.par_iter())
            .try_for_each(|((buf, served), grads)| -> Result<()> {
                buf.clear();
                for (segs, seg_grads) in served.iter().zip(grads) {
                    let mut row_offset = Vec::with_capacity(segs.len() + 1);
                    row_offset.push(0);
                    let mut keys = Vec::new();
                    for (_, seg_keys) in segs {
                        keys.extend_from_slice(seg_keys);
                        row_offset.push(keys.len());
                    }
                    let occ = cpu_combine_backward(seg_grads, &row_offset, vec_size, combiner)?;
                    buf.extend(&keys, &occ);
                }
                Ok(())
            })
    }

    fn update_params(&mut self, schedulers: Option<&GpuLearningRateSchedulers>) -> Result<()> {
        let lrs = (0..self.data.num_gpus())
            .map(|g| self.data.lr(g, schedulers))
            .collect::<Result<Vec<_>>>()?;
        self.data.engine.begin_step();
        let engine = &self.data.engine;
        self.tables
            .par_iter_mut()
            .zip(self.wgrad.par_iter_mut())
            .zip(lrs.par_iter())
            .try_for_each(|((table, buf), &lr)| {
                buf.apply(engine, table.store_mut(), lr)?;
                buf.clear();
                Ok(())
            })
    }

    fn train_output_tensors(&self) -> &[SharedTensor] {
        &self.data.train_output
    }

    fn evaluate_output_tensors(&self) -> &[SharedTensor] {
        &self.data.evaluate_output
    }

    fn accumulated_wgrad(&self) -> Result<Vec<(K, Vec<f32>)>> {
        let parts = self
            .wgrad
            .iter()
            .map(GradientBuffer::aggregated)
            .collect::<Result<Vec<_>>>()?;
        Ok(merge_wgrad(parts, self.data.vec_size()))
    }

    fn read_row(&self, key: K) -> Option<Vec<f32>> {
        self.tables.iter().find_map(|t| {
            let store = t.store();
            store.find(key).map(|row| store.weight(row).to_vec())
        })
    }

    fn vocabulary_size(&self) -> usize {
        self.tables.iter().map(|t| t.store().len()).sum()
    }

    fn dump(&self) -> Result<TableSnapshot> {
        let mut snapshot = self.data.new_snapshot();
        for table in &self.tables {
            let rows = table.store().rows();
            for (key, row) in table.store().entries() {
                let slot = table.slot_of(key).ok_or_else(|| {
                    EmbeddingError::UnspecificError(format!("key {key:?} has no recorded slot"))
                })?;
                snapshot.push(
                    key.to_u64(),
                    Some(slot),
                    rows.weight(row),
                    rows.state(row),
                    rows.updates(row),
                );
            }
        }
        snapshot.sort_by_key();
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &TableSnapshot) -> Result<()> {
        self.data.check_snapshot(snapshot)?;
        snapshot.validate()?;
        if snapshot.slots.len() != snapshot.len() {
            return Err(EmbeddingError::DataCheck(
                "slot-localized tables need the slot of every snapshot row".to_string(),
            ));
        }
        for row in snapshot.rows() {
            let slot = row.slot.unwrap_or(usize::MAX);
            let owner = *self.slot_owner.get(slot).ok_or_else(|| {
                EmbeddingError::DataCheck(format!(
                    "snapshot slot {slot} out of range for {} slots",
                    self.slot_owner.len()
                ))
            })?;
            self.tables[owner].restore(
                slot,
                K::from_u64(row.key),
                row.weight,
                row.state,
                row.updates,
            )?;
        }
        self.data.engine.set_step(snapshot.step);
        self.served.clear();
        self.wgrad.iter_mut().for_each(GradientBuffer::clear);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use crate::error::ErrorKind;
    use crate::exchange::{ExchangeMode, ExchangeWgrad};
    use crate::input::{SlotEncoder, SparseInput};
    use crate::optim::{OptHyperParams, OptParams};
    use crate::resource::ResourceManager;

    fn ctx(num_gpus: usize, slot_num: usize) -> BuildContext<u64> {
        BuildContext {
            resource: ResourceManager::single_node(num_gpus, 3).unwrap(),
            solver: SolverConfig::default(),
            input: SparseInput::new(num_gpus, 1, 1, slot_num, 8),
            default_opt: OptParams::new(OptHyperParams::Sgd { atomic_update: false }, 1.0),
            exchange: ExchangeWgrad::new(ExchangeMode::PerNetwork, num_gpus),
        }
    }

    fn params(kind: EmbeddingType, sizes: Vec<usize>) -> SparseEmbedding {
        SparseEmbedding::new(kind, "data", "emb", 2, Combiner::Sum).with_slot_size_array(sizes)
    }

    #[test]
    fn test_assign_slots() {
        assert_eq!(assign_slots(5, &[], 2).unwrap(), vec![0, 1, 0, 1, 0]);
        // largest first: 100 -> 0, 60 -> 1, 50 -> 1, 10 -> 1
        assert_eq!(assign_slots(4, &[10, 100, 50, 60], 2).unwrap(), vec![1, 0, 1, 1]);
        let err = assign_slots(3, &[1, 2], 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongInput);
    }

    #[test]
    fn test_hash_forward_and_backward() {
        let ctx = ctx(2, 2);
        let mut emb = LocalizedSlotSparseEmbeddingHash::new_hash(
            params(EmbeddingType::LocalizedSlotSparseEmbeddingHash, vec![10, 10]),
            &ctx,
        )
        .unwrap();
        assert_eq!(emb.slot_owner(), &[0, 1]);
        SlotEncoder::new(2, 2, 8)
            .encode_into(
                &[vec![vec![1, 2], vec![11]], vec![vec![1], vec![]]],
                &ctx.input.train,
            )
            .unwrap();
        emb.forward(true).unwrap();
        let (r1, r2, r11) = (
            emb.read_row(1).unwrap(),
            emb.read_row(2).unwrap(),
            emb.read_row(11).unwrap(),
        );
        {
            let out = emb.train_output_tensors()[0].read();
            assert!((out.data()[0] - (r1[0] + r2[0])).abs() < 1e-6);
            assert!((out.data()[2] - r11[0]).abs() < 1e-6);
            let out1 = emb.train_output_tensors()[1].read();
            assert!((out1.data()[0] - r1[0]).abs() < 1e-6);
            assert_eq!(&out1.data()[2..4], &[0.0, 0.0]);
        }
        for t in emb.train_output_tensors() {
            t.write().data_mut().fill(1.0);
        }
        emb.backward().unwrap();
        let wgrad = emb.accumulated_wgrad().unwrap();
        assert_eq!(
            wgrad,
            vec![(1, vec![2.0, 2.0]), (2, vec![1.0, 1.0]), (11, vec![1.0, 1.0])]
        );
        emb.update_params(None).unwrap();
        assert!((emb.read_row(1).unwrap()[0] - (r1[0] - 2.0)).abs() < 1e-6);

        let snap = emb.dump().unwrap();
        assert_eq!(snap.slots, vec![0, 0, 1]);
        let mut fresh = LocalizedSlotSparseEmbeddingHash::new_hash(
            params(EmbeddingType::LocalizedSlotSparseEmbeddingHash, vec![10, 10]),
            &ctx,
        )
        .unwrap();
        fresh.load(&snap).unwrap();
        assert_eq!(fresh.dump().unwrap(), snap);
    }

    #[test]
    fn test_one_hot() {
        let ctx = ctx(2, 2);
        let mut emb = LocalizedSlotSparseEmbeddingOneHot::new_one_hot(
            params(EmbeddingType::LocalizedSlotSparseEmbeddingOneHot, vec![3, 4]),
            &ctx,
        )
        .unwrap();
        assert_eq!(emb.vocabulary_size(), 7);
        assert_eq!(emb.embedding_type(), EmbeddingType::LocalizedSlotSparseEmbeddingOneHot);
        // slot 1 keys start at 3
        let encoder = SlotEncoder::new(2, 2, 8);
        encoder
            .encode_into(&[vec![vec![2], vec![5]], vec![vec![0], vec![3]]], &ctx.input.train)
            .unwrap();
        emb.forward(true).unwrap();
        let out = emb.train_output_tensors()[0].read().data().to_vec();
        assert_eq!(&out[2..4], emb.read_row(5).unwrap().as_slice());

        // a key of slot 1 placed in slot 0
        encoder
            .encode_into(&[vec![vec![4], vec![5]], vec![vec![0], vec![3]]], &ctx.input.train)
            .unwrap();
        assert_eq!(emb.forward(true).unwrap_err().kind(), ErrorKind::DataCheck);

        // two keys in one segment
        encoder
            .encode_into(&[vec![vec![0, 1], vec![5]], vec![vec![0], vec![3]]], &ctx.input.train)
            .unwrap();
        assert_eq!(emb.forward(true).unwrap_err().kind(), ErrorKind::DataCheck);
    }

    #[test]
    fn test_one_hot_needs_sizes() {
        let ctx = ctx(2, 2);
        let r = LocalizedSlotSparseEmbeddingOneHot::<u64>::new_one_hot(
            params(EmbeddingType::LocalizedSlotSparseEmbeddingOneHot, vec![])
                .with_workspace_size_per_gpu_in_mb(1),
            &ctx,
        );
        assert!(r.is_err());
    }
}
