//! Every key lives on GPU `key % num_gpus`.
//!
//! Forward: each GPU deduplicates its batch, sends the distinct keys to their owners, gets the
//! rows back and combines them locally. Backward reverses the path: the per-key gradient,
//! already summed over the origin's occurrences, goes back to the owner.

use super::routing::{lookup_rows, LookupPlan};
use super::{
    merge_wgrad, owner_of, BuildContext, Embedding, EmbeddingData, GradientBuffer,
};
use crate::checkpoint::TableSnapshot;
use crate::config::{EmbeddingType, SparseEmbedding};
use crate::distributed::CollectiveBackend;
use crate::error::{EmbeddingError, Result};
use crate::input::EmbeddingKey;
use crate::optim::GpuLearningRateSchedulers;
use crate::storage::{HashTable, RowStore};
use crate::tensor::SharedTensor;
use rayon::prelude::*;
use sparsectr_kernels::{cpu_accumulate_unique, cpu_combine_backward, cpu_combine_forward};
use std::sync::Arc;
use tracing::debug;

pub struct DistributedSlotSparseEmbeddingHash<K: EmbeddingKey> {
    data: EmbeddingData<K>,
    tables: Vec<HashTable<K>>,
    /// Per origin GPU, the routing of the last training forward.
    plans: Vec<LookupPlan<K>>,
    /// Per owner GPU, the keys each source requested in the last training forward.
    served: Vec<Vec<Vec<K>>>,
    wgrad: Vec<GradientBuffer<K>>,
}

impl<K: EmbeddingKey> DistributedSlotSparseEmbeddingHash<K> {
    pub fn new(params: SparseEmbedding, ctx: &BuildContext<K>) -> Result<Self> {
        let data = EmbeddingData::new(params, ctx)?;
        let n = data.num_gpus();
        let capacity = data.hashed_capacity_per_gpu();
        let hp = data.engine.params().hyperparams;
        let tables = (0..n)
            .map(|_| HashTable::new(capacity, data.vec_size(), &hp, data.init))
            .collect();
        let wgrad = (0..n).map(|_| GradientBuffer::new(data.vec_size())).collect();
        debug!(capacity, num_gpus = n, "distributed hash tables allocated");
        Ok(Self {
            data,
            tables,
            plans: Vec::new(),
            served: Vec::new(),
            wgrad,
        })
    }

    /// Table held by `gpu`.
    pub fn table(&self, gpu: usize) -> Option<&HashTable<K>> {
        self.tables.get(gpu)
    }
}

impl<K: EmbeddingKey> Embedding<K> for DistributedSlotSparseEmbeddingHash<K> {
    fn name(&self) -> &str {
        &self.data.params.sparse_embedding_name
    }

    fn embedding_type(&self) -> EmbeddingType {
        EmbeddingType::DistributedSlotSparseEmbeddingHash
    }

    fn params(&self) -> &SparseEmbedding {
        &self.data.params
    }

    fn forward(&mut self, is_train: bool) -> Result<()> {
        let n = self.data.num_gpus();
        let vec_size = self.data.vec_size();
        let combiner = self.data.params.combiner;
        let resource = Arc::clone(&self.data.resource);
        let comm = resource.collective();
        let bag = Arc::clone(self.data.input.bag(is_train));
        let batch = bag.read();

        let plans: Vec<LookupPlan<K>> = batch
            .par_iter()
            .map(|t| LookupPlan::new(t.keys(), n))
            .collect();
        let requests = comm.all_to_all_v(plans.iter().map(|p| p.requests.clone()).collect())?;

        let replies = self
            .tables
            .par_iter_mut()
            .zip(requests.par_iter())
            .map(|(table, per_src)| {
                per_src
                    .iter()
                    .map(|keys| lookup_rows(table, keys, is_train, vec_size))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let replies = comm.all_to_all_v(replies)?;

        let outputs = self.data.output(is_train);
        plans
            .par_iter()
            .zip(replies.par_iter())
            .zip(batch.par_iter())
            .zip(outputs.par_iter())
            .try_for_each(|(((plan, reply), tensor), out)| -> Result<()> {
                let rows = plan.assemble(reply, vec_size, |k, _| {
                    Err(EmbeddingError::UnspecificError(format!(
                        "key {k:?} has no owner"
                    )))
                })?;
                let combined =
                    cpu_combine_forward(&rows, &plan.index, tensor.row_offset(), vec_size, combiner)?;
                out.write().copy_from_slice(&combined)?;
                Ok(())
            })?;

        if is_train {
            self.plans = plans;
            self.served = requests;
        }
        Ok(())
    }

    fn backward(&mut self) -> Result<()> {
        if self.plans.is_empty() {
            return Err(EmbeddingError::IllegalCall(
                "backward called before a training forward".to_string(),
            ));
        }
        let vec_size = self.data.vec_size();
        let combiner = self.data.params.combiner;
        let resource = Arc::clone(&self.data.resource);
        let batch = self.data.input.train.read();

        let sends = self
            .plans
            .par_iter()
            .zip(batch.par_iter())
            .zip(self.data.train_output.par_iter())
            .map(|((plan, tensor), top)| -> Result<Vec<Vec<f32>>> {
                let occ = cpu_combine_backward(top.read().data(), tensor.row_offset(), vec_size, combiner)?;
                let unique = cpu_accumulate_unique(&occ, &plan.index, plan.unique.len(), vec_size)?;
                Ok(plan.scatter(&unique, vec_size, |_, _| {}))
            })
            .collect::<Result<Vec<_>>>()?;
        drop(batch);
        let received = resource.collective().all_to_all_v(sends)?;

        for ((buf, keys), grads) in self.wgrad.iter_mut().zip(&self.served).zip(&received) {
            buf.clear();
            for (k, g) in keys.iter().zip(grads) {
                buf.extend(k, g);
            }
        }
        Ok(())
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
                buf.apply(engine, table, lr)?;
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
        let table = self.tables.get(owner_of(key, self.data.num_gpus()))?;
        table.find(key).map(|row| table.weight(row).to_vec())
    }

    fn vocabulary_size(&self) -> usize {
        self.tables.iter().map(|t| t.len()).sum()
    }

    fn dump(&self) -> Result<TableSnapshot> {
        let mut snapshot = self.data.new_snapshot();
        for table in &self.tables {
            let rows = table.rows();
            for (key, row) in table.entries() {
                snapshot.push(key.to_u64(), None, rows.weight(row), rows.state(row), rows.updates(row));
            }
        }
        snapshot.sort_by_key();
        Ok(snapshot)
    }

    fn load(&mut self, snapshot: &TableSnapshot) -> Result<()> {
        self.data.check_snapshot(snapshot)?;
        snapshot.validate()?;
        let n = self.data.num_gpus();
        for row in snapshot.rows() {
            let key = K::from_u64(row.key);
            self.tables[owner_of(key, n)].insert_row(key, row.weight, row.state, row.updates)?;
        }
        self.data.engine.set_step(snapshot.step);
        self.plans.clear();
        self.served.clear();
        self.wgrad.iter_mut().for_each(GradientBuffer::clear);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use crate::exchange::{ExchangeMode, ExchangeWgrad};
    use crate::input::{SlotEncoder, SparseInput};
    use crate::optim::{OptHyperParams, OptParams};
    use crate::resource::ResourceManager;
    use sparsectr_kernels::Combiner;

    fn build(num_gpus: usize, vec_size: usize, combiner: Combiner) -> (
        DistributedSlotSparseEmbeddingHash<u64>,
        SparseInput<u64>,
    ) {
        let resource = ResourceManager::single_node(num_gpus, 7).unwrap();
        let input = SparseInput::new(num_gpus, 1, 1, 1, 4);
        let ctx = BuildContext {
            resource,
            solver: SolverConfig::default(),
            input: input.clone(),
            default_opt: OptParams::new(OptHyperParams::Sgd { atomic_update: false }, 1.0),
            exchange: ExchangeWgrad::new(ExchangeMode::PerNetwork, num_gpus),
        };
        let params = SparseEmbedding::new(
            EmbeddingType::DistributedSlotSparseEmbeddingHash,
            "data",
            "emb",
            vec_size,
            combiner,
        )
        .with_slot_size_array(vec![100]);
        (DistributedSlotSparseEmbeddingHash::new(params, &ctx).unwrap(), input)
    }

    fn feed(input: &SparseInput<u64>, num_gpus: usize, samples: Vec<Vec<Vec<u64>>>) {
        SlotEncoder::new(num_gpus, 1, 4)
            .encode_into(&samples, &input.train)
            .unwrap();
    }

    #[test]
    fn test_forward_sums_duplicates() {
        let (mut emb, input) = build(2, 4, Combiner::Sum);
        feed(&input, 2, vec![vec![vec![5, 5, 9]], vec![vec![]]]);
        emb.forward(true).unwrap();
        let r5 = emb.read_row(5).unwrap();
        let r9 = emb.read_row(9).unwrap();
        let out = emb.train_output_tensors()[0].read();
        for i in 0..4 {
            assert!((out.data()[i] - (2.0 * r5[i] + r9[i])).abs() < 1e-6);
        }
        // an empty segment reads zeros
        assert_eq!(emb.train_output_tensors()[1].read().data(), &[0.0; 4]);
        assert_eq!(emb.vocabulary_size(), 2);
    }

    #[test]
    fn test_backward_and_update() {
        let (mut emb, input) = build(2, 2, Combiner::Mean);
        feed(&input, 2, vec![vec![vec![3, 4]], vec![vec![3]]]);
        emb.forward(true).unwrap();
        let before = emb.read_row(3).unwrap();
        for t in emb.train_output_tensors() {
            t.write().data_mut().fill(1.0);
        }
        emb.backward().unwrap();
        let wgrad = emb.accumulated_wgrad().unwrap();
        // key 3: 0.5 from GPU 0 (mean of two) + 1.0 from GPU 1
        assert_eq!(wgrad, vec![(3, vec![1.5, 1.5]), (4, vec![0.5, 0.5])]);
        emb.update_params(None).unwrap();
        let after = emb.read_row(3).unwrap();
        assert!((before[0] - 1.5 - after[0]).abs() < 1e-6);
    }

    #[test]
    fn test_evaluate_does_not_insert() {
        let (mut emb, input) = build(2, 2, Combiner::Sum);
        SlotEncoder::new(2, 1, 4)
            .encode_into(&[vec![vec![11]], vec![vec![12]]], &input.evaluate)
            .unwrap();
        emb.forward(false).unwrap();
        assert_eq!(emb.vocabulary_size(), 0);
        assert!(emb.backward().is_err());
    }

    #[test]
    fn test_dump_load() {
        let (mut emb, input) = build(2, 2, Combiner::Sum);
        feed(&input, 2, vec![vec![vec![1, 2]], vec![vec![3]]]);
        emb.forward(true).unwrap();
        let snap = emb.dump().unwrap();
        assert_eq!(snap.keys, vec![1, 2, 3]);

        let (mut fresh, _) = build(2, 2, Combiner::Sum);
        fresh.load(&snap).unwrap();
        assert_eq!(fresh.read_row(2), emb.read_row(2));
        assert_eq!(fresh.dump().unwrap(), snap);
    }
}
