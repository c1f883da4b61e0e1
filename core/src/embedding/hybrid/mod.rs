//! Frequent categories replicated on every GPU, infrequent ones partitioned by key.
//!
//! A frequent row is read locally and its gradient travels through the shared exchange
//! buffer, so every replica receives the same all-reduced gradient and applies the same
//! update. Infrequent rows follow the distributed path: owner `key % num_gpus`, all-to-all
//! of keys, rows and gradients. Which keys are frequent is decided by [`PhaseMachine`] from
//! [`FrequencyStatistics`] gathered over a window of training iterations.

pub mod state;
pub mod statistics;

pub use state::{HybridPhase, PhaseMachine, Transition};
pub use statistics::{classify, FrequencyStatistics};

use super::routing::{lookup_rows, LookupPlan};
use super::{merge_wgrad, owner_of, BuildContext, Embedding, EmbeddingData, GradientBuffer};
use crate::checkpoint::TableSnapshot;
use crate::config::{CommunicationType, EmbeddingType, SparseEmbedding};
use crate::distributed::{AllReduceAlgo, CollectiveBackend};
use crate::error::{EmbeddingError, Result};
use crate::exchange::{ExchangeSlot, ExchangeWgrad};
use crate::input::EmbeddingKey;
use crate::optim::GpuLearningRateSchedulers;
use crate::storage::{HashTable, RowStore};
use crate::tensor::SharedTensor;
use rayon::prelude::*;
use sparsectr_kernels::{cpu_accumulate_unique, cpu_combine_backward, cpu_combine_forward};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A row moved between the partitioned and replicated tables.
type MovedRow<K> = (K, Vec<f32>, Vec<f32>, u64);

pub struct HybridSparseEmbedding<K: EmbeddingKey> {
    data: EmbeddingData<K>,
    /// One replica of the frequent rows per GPU.
    frequent: Vec<HashTable<K>>,
    frequent_keys: Vec<K>,
    frequent_index: HashMap<K, usize>,
    infrequent: Vec<HashTable<K>>,
    statistics: Vec<FrequencyStatistics<K>>,
    gpu_iterations: Vec<u64>,
    machine: PhaseMachine,
    exchange: Arc<ExchangeWgrad>,
    exchange_slot: ExchangeSlot,
    max_frequent: usize,
    plans: Vec<LookupPlan<K>>,
    served: Vec<Vec<Vec<K>>>,
    wgrad: Vec<GradientBuffer<K>>,
    /// Set by `backward`, cleared by `update_params`.
    frequent_pending: bool,
    last_p_dup: f64,
}

/// Fraction of the infrequent requests of one iteration that name a key another GPU also
/// requested.
pub fn duplication_ratio<K: EmbeddingKey>(requests_per_origin: &[Vec<K>]) -> f64 {
    let total: usize = requests_per_origin.iter().map(Vec::len).sum();
    if total == 0 {
        return 0.0;
    }
    let distinct: HashSet<K> = requests_per_origin.iter().flatten().copied().collect();
    (total - distinct.len()) as f64 / total as f64
}

fn all_reduce_algo(comm: CommunicationType, num_nodes: usize) -> Result<AllReduceAlgo> {
    match comm {
        CommunicationType::IbNvlink | CommunicationType::IbNvlinkHier => {
            Ok(AllReduceAlgo::Hierarchical)
        }
        CommunicationType::NvlinkSingleNode if num_nodes == 1 => Ok(AllReduceAlgo::Flat),
        CommunicationType::NvlinkSingleNode => Err(EmbeddingError::wrong_input(format!(
            "{comm} communication needs a single node, topology has {num_nodes}"
        ))),
    }
}

impl<K: EmbeddingKey> HybridSparseEmbedding<K> {
    pub fn new(params: SparseEmbedding, ctx: &BuildContext<K>) -> Result<Self> {
        let data = EmbeddingData::new(params, ctx)?;
        let n = data.num_gpus();
        let vec_size = data.vec_size();
        let hybrid = &data.params.hybrid_embedding_param;
        let algo = all_reduce_algo(hybrid.communication_type, data.resource.num_nodes())?;
        let machine = PhaseMachine::new(
            ctx.solver.num_iterations_statistics,
            ctx.solver.reclassify_interval,
        )?;
        let max_frequent =
            hybrid.frequent_capacity(ctx.solver.batch_size, ctx.solver.batch_size_eval)?;
        let hp = data.engine.params().hyperparams;
        let frequent = (0..n)
            .map(|_| HashTable::new(max_frequent, vec_size, &hp, data.init))
            .collect();
        let infrequent = (0..n)
            .map(|_| HashTable::new(data.hashed_capacity_per_gpu(), vec_size, &hp, data.init))
            .collect();

        // Registration has to be the last fallible step: a slot registered by an embedding
        // that then fails to build would still be summed by every all-reduce.
        let exchange_slot = ctx.exchange.register(
            format!("{}.frequent_wgrad", data.params.sparse_embedding_name),
            max_frequent * (vec_size + 1),
            algo,
        )?;
        info!(
            name = %data.params.sparse_embedding_name,
            max_frequent,
            ?algo,
            threshold = hybrid.frequency_threshold(),
            "hybrid embedding registered with exchange buffer"
        );
        Ok(Self {
            frequent,
            frequent_keys: Vec::new(),
            frequent_index: HashMap::new(),
            infrequent,
            statistics: (0..n).map(|_| FrequencyStatistics::new()).collect(),
            gpu_iterations: vec![0; n],
            machine,
            exchange: Arc::clone(&ctx.exchange),
            exchange_slot,
            max_frequent,
            plans: Vec::new(),
            served: Vec::new(),
            wgrad: (0..n).map(|_| GradientBuffer::new(vec_size)).collect(),
            frequent_pending: false,
            last_p_dup: 0.0,
            data,
        })
    }

    pub fn phase(&self) -> HybridPhase {
        self.machine.phase()
    }

    /// Current frequent keys, most frequent first.
    pub fn frequent_keys(&self) -> &[K] {
        &self.frequent_keys
    }

    pub fn is_frequent(&self, key: K) -> bool {
        self.frequent_index.contains_key(&key)
    }

    /// Duplication ratio of the infrequent requests of the last training forward.
    pub fn last_duplication_ratio(&self) -> f64 {
        self.last_p_dup
    }

    /// Classifies from the merged statistics and moves rows between the tables.
    fn reclassify(&mut self) -> Result<()> {
        let mut merged = FrequencyStatistics::new();
        for s in &self.statistics {
            merged.merge(s);
        }
        let threshold = self.data.params.hybrid_embedding_param.frequency_threshold();
        let new_keys = classify(merged.counts(), merged.iterations(), threshold, self.max_frequent);
        let new_set: HashSet<K> = new_keys.iter().copied().collect();
        let n = self.data.num_gpus();

        let demoted: Vec<K> = self
            .frequent_keys
            .iter()
            .copied()
            .filter(|k| !new_set.contains(k))
            .collect();
        // Owners must have room for every demoted row before any replica gives one up.
        let mut incoming = vec![0usize; n];
        for &key in &demoted {
            let owner = owner_of(key, n);
            if self.infrequent[owner].find(key).is_none() {
                incoming[owner] += 1;
            }
        }
        for (table, &extra) in self.infrequent.iter().zip(&incoming) {
            if table.len() + extra > table.capacity() {
                return Err(EmbeddingError::OutOfCapacity {
                    what: format!(
                        "{} infrequent table receiving demoted rows",
                        self.data.params.sparse_embedding_name
                    ),
                    capacity: table.capacity(),
                    requested: table.len() + extra,
                });
            }
        }
        for &key in &demoted {
            let row = self.frequent.first().and_then(|replica| {
                let r = replica.find(key)?;
                let rows = replica.rows();
                Some((rows.weight(r).to_vec(), rows.state(r).to_vec(), rows.updates(r)))
            });
            if let Some((weight, state, updates)) = row {
                self.infrequent[owner_of(key, n)].insert_row(key, &weight, &state, updates)?;
            }
            for replica in self.frequent.iter_mut() {
                replica.remove(key);
            }
        }

        let promoted: Vec<K> = new_keys
            .iter()
            .copied()
            .filter(|k| !self.frequent_index.contains_key(k))
            .collect();
        // Each owner hands over the promoted rows it holds; every replica receives all of them.
        let parts: Vec<Vec<MovedRow<K>>> = self
            .infrequent
            .iter_mut()
            .map(|table| {
                promoted
                    .iter()
                    .filter_map(|&k| table.remove(k).map(|(w, s, u)| (k, w, s, u)))
                    .collect()
            })
            .collect();
        let moved = self.data.resource.collective().all_gather(parts)?;
        for replica in self.frequent.iter_mut() {
            for (key, weight, state, updates) in &moved {
                replica.insert_row(*key, weight, state, *updates)?;
            }
            for &key in &promoted {
                replica.find_or_insert(key)?;
            }
        }

        self.frequent_index = new_keys.iter().enumerate().map(|(p, &k)| (k, p)).collect();
        self.frequent_keys = new_keys;
        self.statistics.iter_mut().for_each(FrequencyStatistics::reset);
        info!(
            name = %self.data.params.sparse_embedding_name,
            frequent = self.frequent_keys.len(),
            promoted = promoted.len(),
            demoted = demoted.len(),
            "hybrid embedding classified"
        );
        Ok(())
    }

    /// Global frequent gradient, one `vec_size` row per frequent position, and the number of
    /// GPUs that touched each position.
    fn reduced_frequent(&self) -> Result<Vec<Vec<f32>>> {
        (0..self.data.num_gpus())
            .map(|g| self.exchange.read(self.exchange_slot, g))
            .collect()
    }
}

impl<K: EmbeddingKey> Embedding<K> for HybridSparseEmbedding<K> {
    fn name(&self) -> &str {
        &self.data.params.sparse_embedding_name
    }

    fn embedding_type(&self) -> EmbeddingType {
        EmbeddingType::HybridSparseEmbedding
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

        let frequent_index = &self.frequent_index;
        let plans: Vec<LookupPlan<K>> = batch
            .par_iter()
            .map(|t| LookupPlan::with_local(t.keys(), n, |k| frequent_index.contains_key(&k)))
            .collect();
        if let Some(limit) = self.data.params.hybrid_embedding_param.infrequent_sample_limit() {
            for plan in &plans {
                let samples = plan.index.iter().filter(|&&u| plan.placement[u].is_some()).count();
                if samples > limit {
                    return Err(EmbeddingError::OutOfCapacity {
                        what: "infrequent sample buffer".to_string(),
                        capacity: limit,
                        requested: samples,
                    });
                }
            }
        }

        let requests = comm.all_to_all_v(plans.iter().map(|p| p.requests.clone()).collect())?;
        let replies = self
            .infrequent
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

        let frequent = &self.frequent;
        self.data
            .output(is_train)
            .par_iter()
            .enumerate()
            .zip(plans.par_iter())
            .zip(replies.par_iter())
            .zip(batch.par_iter())
            .try_for_each(|((((gpu, out), plan), reply), tensor)| -> Result<()> {
                let replica = &frequent[gpu];
                let rows = plan.assemble(reply, vec_size, |k, dst| {
                    let row = replica.find(k).ok_or_else(|| {
                        EmbeddingError::UnspecificError(format!(
                            "frequent key {k:?} missing from the replica of GPU {gpu}"
                        ))
                    })?;
                    dst.copy_from_slice(replica.weight(row));
                    Ok(())
                })?;
                let combined =
                    cpu_combine_forward(&rows, &plan.index, tensor.row_offset(), vec_size, combiner)?;
                out.write().copy_from_slice(&combined)?;
                Ok(())
            })?;

        if is_train {
            if self.machine.is_collecting() {
                for (stats, tensor) in self.statistics.iter_mut().zip(batch.iter()) {
                    stats.record(tensor.keys());
                }
            }
            let per_origin: Vec<Vec<K>> = plans.iter().map(|p| p.requests.concat()).collect();
            self.last_p_dup = duplication_ratio(&per_origin);
            if self.last_p_dup > self.data.params.hybrid_embedding_param.p_dup_max {
                debug!(p_dup = self.last_p_dup, "infrequent duplication above limit");
                self.machine.flag_duplication();
            }
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
        let max_frequent = self.max_frequent;
        let counts_at = max_frequent * vec_size;
        let resource = Arc::clone(&self.data.resource);
        let batch = self.data.input.train.read();
        let frequent_index = &self.frequent_index;

        let (sends, frequent_grads): (Vec<Vec<Vec<f32>>>, Vec<Vec<f32>>) = self
            .plans
            .par_iter()
            .zip(batch.par_iter())
            .zip(self.data.train_output.par_iter())
            .map(|((plan, tensor), top)| -> Result<(Vec<Vec<f32>>, Vec<f32>)> {
                let occ =
                    cpu_combine_backward(top.read().data(), tensor.row_offset(), vec_size, combiner)?;
                let unique = cpu_accumulate_unique(&occ, &plan.index, plan.unique.len(), vec_size)?;
                let mut local = vec![0.0f32; max_frequent * (vec_size + 1)];
                let sends = plan.scatter(&unique, vec_size, |k, grad| {
                    if let Some(&p) = frequent_index.get(&k) {
                        for (d, g) in local[p * vec_size..(p + 1) * vec_size].iter_mut().zip(grad) {
                            *d += g;
                        }
                        local[counts_at + p] += 1.0;
                    }
                });
                Ok((sends, local))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        drop(batch);

        if !self.frequent_keys.is_empty() {
            for (gpu, local) in frequent_grads.iter().enumerate() {
                self.exchange.write(self.exchange_slot, gpu, local)?;
            }
            self.frequent_pending = true;
        }

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

        if self.frequent_pending {
            if self.exchange.is_pending(self.exchange_slot) {
                self.exchange
                    .all_reduce_slot(self.exchange_slot, self.data.resource.collective())?;
            }
            let reduced = self.reduced_frequent()?;
            let vec_size = self.data.vec_size();
            let counts_at = self.max_frequent * vec_size;
            let engine = &self.data.engine;
            let frequent_keys = &self.frequent_keys;
            self.frequent
                .par_iter_mut()
                .zip(reduced.par_iter())
                .zip(lrs.par_iter())
                .try_for_each(|((replica, buf), &lr)| -> Result<()> {
                    let mut rows = Vec::new();
                    let mut grads = Vec::new();
                    for (p, &key) in frequent_keys.iter().enumerate() {
                        if buf[counts_at + p] > 0.0 {
                            rows.push(replica.find(key).ok_or_else(|| {
                                EmbeddingError::UnspecificError(format!(
                                    "frequent key {key:?} missing from a replica"
                                ))
                            })?);
                            grads.extend_from_slice(&buf[p * vec_size..(p + 1) * vec_size]);
                        }
                    }
                    engine.apply(replica, &rows, &grads, lr)
                })?;
            self.frequent_pending = false;
        }

        let engine = &self.data.engine;
        self.infrequent
            .par_iter_mut()
            .zip(self.wgrad.par_iter_mut())
            .zip(lrs.par_iter())
            .try_for_each(|((table, buf), &lr)| {
                buf.apply(engine, table, lr)?;
                buf.clear();
                Ok(())
            })
    }

    fn end_iteration(&mut self) -> Result<()> {
        let collecting = self.machine.is_collecting();
        for it in self.gpu_iterations.iter_mut() {
            *it += 1;
        }
        if collecting {
            self.statistics
                .iter_mut()
                .for_each(FrequencyStatistics::end_iteration);
        }
        match self.machine.end_iteration(&self.gpu_iterations)? {
            Transition::Classify => self.reclassify(),
            Transition::StartCollecting => {
                self.statistics.iter_mut().for_each(FrequencyStatistics::reset);
                Ok(())
            }
            Transition::Stay => Ok(()),
        }
    }

    fn train_output_tensors(&self) -> &[SharedTensor] {
        &self.data.train_output
    }

    fn evaluate_output_tensors(&self) -> &[SharedTensor] {
        &self.data.evaluate_output
    }

    fn accumulated_wgrad(&self) -> Result<Vec<(K, Vec<f32>)>> {
        let vec_size = self.data.vec_size();
        let mut parts = self
            .wgrad
            .iter()
            .map(GradientBuffer::aggregated)
            .collect::<Result<Vec<_>>>()?;
        if self.frequent_pending {
            let counts_at = self.max_frequent * vec_size;
            // Before the all-reduce every GPU holds its own share; afterwards each holds the sum.
            let buffers = self.reduced_frequent()?;
            let shares = if self.exchange.is_pending(self.exchange_slot) {
                &buffers[..]
            } else {
                &buffers[..1]
            };
            let mut keys = Vec::new();
            let mut grads = Vec::new();
            for (p, &key) in self.frequent_keys.iter().enumerate() {
                if shares.iter().any(|b| b[counts_at + p] > 0.0) {
                    keys.push(key);
                    let mut sum = vec![0.0f32; vec_size];
                    for b in shares {
                        for (s, g) in sum.iter_mut().zip(&b[p * vec_size..(p + 1) * vec_size]) {
                            *s += g;
                        }
                    }
                    grads.extend_from_slice(&sum);
                }
            }
            parts.push((keys, grads));
        }
        Ok(merge_wgrad(parts, vec_size))
    }

    fn read_row(&self, key: K) -> Option<Vec<f32>> {
        let table = if self.is_frequent(key) {
            self.frequent.first()?
        } else {
            self.infrequent.get(owner_of(key, self.data.num_gpus()))?
        };
        table.find(key).map(|row| table.weight(row).to_vec())
    }

    fn vocabulary_size(&self) -> usize {
        self.frequent.first().map_or(0, |t| t.len())
            + self.infrequent.iter().map(|t| t.len()).sum::<usize>()
    }

    fn dump(&self) -> Result<TableSnapshot> {
        let mut snapshot = self.data.new_snapshot();
        for table in self.frequent.iter().take(1).chain(&self.infrequent) {
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
            if self.frequent_index.contains_key(&key) {
                for replica in self.frequent.iter_mut() {
                    replica.insert_row(key, row.weight, row.state, row.updates)?;
                }
            } else {
                self.infrequent[owner_of(key, n)].insert_row(key, row.weight, row.state, row.updates)?;
            }
        }
        self.data.engine.set_step(snapshot.step);
        self.plans.clear();
        self.served.clear();
        self.wgrad.iter_mut().for_each(GradientBuffer::clear);
        self.frequent_pending = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HybridEmbeddingParam, SolverConfig};
    use crate::error::ErrorKind;
    use crate::exchange::ExchangeMode;
    use crate::input::{SlotEncoder, SparseInput};
    use crate::optim::{OptHyperParams, OptParams};
    use crate::resource::ResourceManager;
    use sparsectr_kernels::Combiner;

    struct Fixture {
        emb: HybridSparseEmbedding<u64>,
        input: SparseInput<u64>,
        exchange: Arc<ExchangeWgrad>,
    }

    fn fixture(window: usize, hybrid: HybridEmbeddingParam) -> Fixture {
        let solver = SolverConfig {
            num_iterations_statistics: window,
            ..SolverConfig::default()
        };
        let sgd = OptParams::new(OptHyperParams::Sgd { atomic_update: false }, 1.0);
        fixture_with(solver, sgd, hybrid)
    }

    fn fixture_with(solver: SolverConfig, opt: OptParams, hybrid: HybridEmbeddingParam) -> Fixture {
        let resource = ResourceManager::single_node(2, 5).unwrap();
        let input = SparseInput::new(2, 2, 2, 1, 8);
        let exchange = ExchangeWgrad::new(ExchangeMode::PerNetwork, 2);
        let ctx = BuildContext {
            resource,
            solver,
            input: input.clone(),
            default_opt: opt,
            exchange: Arc::clone(&exchange),
        };
        let params = SparseEmbedding::new(
            EmbeddingType::HybridSparseEmbedding,
            "data",
            "hybrid",
            2,
            Combiner::Sum,
        )
        .with_slot_size_array(vec![1000])
        .with_hybrid_param(hybrid);
        Fixture {
            emb: HybridSparseEmbedding::new(params, &ctx).unwrap(),
            input,
            exchange,
        }
    }

    /// Threshold of one occurrence per iteration, flat all-reduce.
    fn param(max_frequent: usize) -> HybridEmbeddingParam {
        HybridEmbeddingParam {
            max_num_frequent_categories: max_frequent,
            max_all_reduce_bandwidth: 1.0,
            max_all_to_all_bandwidth: 1.0,
            efficiency_bandwidth_ratio: 0.5,
            communication_type: CommunicationType::NvlinkSingleNode,
            p_dup_max: 1.0,
            ..HybridEmbeddingParam::default()
        }
    }

    fn step(f: &mut Fixture, samples: Vec<Vec<Vec<u64>>>) {
        SlotEncoder::new(2, 1, 8).encode_into(&samples, &f.input.train).unwrap();
        f.emb.forward(true).unwrap();
        for t in f.emb.train_output_tensors() {
            t.write().data_mut().fill(1.0);
        }
        f.emb.backward().unwrap();
        f.emb.update_params(None).unwrap();
        f.emb.end_iteration().unwrap();
    }

    #[test]
    fn test_classification_and_replica_consistency() {
        let mut f = fixture(2, param(1));
        assert_eq!(f.exchange.num_slots(), 1);
        // key 7 appears 4 times per iteration, 8 and 9 once
        let batch = || vec![vec![vec![7, 8]], vec![vec![7]], vec![vec![7, 9]], vec![vec![7]]];
        step(&mut f, batch());
        assert_eq!(f.emb.phase(), HybridPhase::Collecting);
        let before = f.emb.read_row(7).unwrap();
        step(&mut f, batch());
        assert_eq!(f.emb.phase(), HybridPhase::Classified);
        assert_eq!(f.emb.frequent_keys(), &[7]);
        // the promoted row kept its trained value
        assert_eq!(f.emb.read_row(7).unwrap(), {
            let mut expect = before.clone();
            expect.iter_mut().for_each(|v| *v -= 4.0);
            expect
        });
        assert_eq!(f.emb.vocabulary_size(), 3);

        let r7 = f.emb.read_row(7).unwrap();
        SlotEncoder::new(2, 1, 8).encode_into(&batch(), &f.input.train).unwrap();
        f.emb.forward(true).unwrap();
        for t in f.emb.train_output_tensors() {
            t.write().data_mut().fill(1.0);
        }
        f.emb.backward().unwrap();
        let wgrad = f.emb.accumulated_wgrad().unwrap();
        assert_eq!(wgrad[0], (7, vec![4.0, 4.0]));
        f.emb.update_params(None).unwrap();
        let after: Vec<_> = f.emb.frequent.iter().map(|t| t.weight(t.find(7).unwrap()).to_vec()).collect();
        assert_eq!(after[0], after[1]);
        assert!((after[0][0] - (r7[0] - 4.0)).abs() < 1e-5);
    }

    #[test]
    fn test_frequent_capacity_scales_with_batch() {
        let mut f = fixture_with(
            SolverConfig {
                batch_size: 4,
                batch_size_eval: 2,
                num_iterations_statistics: 1,
                ..SolverConfig::default()
            },
            OptParams::new(OptHyperParams::Sgd { atomic_update: false }, 1.0),
            param(1),
        );
        assert_eq!(f.emb.max_frequent, 4);
        // 7 four times and 8 twice per iteration both clear a threshold of one
        step(&mut f, vec![vec![vec![7, 8]], vec![vec![7, 8]], vec![vec![7]], vec![vec![7]]]);
        assert_eq!(f.emb.frequent_keys(), &[7, 8]);
    }

    #[test]
    fn test_demotion_moves_row_back_to_owner() {
        let mut f = fixture_with(
            SolverConfig {
                num_iterations_statistics: 1,
                reclassify_interval: 1,
                ..SolverConfig::default()
            },
            OptParams::new(OptHyperParams::MomentumSgd { factor: 0.5 }, 0.1),
            param(1),
        );
        let hot_seven = || vec![vec![vec![7, 8]], vec![vec![7]], vec![vec![7, 9]], vec![vec![7]]];
        // every key once: nothing clears the threshold
        let cold = || vec![vec![vec![5, 7]], vec![vec![6]], vec![vec![3]], vec![vec![4]]];

        step(&mut f, hot_seven());
        assert_eq!(f.emb.frequent_keys(), &[7]);
        // classified, then the interval elapses and a new window starts
        step(&mut f, cold());
        assert_eq!(f.emb.phase(), HybridPhase::Recollecting);
        assert!(f.emb.is_frequent(7));

        SlotEncoder::new(2, 1, 8).encode_into(&cold(), &f.input.train).unwrap();
        f.emb.forward(true).unwrap();
        for t in f.emb.train_output_tensors() {
            t.write().data_mut().fill(1.0);
        }
        f.emb.backward().unwrap();
        f.emb.update_params(None).unwrap();
        let replica = &f.emb.frequent[0];
        let r = replica.find(7).unwrap();
        let trained = (
            replica.rows().weight(r).to_vec(),
            replica.rows().state(r).to_vec(),
            replica.rows().updates(r),
        );
        assert!(trained.1.iter().any(|m| *m != 0.0));

        f.emb.end_iteration().unwrap();
        assert_eq!(f.emb.phase(), HybridPhase::Classified);
        assert!(f.emb.frequent_keys().is_empty());
        assert!(!f.emb.is_frequent(7));
        assert!(f.emb.frequent.iter().all(|t| t.find(7).is_none()));

        let owner = &f.emb.infrequent[owner_of(7u64, 2)];
        let r = owner.find(7).unwrap();
        assert_eq!(owner.rows().weight(r), trained.0.as_slice());
        assert_eq!(owner.rows().state(r), trained.1.as_slice());
        assert_eq!(owner.rows().updates(r), trained.2);
        assert_eq!(f.emb.read_row(7).unwrap(), trained.0);
    }

    #[test]
    fn test_infrequent_sample_limit() {
        let mut f = fixture(
            1,
            HybridEmbeddingParam {
                max_num_infrequent_samples: 1,
                ..param(1)
            },
        );
        SlotEncoder::new(2, 1, 8)
            .encode_into(&[vec![vec![1, 2]], vec![vec![]], vec![vec![]], vec![vec![]]], &f.input.train)
            .unwrap();
        let err = f.emb.forward(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfCapacity);
    }

    #[test]
    fn test_duplication_ratio() {
        assert_eq!(duplication_ratio::<u64>(&[]), 0.0);
        assert_eq!(duplication_ratio(&[vec![1u64, 2], vec![2, 3]]), 0.25);
    }

    #[test]
    fn test_single_node_communication_checked() {
        assert_eq!(all_reduce_algo(CommunicationType::IbNvlink, 2).unwrap(), AllReduceAlgo::Hierarchical);
        assert_eq!(
            all_reduce_algo(CommunicationType::NvlinkSingleNode, 2).unwrap_err().kind(),
            ErrorKind::WrongInput
        );
    }
}
