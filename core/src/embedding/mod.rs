//! The four sparse embedding variants behind one [`Embedding`] interface.
//!
//! | variant | key placement | forward traffic |
//! |---|---|---|
//! | [`DistributedSlotSparseEmbeddingHash`] | `key % num_gpus` | all-to-all of unique keys and rows |
//! | [`LocalizedSlotSparseEmbeddingHash`] | whole slot on one GPU | all-to-all of combined vectors |
//! | [`LocalizedSlotSparseEmbeddingOneHot`] | whole slot on one GPU, direct rows | same as above |
//! | [`HybridSparseEmbedding`] | frequent: every GPU, infrequent: `key % num_gpus` | all-to-all + all-reduce |

pub mod distributed_hash;
pub mod hybrid;
pub mod localized;
mod routing;

pub use distributed_hash::DistributedSlotSparseEmbeddingHash;
pub use hybrid::HybridSparseEmbedding;
pub use localized::{
    assign_slots, LocalizedSlotEmbedding, LocalizedSlotSparseEmbeddingHash,
    LocalizedSlotSparseEmbeddingOneHot, SlotHashTable, SlotTable,
};

use crate::checkpoint::TableSnapshot;
use crate::config::{EmbeddingType, SolverConfig, SparseEmbedding};
use crate::error::{EmbeddingError, Result};
use crate::exchange::ExchangeWgrad;
use crate::input::{EmbeddingKey, SparseInput};
use crate::optim::{GpuLearningRateSchedulers, OptParams, OptimizerEngine};
use crate::resource::ResourceManager;
use crate::storage::{RowInitializer, RowStore};
use crate::tensor::{shared_zeros, SharedTensor};
use sparsectr_kernels::{cpu_accumulate_unique, unique_index};
use std::sync::Arc;
use tracing::info;

/// A named output tensor of one GPU.
#[derive(Debug, Clone)]
pub struct TensorEntity {
    pub name: String,
    pub tensor: SharedTensor,
}

/// Interface shared by every embedding variant.
///
/// One training iteration calls `forward(true)`, then (after the dense network has written
/// the gradient into the train output tensors) `backward`, `update_params` and
/// `end_iteration`. Evaluation calls `forward(false)` only and never mutates tables.
pub trait Embedding<K: EmbeddingKey>: Send + Sync {
    fn name(&self) -> &str;

    fn embedding_type(&self) -> EmbeddingType;

    fn params(&self) -> &SparseEmbedding;

    /// Looks up the current batch and writes `[batch, slot_num, vec_size]` per GPU.
    fn forward(&mut self, is_train: bool) -> Result<()>;

    /// Reads the top gradient from the train output tensors and accumulates one gradient
    /// per key on its owning GPU.
    fn backward(&mut self) -> Result<()>;

    /// Applies the accumulated gradients. `schedulers` overrides the configured learning rate.
    fn update_params(&mut self, schedulers: Option<&GpuLearningRateSchedulers>) -> Result<()>;

    /// Marks the end of a training iteration.
    fn end_iteration(&mut self) -> Result<()> {
        Ok(())
    }

    fn train_output_tensors(&self) -> &[SharedTensor];

    fn evaluate_output_tensors(&self) -> &[SharedTensor];

    /// Per-key gradients accumulated by the last `backward`, in ascending key order.
    fn accumulated_wgrad(&self) -> Result<Vec<(K, Vec<f32>)>>;

    /// Current weights of `key`, wherever it is stored.
    fn read_row(&self, key: K) -> Option<Vec<f32>>;

    /// Number of stored rows over all GPUs (replicated rows count once).
    fn vocabulary_size(&self) -> usize;

    fn dump(&self) -> Result<TableSnapshot>;

    fn load(&mut self, snapshot: &TableSnapshot) -> Result<()>;
}

/// Everything an embedding needs at construction.
pub struct BuildContext<K> {
    pub resource: Arc<ResourceManager>,
    pub solver: SolverConfig,
    pub input: SparseInput<K>,
    /// Optimizer used when the embedding does not configure its own.
    pub default_opt: OptParams,
    pub exchange: Arc<ExchangeWgrad>,
}

/// Instantiates the variant named by `params.embedding_type`.
pub fn create_embedding<K: EmbeddingKey>(
    params: SparseEmbedding,
    ctx: &BuildContext<K>,
) -> Result<Box<dyn Embedding<K>>> {
    let embedding: Box<dyn Embedding<K>> = match params.embedding_type {
        EmbeddingType::DistributedSlotSparseEmbeddingHash => {
            Box::new(DistributedSlotSparseEmbeddingHash::new(params, ctx)?)
        }
        EmbeddingType::LocalizedSlotSparseEmbeddingHash => {
            Box::new(LocalizedSlotSparseEmbeddingHash::new_hash(params, ctx)?)
        }
        EmbeddingType::LocalizedSlotSparseEmbeddingOneHot => {
            Box::new(LocalizedSlotSparseEmbeddingOneHot::new_one_hot(params, ctx)?)
        }
        EmbeddingType::HybridSparseEmbedding => Box::new(HybridSparseEmbedding::new(params, ctx)?),
    };
    Ok(embedding)
}

/// State common to every variant.
pub(crate) struct EmbeddingData<K> {
    pub params: SparseEmbedding,
    pub resource: Arc<ResourceManager>,
    pub input: SparseInput<K>,
    pub train_output: Vec<SharedTensor>,
    pub evaluate_output: Vec<SharedTensor>,
    pub engine: OptimizerEngine,
    pub init: RowInitializer,
}

impl<K: EmbeddingKey> EmbeddingData<K> {
    pub fn new(params: SparseEmbedding, ctx: &BuildContext<K>) -> Result<Self> {
        params.validate()?;
        let num_gpus = ctx.resource.local_gpu_count();
        let (train_bags, eval_bags) = (ctx.input.train.read(), ctx.input.evaluate.read());
        if train_bags.len() != num_gpus || eval_bags.len() != num_gpus {
            return Err(EmbeddingError::wrong_input(format!(
                "sparse input {} is laid out for {} GPUs, resource manager has {num_gpus}",
                params.bottom_name,
                train_bags.len()
            )));
        }
        let vec_size = params.embedding_vec_size;
        let slot_num = ctx.input.slot_num;
        let train_output = train_bags
            .iter()
            .map(|t| shared_zeros([t.batch_size(), slot_num, vec_size]))
            .collect();
        let evaluate_output = eval_bags
            .iter()
            .map(|t| shared_zeros([t.batch_size(), slot_num, vec_size]))
            .collect();
        drop((train_bags, eval_bags));

        let opt = params.embedding_opt_params.unwrap_or(ctx.default_opt);
        opt.validate()?;
        info!(
            name = %params.sparse_embedding_name,
            embedding_type = %params.embedding_type,
            vec_size,
            slot_num,
            optimizer = %opt.optimizer_type(),
            "creating sparse embedding"
        );
        Ok(Self {
            init: RowInitializer::for_vec_size(ctx.resource.seed(), vec_size),
            params,
            resource: Arc::clone(&ctx.resource),
            input: ctx.input.clone(),
            train_output,
            evaluate_output,
            engine: OptimizerEngine::new(opt),
        })
    }

    pub fn num_gpus(&self) -> usize {
        self.resource.local_gpu_count()
    }

    pub fn vec_size(&self) -> usize {
        self.params.embedding_vec_size
    }

    pub fn slot_num(&self) -> usize {
        self.input.slot_num
    }

    pub fn output(&self, is_train: bool) -> &[SharedTensor] {
        if is_train {
            &self.train_output
        } else {
            &self.evaluate_output
        }
    }

    /// Learning rate of `gpu` for this step.
    pub fn lr(&self, gpu: usize, schedulers: Option<&GpuLearningRateSchedulers>) -> Result<f32> {
        match schedulers {
            Some(s) => s.lr(gpu),
            None => Ok(self.engine.params().learning_rate),
        }
    }

    /// Per-GPU capacity of a key-hashed table: the configured workspace, or an even share of
    /// the total slot vocabulary.
    pub fn hashed_capacity_per_gpu(&self) -> usize {
        if self.params.max_vocabulary_size_per_gpu > 0 {
            self.params.max_vocabulary_size_per_gpu
        } else {
            let total: usize = self.params.slot_size_array.iter().sum();
            total.div_ceil(self.num_gpus().max(1))
        }
    }

    /// Fails unless `snapshot` was taken from a table of the same width and optimizer.
    pub fn check_snapshot(&self, snapshot: &TableSnapshot) -> Result<()> {
        let hp = &self.engine.params().hyperparams;
        if snapshot.vec_size != self.vec_size()
            || snapshot.state_len != hp.state_slots() * self.vec_size()
        {
            return Err(EmbeddingError::DataCheck(format!(
                "snapshot of width {} with {} state values does not fit {} (width {}, optimizer {})",
                snapshot.vec_size,
                snapshot.state_len,
                self.params.sparse_embedding_name,
                self.vec_size(),
                hp.optimizer_type()
            )));
        }
        Ok(())
    }

    pub fn new_snapshot(&self) -> TableSnapshot {
        let hp = &self.engine.params().hyperparams;
        TableSnapshot::new(
            self.vec_size(),
            hp.state_slots() * self.vec_size(),
            self.engine.step(),
        )
    }
}

/// Gradients received by one GPU for the rows it owns.
#[derive(Debug, Clone)]
pub(crate) struct GradientBuffer<K> {
    vec_size: usize,
    keys: Vec<K>,
    grads: Vec<f32>,
}

impl<K: EmbeddingKey> GradientBuffer<K> {
    pub fn new(vec_size: usize) -> Self {
        Self {
            vec_size,
            keys: Vec::new(),
            grads: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.grads.clear();
    }

    pub fn extend(&mut self, keys: &[K], grads: &[f32]) {
        debug_assert_eq!(keys.len() * self.vec_size, grads.len());
        self.keys.extend_from_slice(keys);
        self.grads.extend_from_slice(grads);
    }

    /// One summed gradient per distinct key, in first-arrival order.
    pub fn aggregated(&self) -> Result<(Vec<K>, Vec<f32>)> {
        let (unique, index) = unique_index(&self.keys);
        let sums = cpu_accumulate_unique(&self.grads, &index, unique.len(), self.vec_size)?;
        Ok((unique, sums))
    }

    /// Applies the buffered gradients to `table`.
    ///
    /// Atomic SGD consumes every contribution as it arrived; every other rule needs one
    /// pre-aggregated gradient per row.
    pub fn apply<S: RowStore<K>>(
        &self,
        engine: &OptimizerEngine,
        table: &mut S,
        lr: f32,
    ) -> Result<()> {
        let aggregated;
        let (keys, grads) = if engine.params().hyperparams.allows_duplicate_rows() {
            (&self.keys[..], &self.grads[..])
        } else {
            aggregated = self.aggregated()?;
            (&aggregated.0[..], &aggregated.1[..])
        };
        let rows = keys
            .iter()
            .map(|&k| {
                table.find(k).ok_or_else(|| {
                    EmbeddingError::UnspecificError(format!(
                        "gradient for key {k:?} that has no row on its owner"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        engine.apply(table, &rows, grads, lr)
    }
}

/// Merges per-GPU `(key, grad)` lists into one list sorted by key.
pub(crate) fn merge_wgrad<K: EmbeddingKey>(
    parts: impl IntoIterator<Item = (Vec<K>, Vec<f32>)>,
    vec_size: usize,
) -> Vec<(K, Vec<f32>)> {
    let mut out: Vec<(K, Vec<f32>)> = parts
        .into_iter()
        .flat_map(|(keys, grads)| {
            keys.into_iter()
                .zip(grads.chunks_exact(vec_size).map(<[f32]>::to_vec).collect::<Vec<_>>())
        })
        .collect();
    out.sort_by_key(|(k, _)| *k);
    out
}

/// Owner of a key under modulo placement.
pub(crate) fn owner_of<K: EmbeddingKey>(key: K, num_gpus: usize) -> usize {
    (key.to_u64() % num_gpus as u64) as usize
}
