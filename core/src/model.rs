//! Builds the embedding part of a model graph and drives its training iterations.

use crate::config::{SolverConfig, SparseEmbedding};
use crate::distributed::CommSnapshot;
use crate::embedding::{create_embedding, BuildContext, Embedding, TensorEntity};
use crate::error::{EmbeddingError, Result};
use crate::exchange::{ExchangeMode, ExchangeWgrad};
use crate::input::{EmbeddingKey, SparseInput};
use crate::optim::{GpuLearningRateSchedulers, OptParams};
use crate::resource::ResourceManager;
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Sparse inputs, the embeddings reading them and the per-GPU output registry.
///
/// Output tensors are registered in declaration order, one [`TensorEntity`] per GPU, for both
/// the train and the evaluate graph.
pub struct EmbeddingGraph<K: EmbeddingKey> {
    resource: Arc<ResourceManager>,
    solver: SolverConfig,
    default_opt: OptParams,
    batch_size_per_gpu: (usize, usize),
    sparse_inputs: HashMap<String, SparseInput<K>>,
    embeddings: Vec<Box<dyn Embedding<K>>>,
    train_tensor_entries: Vec<Vec<TensorEntity>>,
    evaluate_tensor_entries: Vec<Vec<TensorEntity>>,
    exchange: Arc<ExchangeWgrad>,
    lr_schedulers: Option<GpuLearningRateSchedulers>,
}

impl<K: EmbeddingKey> EmbeddingGraph<K> {
    /// `default_opt` is used by every embedding that does not configure its own optimizer.
    pub fn new(
        resource: Arc<ResourceManager>,
        solver: SolverConfig,
        default_opt: OptParams,
    ) -> Result<Self> {
        let n = resource.local_gpu_count();
        let batch_size_per_gpu = solver.batch_size_per_gpu(n)?;
        default_opt.validate()?;
        let mode = if solver.grouped_all_reduce {
            ExchangeMode::Grouped
        } else {
            ExchangeMode::PerNetwork
        };
        Ok(Self {
            exchange: ExchangeWgrad::new(mode, n),
            resource,
            solver,
            default_opt,
            batch_size_per_gpu,
            sparse_inputs: HashMap::new(),
            embeddings: Vec::new(),
            train_tensor_entries: vec![Vec::new(); n],
            evaluate_tensor_entries: vec![Vec::new(); n],
            lr_schedulers: None,
        })
    }

    /// Declares a sparse input and returns its buffers for the data reader to fill.
    pub fn add_sparse_input(
        &mut self,
        name: impl Into<String>,
        slot_num: usize,
        max_feature_num_per_sample: usize,
    ) -> Result<SparseInput<K>> {
        let name = name.into();
        if self.sparse_inputs.contains_key(&name) {
            return Err(EmbeddingError::wrong_input(format!(
                "sparse input {name} declared twice"
            )));
        }
        let (train, eval) = self.batch_size_per_gpu;
        let input = SparseInput::new(
            self.resource.local_gpu_count(),
            train,
            eval,
            slot_num,
            max_feature_num_per_sample,
        );
        self.sparse_inputs.insert(name, input.clone());
        Ok(input)
    }

    /// Validates `params`, builds the embedding and registers its outputs. On error nothing
    /// is registered.
    pub fn add_sparse_embedding(&mut self, params: SparseEmbedding) -> Result<()> {
        for warning in params.validate()? {
            warn!(embedding = %params.sparse_embedding_name, "{warning}");
        }
        let input = self
            .sparse_inputs
            .get(&params.bottom_name)
            .ok_or_else(|| {
                EmbeddingError::wrong_input(format!("Cannot find bottom {}", params.bottom_name))
            })?
            .clone();
        let top = params.sparse_embedding_name.clone();
        if self.sparse_inputs.contains_key(&top) || self.embedding(&top).is_some() {
            return Err(EmbeddingError::wrong_input(format!(
                "tensor {top} is already defined"
            )));
        }

        let ctx = BuildContext {
            resource: Arc::clone(&self.resource),
            solver: self.solver.clone(),
            input,
            default_opt: self.default_opt,
            exchange: Arc::clone(&self.exchange),
        };
        let embedding = create_embedding(params, &ctx)?;

        for (gpu, (train, eval)) in embedding
            .train_output_tensors()
            .iter()
            .zip(embedding.evaluate_output_tensors())
            .enumerate()
        {
            self.train_tensor_entries[gpu].push(TensorEntity {
                name: top.clone(),
                tensor: Arc::clone(train),
            });
            self.evaluate_tensor_entries[gpu].push(TensorEntity {
                name: top.clone(),
                tensor: Arc::clone(eval),
            });
        }
        info!(top = %top, total = self.embeddings.len() + 1, "sparse embedding added");
        self.embeddings.push(embedding);
        Ok(())
    }

    /// Parses one embedding entry of the model JSON and adds it.
    pub fn add_sparse_embedding_json(&mut self, j: &serde_json::Value) -> Result<()> {
        self.add_sparse_embedding(SparseEmbedding::from_json(j)?)
    }

    pub fn set_lr_schedulers(&mut self, schedulers: GpuLearningRateSchedulers) -> Result<()> {
        if schedulers.len() != self.resource.local_gpu_count() {
            return Err(EmbeddingError::wrong_input(format!(
                "{} learning rate schedulers for {} GPUs",
                schedulers.len(),
                self.resource.local_gpu_count()
            )));
        }
        self.lr_schedulers = Some(schedulers);
        Ok(())
    }

    pub fn lr_schedulers(&self) -> Option<&GpuLearningRateSchedulers> {
        self.lr_schedulers.as_ref()
    }

    pub fn resource(&self) -> &Arc<ResourceManager> {
        &self.resource
    }

    pub fn sparse_input(&self, name: &str) -> Option<&SparseInput<K>> {
        self.sparse_inputs.get(name)
    }

    pub fn embeddings(&self) -> &[Box<dyn Embedding<K>>] {
        &self.embeddings
    }

    pub fn embedding(&self, name: &str) -> Option<&dyn Embedding<K>> {
        self.embeddings
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.as_ref())
    }

    pub fn embedding_mut(&mut self, name: &str) -> Option<&mut Box<dyn Embedding<K>>> {
        self.embeddings.iter_mut().find(|e| e.name() == name)
    }

    pub fn train_tensor_entries(&self) -> &[Vec<TensorEntity>] {
        &self.train_tensor_entries
    }

    pub fn evaluate_tensor_entries(&self) -> &[Vec<TensorEntity>] {
        &self.evaluate_tensor_entries
    }

    pub fn exchange(&self) -> &Arc<ExchangeWgrad> {
        &self.exchange
    }

    pub fn comm_stats(&self) -> CommSnapshot {
        self.resource.comm_stats().snapshot()
    }

    /// Runs one training iteration over every embedding.
    ///
    /// `fill_top_grad(name, gpu, tensor)` stands in for the dense network: it receives each
    /// train output tensor after the forward pass and must overwrite it with the gradient of
    /// the loss with respect to that output.
    pub fn train_step<F>(&mut self, mut fill_top_grad: F) -> Result<()>
    where
        F: FnMut(&str, usize, &mut Tensor<f32, 3>),
    {
        for e in self.embeddings.iter_mut() {
            e.forward(true)?;
        }
        for e in &self.embeddings {
            for (gpu, t) in e.train_output_tensors().iter().enumerate() {
                fill_top_grad(e.name(), gpu, &mut *t.write());
            }
        }
        for e in self.embeddings.iter_mut() {
            e.backward()?;
        }
        self.exchange.all_reduce(self.resource.collective())?;
        for e in self.embeddings.iter_mut() {
            e.update_params(self.lr_schedulers.as_ref())?;
        }
        for e in self.embeddings.iter_mut() {
            e.end_iteration()?;
        }
        if let Some(s) = self.lr_schedulers.as_mut() {
            s.advance();
        }
        Ok(())
    }

    /// Forwards the evaluation batch through every embedding.
    pub fn evaluate(&mut self) -> Result<()> {
        for e in self.embeddings.iter_mut() {
            e.forward(false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingType;
    use crate::error::ErrorKind;
    use sparsectr_kernels::Combiner;

    fn graph() -> EmbeddingGraph<u64> {
        let resource = ResourceManager::single_node(2, 1).unwrap();
        let solver = SolverConfig {
            batch_size: 4,
            batch_size_eval: 2,
            ..SolverConfig::default()
        };
        EmbeddingGraph::new(resource, solver, OptParams::default()).unwrap()
    }

    fn embedding(bottom: &str, top: &str) -> SparseEmbedding {
        SparseEmbedding::new(
            EmbeddingType::DistributedSlotSparseEmbeddingHash,
            bottom,
            top,
            8,
            Combiner::Sum,
        )
        .with_slot_size_array(vec![10, 10])
    }

    #[test]
    fn test_registry_in_declaration_order() {
        let mut g = graph();
        let input = g.add_sparse_input("data", 2, 4).unwrap();
        assert_eq!(input.train.read()[0].batch_size(), 2);
        assert_eq!(input.evaluate.read()[0].batch_size(), 1);
        g.add_sparse_embedding(embedding("data", "a")).unwrap();
        g.add_sparse_embedding(embedding("data", "b")).unwrap();
        for gpu in 0..2 {
            let names: Vec<_> = g.train_tensor_entries()[gpu].iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, vec!["a", "b"]);
            assert_eq!(g.evaluate_tensor_entries()[gpu].len(), 2);
        }
        assert_eq!(
            g.train_tensor_entries()[0][0].tensor.read().shape(),
            &[2, 2, 8]
        );
    }

    #[test]
    fn test_failed_add_registers_nothing() {
        let mut g = graph();
        g.add_sparse_input("data", 2, 4).unwrap();
        let err = g.add_sparse_embedding(embedding("missing", "a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongInput);
        assert!(err.to_string().contains("Cannot find bottom"));

        let bad = SparseEmbedding {
            embedding_vec_size: 0,
            ..embedding("data", "a")
        };
        assert!(g.add_sparse_embedding(bad).is_err());
        assert!(g.embeddings().is_empty());
        assert!(g.train_tensor_entries().iter().all(Vec::is_empty));

        g.add_sparse_embedding(embedding("data", "a")).unwrap();
        let dup = g.add_sparse_embedding(embedding("data", "a")).unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::WrongInput);
        assert_eq!(g.embeddings().len(), 1);
        assert!(g.add_sparse_input("data", 1, 1).is_err());
    }
}
