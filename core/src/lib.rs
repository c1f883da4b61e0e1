//! # sparsectr
//!
//! `sparsectr` partitions embedding tables that are too large for one device across a set of
//! GPUs and runs their lookup, gradient scatter and optimizer update with as little
//! communication as possible.
//!
//! GPUs are simulated in-process: every per-GPU array is indexed `0..local_gpu_count`, the work
//! of each GPU runs as a rayon task and collectives take the buffers of every participant at once.
//!
//! ## Modules
//!
//! - [`config`]: embedding and solver configuration, including the JSON boundary.
//! - [`resource`]: GPU topology and the collective backend.
//! - [`distributed`]: all-to-all, all-reduce (flat and hierarchical) and all-gather.
//! - [`input`]: per-GPU CSR sparse input and the slot encoder.
//! - [`storage`]: per-GPU hash and direct-indexed row tables.
//! - [`optim`]: the six update rules, update types and learning-rate schedules.
//! - [`embedding`]: the four embedding variants.
//! - [`exchange`]: shared weight-gradient buffers of the hybrid variant.
//! - [`model`]: the graph builder and training-step driver.
//! - [`checkpoint`]: table snapshots in safetensors format.
//!
//! ## Example
//!
//! ```rust
//! use sparsectr::config::{Combiner, EmbeddingType, SolverConfig, SparseEmbedding};
//! use sparsectr::input::SlotEncoder;
//! use sparsectr::model::EmbeddingGraph;
//! use sparsectr::optim::OptParams;
//! use sparsectr::resource::ResourceManager;
//!
//! let resource = ResourceManager::single_node(2, 42).unwrap();
//! let solver = SolverConfig { batch_size: 2, batch_size_eval: 2, ..SolverConfig::default() };
//! let mut graph = EmbeddingGraph::<u64>::new(resource, solver, OptParams::default()).unwrap();
//! let input = graph.add_sparse_input("data", 1, 4).unwrap();
//! graph
//!     .add_sparse_embedding(
//!         SparseEmbedding::new(EmbeddingType::DistributedSlotSparseEmbeddingHash, "data", "emb", 32, Combiner::Sum)
//!             .with_slot_size_array(vec![100]),
//!     )
//!     .unwrap();
//!
//! SlotEncoder::new(2, 1, 4).encode_into(&[vec![vec![3, 7]], vec![vec![7]]], &input.train).unwrap();
//! graph.train_step(|_, _, grad| grad.data_mut().fill(0.1)).unwrap();
//! assert_eq!(graph.embedding("emb").unwrap().vocabulary_size(), 2);
//! ```

pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod embedding;
pub mod error;
pub mod exchange;
pub mod input;
pub mod model;
pub mod optim;
pub mod resource;
pub mod storage;
pub mod tensor;

pub use embedding::Embedding;
pub use error::{EmbeddingError, ErrorKind, Result};
pub use input::EmbeddingKey;
