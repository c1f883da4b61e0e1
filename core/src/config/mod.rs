//! Declarative configuration of sparse embeddings.
//!
//! A [`SparseEmbedding`] is the validated form of one `"type": "...SparseEmbedding..."` entry of
//! the model JSON. It can be parsed with [`SparseEmbedding::from_json`] or built directly with
//! [`SparseEmbedding::new`] and the `with_*` setters.

mod json;
pub mod solver;

pub use solver::SolverConfig;

use crate::error::{EmbeddingError, Result};
use crate::optim::OptParams;
pub use sparsectr_kernels::Combiner;
use std::fmt;
use std::str::FromStr;

/// Largest supported embedding vector width.
pub const MAX_EMBEDDING_VEC_SIZE: usize = 1024;

/// Vector widths that are not a multiple of this leave GPU lanes idle.
pub const PREFERRED_VEC_SIZE_MULTIPLE: usize = 32;

/// The four embedding variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddingType {
    DistributedSlotSparseEmbeddingHash,
    LocalizedSlotSparseEmbeddingHash,
    LocalizedSlotSparseEmbeddingOneHot,
    HybridSparseEmbedding,
}

impl EmbeddingType {
    pub const ALL: [EmbeddingType; 4] = [
        EmbeddingType::DistributedSlotSparseEmbeddingHash,
        EmbeddingType::LocalizedSlotSparseEmbeddingHash,
        EmbeddingType::LocalizedSlotSparseEmbeddingOneHot,
        EmbeddingType::HybridSparseEmbedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingType::DistributedSlotSparseEmbeddingHash => {
                "DistributedSlotSparseEmbeddingHash"
            }
            EmbeddingType::LocalizedSlotSparseEmbeddingHash => "LocalizedSlotSparseEmbeddingHash",
            EmbeddingType::LocalizedSlotSparseEmbeddingOneHot => {
                "LocalizedSlotSparseEmbeddingOneHot"
            }
            EmbeddingType::HybridSparseEmbedding => "HybridSparseEmbedding",
        }
    }
}

impl fmt::Display for EmbeddingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingType {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        EmbeddingType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EmbeddingError::wrong_input(format!("No such embedding type: {s}")))
    }
}

pub fn parse_combiner(s: &str) -> Result<Combiner> {
    match s {
        "sum" => Ok(Combiner::Sum),
        "mean" => Ok(Combiner::Mean),
        other => Err(EmbeddingError::wrong_input(format!(
            "No such combiner type: {other}"
        ))),
    }
}

/// How the hybrid embedding all-reduces its frequent-category gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationType {
    /// Intra-node reduction over NVLink, then inter-node all-reduce over IB.
    IbNvlink,
    /// Same two-level reduction, with the inter-node stage split per local rank.
    IbNvlinkHier,
    /// One flat all-reduce; only valid when every GPU sits in one node.
    NvlinkSingleNode,
}

impl CommunicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommunicationType::IbNvlink => "IB_NVLink",
            CommunicationType::IbNvlinkHier => "IB_NVLink_Hierarchical",
            CommunicationType::NvlinkSingleNode => "NVLink_SingleNode",
        }
    }
}

impl FromStr for CommunicationType {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IB_NVLink" => Ok(CommunicationType::IbNvlink),
            "IB_NVLink_Hierarchical" => Ok(CommunicationType::IbNvlinkHier),
            "NVLink_SingleNode" => Ok(CommunicationType::NvlinkSingleNode),
            other => Err(EmbeddingError::wrong_input(format!(
                "No such communication type: {other}"
            ))),
        }
    }
}

impl fmt::Display for CommunicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HybridEmbeddingType {
    Distributed,
}

impl FromStr for HybridEmbeddingType {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Distributed" => Ok(HybridEmbeddingType::Distributed),
            other => Err(EmbeddingError::wrong_input(format!(
                "No such hybrid embedding type: {other}"
            ))),
        }
    }
}

/// Parameters used only by the hybrid variant to split categories into frequent and
/// infrequent sets.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridEmbeddingParam {
    pub max_num_frequent_categories: usize,
    /// Negative means unbounded.
    pub max_num_infrequent_samples: i64,
    pub p_dup_max: f64,
    pub max_all_reduce_bandwidth: f64,
    pub max_all_to_all_bandwidth: f64,
    pub efficiency_bandwidth_ratio: f64,
    pub communication_type: CommunicationType,
    pub hybrid_embedding_type: HybridEmbeddingType,
}

impl Default for HybridEmbeddingParam {
    fn default() -> Self {
        Self {
            max_num_frequent_categories: 1,
            max_num_infrequent_samples: -1,
            p_dup_max: 1.0 / 100.0,
            max_all_reduce_bandwidth: 1.3e11,
            max_all_to_all_bandwidth: 1.9e11,
            efficiency_bandwidth_ratio: 1.0,
            communication_type: CommunicationType::IbNvlink,
            hybrid_embedding_type: HybridEmbeddingType::Distributed,
        }
    }
}

impl HybridEmbeddingParam {
    /// Average occurrences per iteration above which replicating a category (one all-reduce of
    /// its row) is cheaper than shipping each occurrence through the all-to-all.
    pub fn frequency_threshold(&self) -> f64 {
        self.efficiency_bandwidth_ratio * 2.0 * self.max_all_to_all_bandwidth
            / self.max_all_reduce_bandwidth
    }

    /// Capacity of the frequent set: `max_num_frequent_categories` per sample of the larger of
    /// the train and evaluate batches.
    pub fn frequent_capacity(&self, batch_size: usize, batch_size_eval: usize) -> Result<usize> {
        self.max_num_frequent_categories
            .checked_mul(batch_size.max(batch_size_eval))
            .ok_or_else(|| {
                EmbeddingError::wrong_input(format!(
                    "max_num_frequent_categories({}) times batch size overflows",
                    self.max_num_frequent_categories
                ))
            })
    }

    pub fn infrequent_sample_limit(&self) -> Option<usize> {
        usize::try_from(self.max_num_infrequent_samples).ok()
    }

    fn validate(&self) -> Result<()> {
        if !(self.p_dup_max > 0.0 && self.p_dup_max <= 1.0) {
            return Err(EmbeddingError::wrong_input(format!(
                "p_dup_max({}) must be in (0, 1]",
                self.p_dup_max
            )));
        }
        if !(self.max_all_reduce_bandwidth > 0.0 && self.max_all_to_all_bandwidth > 0.0) {
            return Err(EmbeddingError::wrong_input(
                "hybrid bandwidth estimates must be positive",
            ));
        }
        if !(self.efficiency_bandwidth_ratio > 0.0) {
            return Err(EmbeddingError::wrong_input(
                "efficiency_bandwidth_ratio must be positive",
            ));
        }
        Ok(())
    }
}

/// Non-fatal advisory produced while validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    VecSizeNotAligned { embedding_vec_size: usize },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::VecSizeNotAligned { embedding_vec_size } => write!(
                f,
                "Embedding vector size({embedding_vec_size}) is not a multiple of \
                 {PREFERRED_VEC_SIZE_MULTIPLE}, which may affect the GPU resource utilization."
            ),
        }
    }
}

/// One declared sparse embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseEmbedding {
    pub embedding_type: EmbeddingType,
    pub workspace_size_per_gpu_in_mb: usize,
    pub max_vocabulary_size_per_gpu: usize,
    pub embedding_vec_size: usize,
    pub combiner: Combiner,
    /// Name of the produced (top) tensor.
    pub sparse_embedding_name: String,
    /// Name of the consumed sparse input.
    pub bottom_name: String,
    pub slot_size_array: Vec<usize>,
    /// `None` falls back to the graph-wide embedding optimizer.
    pub embedding_opt_params: Option<OptParams>,
    pub hybrid_embedding_param: HybridEmbeddingParam,
}

impl SparseEmbedding {
    pub fn new(
        embedding_type: EmbeddingType,
        bottom_name: impl Into<String>,
        top_name: impl Into<String>,
        embedding_vec_size: usize,
        combiner: Combiner,
    ) -> Self {
        Self {
            embedding_type,
            workspace_size_per_gpu_in_mb: 0,
            max_vocabulary_size_per_gpu: 0,
            embedding_vec_size,
            combiner,
            sparse_embedding_name: top_name.into(),
            bottom_name: bottom_name.into(),
            slot_size_array: Vec::new(),
            embedding_opt_params: None,
            hybrid_embedding_param: HybridEmbeddingParam::default(),
        }
    }

    /// An overflowing workspace leaves the vocabulary at zero and is reported by `validate`.
    pub fn with_workspace_size_per_gpu_in_mb(mut self, mb: usize) -> Self {
        self.workspace_size_per_gpu_in_mb = mb;
        self.max_vocabulary_size_per_gpu =
            vocabulary_from_workspace(mb, self.embedding_vec_size).unwrap_or(0);
        self
    }

    pub fn with_slot_size_array(mut self, slot_size_array: Vec<usize>) -> Self {
        self.slot_size_array = slot_size_array;
        self
    }

    pub fn with_optimizer(mut self, opt_params: OptParams) -> Self {
        self.embedding_opt_params = Some(opt_params);
        self
    }

    pub fn with_hybrid_param(mut self, param: HybridEmbeddingParam) -> Self {
        self.hybrid_embedding_param = param;
        self
    }

    /// Parses one embedding entry of the model JSON.
    pub fn from_json(j: &serde_json::Value) -> Result<Self> {
        json::sparse_embedding_from_json(j)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(s)?;
        Self::from_json(&value)
    }

    /// Checks the invariants every variant relies on.
    ///
    /// Returns the non-fatal advisories; the caller decides where they are reported.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>> {
        if self.workspace_size_per_gpu_in_mb == 0 && self.slot_size_array.is_empty() {
            return Err(EmbeddingError::wrong_input(
                "need workspace_size_per_gpu_in_mb or slot_size_array",
            ));
        }
        if self.embedding_vec_size == 0 || self.embedding_vec_size > MAX_EMBEDDING_VEC_SIZE {
            return Err(EmbeddingError::wrong_input(format!(
                "Embedding vector size({}) is invalid. It cannot be zero nor exceed {}.",
                self.embedding_vec_size, MAX_EMBEDDING_VEC_SIZE
            )));
        }
        vocabulary_from_workspace(self.workspace_size_per_gpu_in_mb, self.embedding_vec_size)?;
        if self.slot_size_array.iter().any(|&s| s == 0) {
            return Err(EmbeddingError::wrong_input(
                "slot_size_array entries must be positive",
            ));
        }
        if self.embedding_type == EmbeddingType::LocalizedSlotSparseEmbeddingOneHot
            && self.slot_size_array.is_empty()
        {
            return Err(EmbeddingError::wrong_input(
                "LocalizedSlotSparseEmbeddingOneHot requires slot_size_array",
            ));
        }
        if self.sparse_embedding_name.is_empty() || self.bottom_name.is_empty() {
            return Err(EmbeddingError::wrong_input(
                "sparse embedding needs non-empty top and bottom names",
            ));
        }
        if let Some(opt) = &self.embedding_opt_params {
            opt.validate()?;
        }
        if self.embedding_type == EmbeddingType::HybridSparseEmbedding {
            self.hybrid_embedding_param.validate()?;
        }

        let mut warnings = Vec::new();
        if self.embedding_vec_size % PREFERRED_VEC_SIZE_MULTIPLE != 0 {
            warnings.push(ConfigWarning::VecSizeNotAligned {
                embedding_vec_size: self.embedding_vec_size,
            });
        }
        Ok(warnings)
    }
}

/// Rows of `embedding_vec_size` f32 values that fit in `mb` megabytes.
pub fn vocabulary_from_workspace(mb: usize, embedding_vec_size: usize) -> Result<usize> {
    if embedding_vec_size == 0 {
        return Ok(0);
    }
    let bytes = mb.checked_mul(1024 * 1024).ok_or_else(|| {
        EmbeddingError::wrong_input(format!(
            "workspace_size_per_gpu_in_mb({mb}) overflows the addressable size"
        ))
    })?;
    Ok(bytes / (std::mem::size_of::<f32>() * embedding_vec_size))
}
