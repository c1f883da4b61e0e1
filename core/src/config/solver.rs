//! Graph-wide settings shared by every embedding of a model.

use crate::error::{EmbeddingError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Global training batch size, split evenly across GPUs.
    pub batch_size: usize,
    /// Global evaluation batch size, split evenly across GPUs.
    pub batch_size_eval: usize,
    /// Fuse every hybrid embedding's frequent gradients into one all-reduce.
    pub grouped_all_reduce: bool,
    /// Length of the hybrid statistics window, in training iterations.
    pub num_iterations_statistics: usize,
    /// Iterations between periodic hybrid reclassifications; 0 disables them.
    pub reclassify_interval: usize,
    /// Seed for embedding row initialization.
    pub seed: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            batch_size: 2048,
            batch_size_eval: 2048,
            grouped_all_reduce: false,
            num_iterations_statistics: 20,
            reclassify_interval: 0,
            seed: 0,
        }
    }
}

impl SolverConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: SolverConfig = serde_json::from_str(s)?;
        Ok(cfg)
    }

    /// Per-GPU `(train, evaluate)` batch sizes.
    pub fn batch_size_per_gpu(&self, num_gpus: usize) -> Result<(usize, usize)> {
        if num_gpus == 0 {
            return Err(EmbeddingError::wrong_input("no GPU available"));
        }
        for (name, size) in [
            ("batch_size", self.batch_size),
            ("batch_size_eval", self.batch_size_eval),
        ] {
            if size == 0 || size % num_gpus != 0 {
                return Err(EmbeddingError::wrong_input(format!(
                    "{name}({size}) must be a positive multiple of the GPU count({num_gpus})"
                )));
            }
        }
        Ok((
            self.batch_size / num_gpus,
            self.batch_size_eval / num_gpus,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = SolverConfig::from_json_str(r#"{ "batch_size": 64, "grouped_all_reduce": true }"#)
            .unwrap();
        assert_eq!(cfg.batch_size, 64);
        assert!(cfg.grouped_all_reduce);
        assert_eq!(cfg.batch_size_eval, 2048);
        assert_eq!(cfg.num_iterations_statistics, 20);
    }

    #[test]
    fn test_batch_split() {
        let cfg = SolverConfig {
            batch_size: 8,
            batch_size_eval: 4,
            ..Default::default()
        };
        assert_eq!(cfg.batch_size_per_gpu(4).unwrap(), (2, 1));
        assert!(cfg.batch_size_per_gpu(3).is_err());
        assert!(cfg.batch_size_per_gpu(0).is_err());
    }
}
