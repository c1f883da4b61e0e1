//! Process and device topology.
//!
//! Every device listed in the topology is simulated inside this process, so "local" GPU
//! indices `0..local_gpu_count()` enumerate all GPUs of all nodes, node by node.

use crate::distributed::{CommStats, LocalCollective};
use crate::error::{EmbeddingError, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Placement of one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuResource {
    /// Index into every per-GPU array of the core.
    pub local_id: usize,
    /// Rank in the global communicator.
    pub global_id: usize,
    /// Physical device ordinal on its node.
    pub device_id: usize,
    pub node_id: usize,
    /// Position inside its node.
    pub local_rank: usize,
}

/// Topology handed to every embedding at construction.
#[derive(Debug)]
pub struct ResourceManager {
    gpus: Vec<GpuResource>,
    node_groups: Vec<Vec<usize>>,
    seed: u64,
    collective: LocalCollective,
}

impl ResourceManager {
    /// Builds the topology from device ids per node, e.g. `[[0, 1], [0, 1]]` for two nodes with
    /// two GPUs each.
    pub fn new(vvgpu: Vec<Vec<usize>>, seed: u64) -> Result<Arc<Self>> {
        if vvgpu.is_empty() || vvgpu.iter().any(|node| node.is_empty()) {
            return Err(EmbeddingError::wrong_input(
                "every node needs at least one GPU",
            ));
        }
        let per_node = vvgpu[0].len();
        if vvgpu.iter().any(|node| node.len() != per_node) {
            return Err(EmbeddingError::wrong_input(
                "every node must have the same number of GPUs",
            ));
        }
        let mut gpus = Vec::with_capacity(vvgpu.len() * per_node);
        let mut node_groups = Vec::with_capacity(vvgpu.len());
        for (node_id, devices) in vvgpu.iter().enumerate() {
            let mut seen = HashSet::new();
            let mut group = Vec::with_capacity(devices.len());
            for (local_rank, &device_id) in devices.iter().enumerate() {
                if !seen.insert(device_id) {
                    return Err(EmbeddingError::wrong_input(format!(
                        "device {device_id} listed twice on node {node_id}"
                    )));
                }
                let id = gpus.len();
                gpus.push(GpuResource {
                    local_id: id,
                    global_id: id,
                    device_id,
                    node_id,
                    local_rank,
                });
                group.push(id);
            }
            node_groups.push(group);
        }
        info!(
            nodes = node_groups.len(),
            gpus = gpus.len(),
            "resource manager initialized"
        );
        let collective = LocalCollective::new(node_groups.clone());
        Ok(Arc::new(Self {
            gpus,
            node_groups,
            seed,
            collective,
        }))
    }

    /// One node with devices `0..num_gpus`.
    pub fn single_node(num_gpus: usize, seed: u64) -> Result<Arc<Self>> {
        Self::new(vec![(0..num_gpus).collect()], seed)
    }

    pub fn local_gpu_count(&self) -> usize {
        self.gpus.len()
    }

    pub fn gpu(&self, local_id: usize) -> Result<&GpuResource> {
        self.gpus.get(local_id).ok_or_else(|| {
            EmbeddingError::IllegalCall(format!(
                "GPU {local_id} out of range for {} GPUs",
                self.gpus.len()
            ))
        })
    }

    pub fn gpus(&self) -> &[GpuResource] {
        &self.gpus
    }

    /// Local GPU indices grouped by node.
    pub fn node_groups(&self) -> &[Vec<usize>] {
        &self.node_groups
    }

    pub fn num_nodes(&self) -> usize {
        self.node_groups.len()
    }

    pub fn gpus_per_node(&self) -> usize {
        self.node_groups.first().map_or(0, Vec::len)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn collective(&self) -> &LocalCollective {
        &self.collective
    }

    pub fn comm_stats(&self) -> &CommStats {
        self.collective.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_nodes() {
        let rm = ResourceManager::new(vec![vec![0, 1], vec![2, 3]], 7).unwrap();
        assert_eq!(rm.local_gpu_count(), 4);
        assert_eq!(rm.num_nodes(), 2);
        assert_eq!(rm.gpus_per_node(), 2);
        let g = rm.gpu(3).unwrap();
        assert_eq!((g.node_id, g.local_rank, g.device_id), (1, 1, 3));
        assert_eq!(rm.node_groups(), &[vec![0, 1], vec![2, 3]]);
        assert!(rm.gpu(4).is_err());
        assert_eq!(rm.seed(), 7);
    }

    #[test]
    fn test_rejects_bad_topology() {
        assert!(ResourceManager::new(vec![], 0).is_err());
        assert!(ResourceManager::new(vec![vec![0], vec![]], 0).is_err());
        assert!(ResourceManager::new(vec![vec![0, 1], vec![0]], 0).is_err());
        assert!(ResourceManager::new(vec![vec![0, 0]], 0).is_err());
    }
}
