use super::backend::{AllReduceAlgo, CollectiveBackend};
use super::ring::ring_all_reduce;
use super::stats::CommStats;
use crate::error::{EmbeddingError, Result};
use sparsectr_kernels::KernelElem;
use std::mem::size_of;
use std::ops::Range;
use tracing::debug;

/// Collectives over the GPUs simulated in this process.
#[derive(Debug)]
pub struct LocalCollective {
    world_size: usize,
    node_groups: Vec<Vec<usize>>,
    stats: CommStats,
}

impl LocalCollective {
    /// `node_groups` lists the GPU indices of each node; every node has the same count.
    pub fn new(node_groups: Vec<Vec<usize>>) -> Self {
        let world_size = node_groups.iter().map(Vec::len).sum();
        Self {
            world_size,
            node_groups,
            stats: CommStats::default(),
        }
    }

    pub fn stats(&self) -> &CommStats {
        &self.stats
    }

    fn check_participants(&self, n: usize, what: &str) -> Result<()> {
        if n != self.world_size {
            return Err(EmbeddingError::Communication(format!(
                "{what} joined by {n} of {} participants",
                self.world_size
            )));
        }
        Ok(())
    }

    fn hierarchical_all_reduce<T: KernelElem>(&self, buffers: &mut [Vec<T>]) -> Result<()> {
        let len = buffers.first().map_or(0, Vec::len);
        let local = self.node_groups.first().map_or(1, Vec::len);
        let chunk_size = len.div_ceil(local.max(1));
        let range = |r: usize| -> Range<usize> {
            let start = (r * chunk_size).min(len);
            start..(start + chunk_size).min(len)
        };

        // Intra-node reduce-scatter: local rank r of every node ends up with the node sum of
        // chunk r. Indexed [local rank][node].
        let mut chunks: Vec<Vec<Vec<T>>> = (0..local)
            .map(|r| {
                self.node_groups
                    .iter()
                    .map(|group| {
                        let mut acc = buffers[group[0]][range(r)].to_vec();
                        for &gpu in &group[1..] {
                            for (a, &b) in acc.iter_mut().zip(&buffers[gpu][range(r)]) {
                                *a += b;
                            }
                        }
                        acc
                    })
                    .collect()
            })
            .collect();

        // Inter-node all-reduce, one ring per local rank.
        for per_node in chunks.iter_mut() {
            ring_all_reduce(per_node)?;
        }

        // Intra-node all-gather.
        for (node, group) in self.node_groups.iter().enumerate() {
            for &gpu in group {
                for (r, per_node) in chunks.iter().enumerate() {
                    buffers[gpu][range(r)].copy_from_slice(&per_node[node]);
                }
            }
        }
        Ok(())
    }
}

impl CollectiveBackend for LocalCollective {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_to_all_v<T: Send>(&self, send: Vec<Vec<Vec<T>>>) -> Result<Vec<Vec<Vec<T>>>> {
        self.check_participants(send.len(), "all-to-all")?;
        let n = self.world_size;
        let mut recv: Vec<Vec<Vec<T>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
        let mut bytes = 0u64;
        for (src, row) in send.into_iter().enumerate() {
            if row.len() != n {
                return Err(EmbeddingError::Communication(format!(
                    "GPU {src} addressed {} of {n} peers in all-to-all",
                    row.len()
                )));
            }
            for (dst, part) in row.into_iter().enumerate() {
                if src != dst {
                    bytes += (part.len() * size_of::<T>()) as u64;
                }
                recv[dst].push(part);
            }
        }
        self.stats.record_all_to_all(bytes);
        debug!(bytes, "all_to_all_v");
        Ok(recv)
    }

    fn all_reduce_sum<T: KernelElem>(
        &self,
        buffers: &mut [Vec<T>],
        algo: AllReduceAlgo,
    ) -> Result<()> {
        self.check_participants(buffers.len(), "all-reduce")?;
        let len = buffers.first().map_or(0, Vec::len);
        if buffers.iter().any(|b| b.len() != len) {
            return Err(EmbeddingError::Communication(
                "all-reduce participants disagree on buffer length".to_string(),
            ));
        }
        match algo {
            AllReduceAlgo::Flat => ring_all_reduce(buffers)?,
            AllReduceAlgo::Hierarchical => self.hierarchical_all_reduce(buffers)?,
        }
        let bytes = (len * size_of::<T>() * self.world_size.saturating_sub(1)) as u64;
        self.stats.record_all_reduce(bytes);
        debug!(bytes, ?algo, "all_reduce_sum");
        Ok(())
    }

    fn all_gather<T: Clone + Send>(&self, parts: Vec<Vec<T>>) -> Result<Vec<T>> {
        self.check_participants(parts.len(), "all-gather")?;
        let total: usize = parts.iter().map(Vec::len).sum();
        let bytes = (total * size_of::<T>() * self.world_size.saturating_sub(1)) as u64;
        self.stats.record_all_gather(bytes);
        debug!(bytes, "all_gather");
        Ok(parts.into_iter().flatten().collect())
    }
}
