use crate::error::{EmbeddingError, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use sparsectr_kernels::KernelElem;
use std::ops::Range;
use std::thread;

/// One participant of a ring all-reduce.
///
/// Implements the **Ring All-Reduce** algorithm over `crossbeam` channels: a scatter-reduce
/// phase leaves every rank with one fully reduced chunk, and an all-gather phase circulates
/// the reduced chunks until every rank holds all of them.
pub struct RingPeer<T> {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Vec<T>>, // Receive from rank - 1
    right_tx: Sender<Vec<T>>,  // Send to rank + 1
}

impl<T: KernelElem> RingPeer<T> {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Vec<T>>,
        right_tx: Sender<Vec<T>>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn exchange(&self, send: Vec<T>) -> Result<Vec<T>> {
        self.right_tx.send(send).map_err(|_| {
            EmbeddingError::Communication(format!("rank {}: right neighbour left the ring", self.rank))
        })?;
        self.left_rx.recv().map_err(|_| {
            EmbeddingError::Communication(format!("rank {}: left neighbour left the ring", self.rank))
        })
    }

    fn chunk(&self, idx: isize, len: usize) -> Range<usize> {
        let world = self.world_size as isize;
        let idx = idx.rem_euclid(world) as usize;
        let chunk_size = len.div_ceil(self.world_size);
        let start = (idx * chunk_size).min(len);
        start..(start + chunk_size).min(len)
    }

    /// Sums `data` element-wise with every other rank's buffer, in place.
    pub fn all_reduce_sum(&self, data: &mut [T]) -> Result<()> {
        let len = data.len();
        let rank = self.rank as isize;

        // Phase 1: scatter-reduce. Rank r sends chunk (r - step) and accumulates chunk
        // (r - step - 1) received from the left.
        for step in 0..self.world_size.saturating_sub(1) {
            let step = step as isize;
            let send = data[self.chunk(rank - step, len)].to_vec();
            let recv = self.exchange(send)?;
            let range = self.chunk(rank - step - 1, len);
            if recv.len() != range.len() {
                return Err(EmbeddingError::Communication(format!(
                    "rank {}: ring peers disagree on buffer length",
                    self.rank
                )));
            }
            for (dst, src) in data[range].iter_mut().zip(recv) {
                *dst += src;
            }
        }

        // Phase 2: all-gather of the reduced chunks.
        for step in 0..self.world_size.saturating_sub(1) {
            let step = step as isize;
            let send = data[self.chunk(rank - step + 1, len)].to_vec();
            let recv = self.exchange(send)?;
            let range = self.chunk(rank - step, len);
            if recv.len() != range.len() {
                return Err(EmbeddingError::Communication(format!(
                    "rank {}: ring peers disagree on buffer length",
                    self.rank
                )));
            }
            data[range].copy_from_slice(&recv);
        }
        Ok(())
    }
}

/// Wires `world_size` peers into a ring: 0 -> 1 -> ... -> world_size - 1 -> 0.
pub fn ring<T: KernelElem>(world_size: usize) -> Vec<RingPeer<T>> {
    // Channel i connects rank i to rank i + 1.
    let (mut txs, mut rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| bounded(1)).unzip();
    rxs.rotate_right(1);
    txs.drain(..)
        .zip(rxs.drain(..))
        .enumerate()
        .map(|(rank, (right_tx, left_rx))| RingPeer::new(rank, world_size, left_rx, right_tx))
        .collect()
}

/// Runs a ring all-reduce over `buffers`, one thread per participant.
pub fn ring_all_reduce<T: KernelElem>(buffers: &mut [Vec<T>]) -> Result<()> {
    if buffers.len() <= 1 {
        return Ok(());
    }
    let len = buffers[0].len();
    if buffers.iter().any(|b| b.len() != len) {
        return Err(EmbeddingError::Communication(
            "all-reduce participants disagree on buffer length".to_string(),
        ));
    }
    let peers = ring::<T>(buffers.len());
    thread::scope(|s| {
        let handles: Vec<_> = peers
            .into_iter()
            .zip(buffers.iter_mut())
            .map(|(peer, buf)| s.spawn(move || peer.all_reduce_sum(buf)))
            .collect();
        let mut result = Ok(());
        for handle in handles {
            let outcome = handle.join().unwrap_or_else(|_| {
                Err(EmbeddingError::Communication(
                    "ring participant panicked".to_string(),
                ))
            });
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    })
}
