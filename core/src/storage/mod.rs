//! Per-GPU embedding table storage.
//!
//! A table maps keys to rows. Each row holds `vec_size` weights, the optimizer state of those
//! weights and an update counter. [`HashTable`] grows on demand up to a fixed capacity;
//! [`DirectTable`] preallocates one row per key of fixed slot ranges and addresses them
//! without hashing.

pub mod direct;
pub mod hash_table;

pub use direct::{DirectTable, SlotRange};
pub use hash_table::HashTable;

use crate::error::{EmbeddingError, Result};
use crate::input::EmbeddingKey;
use crate::optim::{init_state, OptHyperParams, RowParts, UpdateTarget};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Key-indexed row storage owned by one GPU.
pub trait RowStore<K: EmbeddingKey>: UpdateTarget + Send + Sync {
    /// Maximum number of rows.
    fn capacity(&self) -> usize;

    /// Number of occupied rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, key: K) -> Option<usize>;

    /// Returns the row of `key`, creating and initializing it if needed.
    fn find_or_insert(&mut self, key: K) -> Result<usize>;

    /// Writes a complete row, replacing any existing value.
    fn insert_row(&mut self, key: K, weight: &[f32], state: &[f32], updates: u64) -> Result<()>;

    fn rows(&self) -> &RowBuffer;

    /// Occupied `(key, row)` pairs in ascending key order.
    fn entries(&self) -> Vec<(K, usize)>;

    fn weight(&self, row: usize) -> &[f32] {
        self.rows().weight(row)
    }
}

/// Flat arrays backing a table.
#[derive(Debug, Clone)]
pub struct RowBuffer {
    vec_size: usize,
    state_len: usize,
    weights: Vec<f32>,
    state: Vec<f32>,
    updates: Vec<u64>,
    fresh_state: Vec<f32>,
}

impl RowBuffer {
    pub fn new(vec_size: usize, hp: &OptHyperParams) -> Self {
        let fresh_state = init_state(hp, vec_size);
        Self {
            vec_size,
            state_len: fresh_state.len(),
            weights: Vec::new(),
            state: Vec::new(),
            updates: Vec::new(),
            fresh_state,
        }
    }

    pub fn vec_size(&self) -> usize {
        self.vec_size
    }

    pub fn state_len(&self) -> usize {
        self.state_len
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn weight(&self, row: usize) -> &[f32] {
        &self.weights[row * self.vec_size..(row + 1) * self.vec_size]
    }

    pub fn state(&self, row: usize) -> &[f32] {
        &self.state[row * self.state_len..(row + 1) * self.state_len]
    }

    pub fn updates(&self, row: usize) -> u64 {
        self.updates[row]
    }

    /// Appends a fresh row and returns its index.
    pub(crate) fn push_fresh(&mut self, init: &RowInitializer, key: u64) -> usize {
        let row = self.len();
        let start = self.weights.len();
        self.weights.resize(start + self.vec_size, 0.0);
        init.init_row(key, &mut self.weights[start..]);
        self.state.extend_from_slice(&self.fresh_state);
        self.updates.push(0);
        row
    }

    pub(crate) fn write(
        &mut self,
        row: usize,
        weight: &[f32],
        state: &[f32],
        updates: u64,
    ) -> Result<()> {
        if weight.len() != self.vec_size || state.len() != self.state_len {
            return Err(EmbeddingError::DataCheck(format!(
                "row of {} weights and {} state values, table expects {} and {}",
                weight.len(),
                state.len(),
                self.vec_size,
                self.state_len
            )));
        }
        self.weights[row * self.vec_size..(row + 1) * self.vec_size].copy_from_slice(weight);
        self.state[row * self.state_len..(row + 1) * self.state_len].copy_from_slice(state);
        self.updates[row] = updates;
        Ok(())
    }

    /// Moves the last row into `row` and drops the last row.
    pub(crate) fn swap_remove(&mut self, row: usize) {
        let last = self.len() - 1;
        if row != last {
            let (v, s) = (self.vec_size, self.state_len);
            self.weights.copy_within(last * v..(last + 1) * v, row * v);
            self.state.copy_within(last * s..(last + 1) * s, row * s);
            self.updates[row] = self.updates[last];
        }
        self.weights.truncate(last * self.vec_size);
        self.state.truncate(last * self.state_len);
        self.updates.truncate(last);
    }

    pub(crate) fn parts_mut(&mut self, row: usize) -> Result<RowParts<'_>> {
        if row >= self.len() {
            return Err(EmbeddingError::UnspecificError(format!(
                "row {row} out of range for {} rows",
                self.len()
            )));
        }
        let (v, s) = (self.vec_size, self.state_len);
        Ok(RowParts {
            weight: &mut self.weights[row * v..(row + 1) * v],
            state: &mut self.state[row * s..(row + 1) * s],
            updates: &mut self.updates[row],
        })
    }
}

/// Deterministic initial values: the same key gets the same row on whichever GPU owns it.
#[derive(Debug, Clone, Copy)]
pub struct RowInitializer {
    seed: u64,
    bound: f32,
}

impl RowInitializer {
    /// Uniform in `[-bound, bound)`.
    pub fn uniform(seed: u64, bound: f32) -> Self {
        Self { seed, bound }
    }

    /// The default scale `1 / sqrt(vec_size)`.
    pub fn for_vec_size(seed: u64, vec_size: usize) -> Self {
        Self::uniform(seed, 1.0 / (vec_size.max(1) as f32).sqrt())
    }

    pub fn zeros() -> Self {
        Self::uniform(0, 0.0)
    }

    pub fn init_row(&self, key: u64, out: &mut [f32]) {
        if self.bound <= 0.0 {
            out.fill(0.0);
            return;
        }
        let mut rng = StdRng::seed_from_u64(self.seed ^ key.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        for v in out.iter_mut() {
            *v = rng.gen_range(-self.bound..self.bound);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initializer_deterministic_per_key() {
        let init = RowInitializer::for_vec_size(42, 16);
        let mut a = vec![0.0; 16];
        let mut b = vec![0.0; 16];
        init.init_row(5, &mut a);
        init.init_row(5, &mut b);
        assert_eq!(a, b);
        init.init_row(6, &mut b);
        assert_ne!(a, b);
        assert!(a.iter().all(|v| v.abs() <= 0.25));
    }

    #[test]
    fn test_zero_initializer() {
        let mut a = vec![1.0; 4];
        RowInitializer::zeros().init_row(9, &mut a);
        assert_eq!(a, vec![0.0; 4]);
    }

    #[test]
    fn test_swap_remove_moves_last_row() {
        let hp = OptHyperParams::default_for(crate::optim::OptimizerType::MomentumSgd);
        let mut buf = RowBuffer::new(2, &hp);
        let init = RowInitializer::zeros();
        for _ in 0..3 {
            buf.push_fresh(&init, 0);
        }
        buf.write(2, &[3.0, 3.0], &[1.0, 1.0], 7).unwrap();
        buf.swap_remove(0);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.weight(0), &[3.0, 3.0]);
        assert_eq!(buf.state(0), &[1.0, 1.0]);
        assert_eq!(buf.updates(0), 7);
    }
}
