use super::{RowBuffer, RowInitializer, RowStore};
use crate::error::{EmbeddingError, Result};
use crate::input::EmbeddingKey;
use crate::optim::{OptHyperParams, RowParts, UpdateTarget};
use std::collections::HashMap;

/// Hash-addressed table with a fixed row capacity.
#[derive(Debug, Clone)]
pub struct HashTable<K> {
    index: HashMap<K, usize>,
    keys: Vec<K>,
    rows: RowBuffer,
    capacity: usize,
    init: RowInitializer,
}

impl<K: EmbeddingKey> HashTable<K> {
    pub fn new(
        capacity: usize,
        vec_size: usize,
        hp: &OptHyperParams,
        init: RowInitializer,
    ) -> Self {
        Self {
            index: HashMap::new(),
            keys: Vec::new(),
            rows: RowBuffer::new(vec_size, hp),
            capacity,
            init,
        }
    }

    fn full(&self, requested: usize) -> EmbeddingError {
        EmbeddingError::OutOfCapacity {
            what: "embedding hash table".to_string(),
            capacity: self.capacity,
            requested,
        }
    }

    /// Removes `key`, returning its `(weight, state, updates)`.
    pub fn remove(&mut self, key: K) -> Option<(Vec<f32>, Vec<f32>, u64)> {
        let row = self.index.remove(&key)?;
        let removed = (
            self.rows.weight(row).to_vec(),
            self.rows.state(row).to_vec(),
            self.rows.updates(row),
        );
        self.rows.swap_remove(row);
        self.keys.swap_remove(row);
        if let Some(&moved) = self.keys.get(row) {
            self.index.insert(moved, row);
        }
        Some(removed)
    }
}

impl<K: EmbeddingKey> UpdateTarget for HashTable<K> {
    fn vec_size(&self) -> usize {
        self.rows.vec_size()
    }

    fn occupied_rows(&self) -> Vec<usize> {
        (0..self.rows.len()).collect()
    }

    fn row_parts_mut(&mut self, row: usize) -> Result<RowParts<'_>> {
        self.rows.parts_mut(row)
    }
}

impl<K: EmbeddingKey> RowStore<K> for HashTable<K> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn find(&self, key: K) -> Option<usize> {
        self.index.get(&key).copied()
    }

    fn find_or_insert(&mut self, key: K) -> Result<usize> {
        if let Some(&row) = self.index.get(&key) {
            return Ok(row);
        }
        if self.keys.len() >= self.capacity {
            return Err(self.full(self.keys.len() + 1));
        }
        let row = self.rows.push_fresh(&self.init, key.to_u64());
        self.keys.push(key);
        self.index.insert(key, row);
        Ok(row)
    }

    fn insert_row(&mut self, key: K, weight: &[f32], state: &[f32], updates: u64) -> Result<()> {
        let row = self.find_or_insert(key)?;
        self.rows.write(row, weight, state, updates)
    }

    fn rows(&self) -> &RowBuffer {
        &self.rows
    }

    fn entries(&self) -> Vec<(K, usize)> {
        let mut entries: Vec<_> = self.index.iter().map(|(&k, &r)| (k, r)).collect();
        entries.sort_unstable_by_key(|&(k, _)| k);
        entries
    }
}
