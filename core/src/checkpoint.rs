//! Table snapshots and their `safetensors` encoding.
//!
//! A [`TableSnapshot`] is the key -> vector form of an embedding table that an external
//! parameter server can restore from. Rows carry their optimizer state so training can resume.

use crate::error::{EmbeddingError, Result};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// All rows of one embedding, in ascending key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub vec_size: usize,
    pub state_len: usize,
    /// Optimizer step counter at the time of the dump.
    pub step: u64,
    pub keys: Vec<u64>,
    /// Slot of every key. Empty unless the table is slot-localized.
    pub slots: Vec<u32>,
    pub weights: Vec<f32>,
    pub state: Vec<f32>,
    pub updates: Vec<u64>,
}

/// One row of a [`TableSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotRow<'a> {
    pub key: u64,
    pub slot: Option<usize>,
    pub weight: &'a [f32],
    pub state: &'a [f32],
    pub updates: u64,
}

impl TableSnapshot {
    pub fn new(vec_size: usize, state_len: usize, step: u64) -> Self {
        Self {
            vec_size,
            state_len,
            step,
            keys: Vec::new(),
            slots: Vec::new(),
            weights: Vec::new(),
            state: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn push(&mut self, key: u64, slot: Option<usize>, weight: &[f32], state: &[f32], updates: u64) {
        self.keys.push(key);
        if let Some(slot) = slot {
            self.slots.push(slot as u32);
        }
        self.weights.extend_from_slice(weight);
        self.state.extend_from_slice(state);
        self.updates.push(updates);
    }

    pub fn row(&self, i: usize) -> SnapshotRow<'_> {
        SnapshotRow {
            key: self.keys[i],
            slot: self.slots.get(i).map(|&s| s as usize),
            weight: &self.weights[i * self.vec_size..(i + 1) * self.vec_size],
            state: &self.state[i * self.state_len..(i + 1) * self.state_len],
            updates: self.updates[i],
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = SnapshotRow<'_>> {
        (0..self.len()).map(|i| self.row(i))
    }

    /// Reorders rows by ascending key.
    pub fn sort_by_key(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by_key(|&i| self.keys[i]);
        let mut sorted = TableSnapshot::new(self.vec_size, self.state_len, self.step);
        for i in order {
            let r = self.row(i);
            sorted.push(r.key, r.slot, r.weight, r.state, r.updates);
        }
        *self = sorted;
    }

    /// Checks that every array has the length the header implies.
    pub fn validate(&self) -> Result<()> {
        let n = self.len();
        let ok = self.weights.len() == n * self.vec_size
            && self.state.len() == n * self.state_len
            && self.updates.len() == n
            && (self.slots.is_empty() || self.slots.len() == n);
        if !ok {
            return Err(EmbeddingError::DataCheck(format!(
                "snapshot arrays do not match {n} rows of width {} with {} state values",
                self.vec_size, self.state_len
            )));
        }
        Ok(())
    }
}

fn le_bytes<const N: usize, T>(values: &[T], to: impl Fn(&T) -> [u8; N]) -> Vec<u8> {
    values.iter().flat_map(to).collect()
}

fn from_le<const N: usize, T>(bytes: &[u8], from: impl Fn([u8; N]) -> T) -> Vec<T> {
    bytes
        .chunks_exact(N)
        .map(|c| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(c);
            from(buf)
        })
        .collect()
}

fn st_err(context: &str) -> impl Fn(safetensors::SafeTensorError) -> EmbeddingError + '_ {
    move |e| EmbeddingError::Checkpoint(format!("{context}: {e:?}"))
}

/// Writes `snapshot` to a safetensors file.
pub fn save_snapshot<P: AsRef<Path>>(path: P, snapshot: &TableSnapshot) -> Result<()> {
    snapshot.validate()?;
    let n = snapshot.len();
    let buffers: Vec<(&str, Dtype, Vec<usize>, Vec<u8>)> = vec![
        ("keys", Dtype::U64, vec![n], le_bytes(&snapshot.keys, |v| v.to_le_bytes())),
        (
            "slots",
            Dtype::U32,
            vec![snapshot.slots.len()],
            le_bytes(&snapshot.slots, |v| v.to_le_bytes()),
        ),
        (
            "weights",
            Dtype::F32,
            vec![n, snapshot.vec_size],
            le_bytes(&snapshot.weights, |v| v.to_le_bytes()),
        ),
        (
            "state",
            Dtype::F32,
            vec![n, snapshot.state_len],
            le_bytes(&snapshot.state, |v| v.to_le_bytes()),
        ),
        ("updates", Dtype::U64, vec![n], le_bytes(&snapshot.updates, |v| v.to_le_bytes())),
    ];

    let mut views = HashMap::new();
    for (name, dtype, shape, bytes) in &buffers {
        let view = TensorView::new(*dtype, shape.clone(), bytes).map_err(st_err(name))?;
        views.insert(name.to_string(), view);
    }

    let metadata: HashMap<String, String> = [
        ("vec_size".to_string(), snapshot.vec_size.to_string()),
        ("state_len".to_string(), snapshot.state_len.to_string()),
        ("step".to_string(), snapshot.step.to_string()),
    ]
    .into_iter()
    .collect();
    safetensors::serialize_to_file(&views, &Some(metadata), path.as_ref())
        .map_err(st_err("failed to save snapshot"))?;
    Ok(())
}

/// Reads a snapshot written by [`save_snapshot`].
pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<TableSnapshot> {
    let file_content = std::fs::read(path)?;
    let (_, header) =
        SafeTensors::read_metadata(&file_content).map_err(st_err("failed to read header"))?;
    let meta = header.metadata().clone().unwrap_or_default();
    let field = |name: &str| -> Result<u64> {
        meta.get(name)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| EmbeddingError::Checkpoint(format!("missing metadata field {name}")))
    };
    let vec_size = field("vec_size")? as usize;
    let state_len = field("state_len")? as usize;
    let step = field("step")?;

    let tensors =
        SafeTensors::deserialize(&file_content).map_err(st_err("failed to deserialize"))?;
    let bytes = |name: &str, dtype: Dtype| -> Result<Vec<u8>> {
        let view = tensors.tensor(name).map_err(st_err(name))?;
        if view.dtype() != dtype {
            return Err(EmbeddingError::Checkpoint(format!(
                "tensor {name} has dtype {:?}, expected {dtype:?}",
                view.dtype()
            )));
        }
        Ok(view.data().to_vec())
    };

    let snapshot = TableSnapshot {
        vec_size,
        state_len,
        step,
        keys: from_le(&bytes("keys", Dtype::U64)?, u64::from_le_bytes),
        slots: from_le(&bytes("slots", Dtype::U32)?, u32::from_le_bytes),
        weights: from_le(&bytes("weights", Dtype::F32)?, f32::from_le_bytes),
        state: from_le(&bytes("state", Dtype::F32)?, f32::from_le_bytes),
        updates: from_le(&bytes("updates", Dtype::U64)?, u64::from_le_bytes),
    };
    snapshot.validate()?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_and_rows() {
        let mut s = TableSnapshot::new(2, 0, 3);
        s.push(9, None, &[9.0, 9.0], &[], 1);
        s.push(2, None, &[2.0, 2.0], &[], 4);
        s.sort_by_key();
        assert_eq!(s.keys, vec![2, 9]);
        let r = s.row(1);
        assert_eq!(r.weight, &[9.0, 9.0]);
        assert_eq!(r.updates, 1);
        assert_eq!(r.slot, None);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_ragged_arrays() {
        let mut s = TableSnapshot::new(2, 0, 0);
        s.push(1, None, &[1.0, 1.0], &[], 0);
        s.weights.pop();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_json_form() {
        let mut s = TableSnapshot::new(1, 1, 0);
        s.push(4, Some(2), &[0.5], &[0.1], 2);
        let text = serde_json::to_string(&s).unwrap();
        let back: TableSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
    }
}
