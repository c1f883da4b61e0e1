use super::rules::apply_update;
use super::{OptParams, UpdateType};
use crate::error::{EmbeddingError, Result};
use std::collections::HashSet;

/// Mutable view of one stored row.
pub struct RowParts<'a> {
    pub weight: &'a mut [f32],
    pub state: &'a mut [f32],
    /// Number of non-zero gradients this row has received.
    pub updates: &'a mut u64,
}

/// Storage the engine can update in place.
pub trait UpdateTarget {
    fn vec_size(&self) -> usize;

    /// Rows that currently hold a value.
    fn occupied_rows(&self) -> Vec<usize>;

    fn row_parts_mut(&mut self, row: usize) -> Result<RowParts<'_>>;
}

/// Applies one embedding's optimizer to its tables.
///
/// The engine is the only writer of table rows during a step. It holds the global step counter
/// shared by every GPU-local table of the embedding.
#[derive(Debug, Clone)]
pub struct OptimizerEngine {
    params: OptParams,
    step: u64,
}

impl OptimizerEngine {
    pub fn new(params: OptParams) -> Self {
        Self { params, step: 0 }
    }

    pub fn params(&self) -> &OptParams {
        &self.params
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    /// Starts a new update step. Called once per training iteration, before any `apply`.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// Updates `rows` of `target` with the matching `vec_size` slices of `grads`.
    ///
    /// Rows must be unique unless the optimizer is SGD with `atomic_update`, in which case
    /// duplicate contributions are applied one after another. An all-zero gradient runs the
    /// rule but does not count as an update of the row.
    pub fn apply<T: UpdateTarget + ?Sized>(
        &self,
        target: &mut T,
        rows: &[usize],
        grads: &[f32],
        lr: f32,
    ) -> Result<()> {
        let vec_size = target.vec_size();
        if grads.len() != rows.len() * vec_size {
            return Err(EmbeddingError::UnspecificError(format!(
                "gradient buffer holds {} values for {} rows of width {}",
                grads.len(),
                rows.len(),
                vec_size
            )));
        }
        let hp = &self.params.hyperparams;
        let scaler = self.params.scaler;

        let mut touched = HashSet::with_capacity(rows.len());
        for &row in rows {
            if !touched.insert(row) && !hp.allows_duplicate_rows() {
                return Err(EmbeddingError::UnspecificError(format!(
                    "row {row} appears twice in a pre-aggregated {} update",
                    hp.optimizer_type()
                )));
            }
        }

        for (&row, grad) in rows.iter().zip(grads.chunks_exact(vec_size)) {
            let parts = target.row_parts_mut(row)?;
            if grad.iter().any(|g| *g != 0.0) {
                *parts.updates += 1;
            }
            let step = match self.params.update_type {
                UpdateType::Local => *parts.updates,
                UpdateType::Global | UpdateType::LazyGlobal => self.step,
            };
            apply_update(hp, lr, scaler, step, parts.weight, parts.state, grad);
        }

        if self.params.update_type == UpdateType::Global {
            let zeros = vec![0.0f32; vec_size];
            for row in target.occupied_rows() {
                if touched.contains(&row) {
                    continue;
                }
                let parts = target.row_parts_mut(row)?;
                apply_update(hp, lr, scaler, self.step, parts.weight, parts.state, &zeros);
            }
        }
        Ok(())
    }
}
