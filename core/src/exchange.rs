//! Weight-gradient exchange buffers shared by hybrid embeddings.
//!
//! Every contributor registers a slot of the buffer at construction. The first write or
//! all-reduce seals the layout; registering afterwards is an [`IllegalCall`] because the fused
//! buffer of every GPU has already been sized.
//!
//! [`IllegalCall`]: crate::error::EmbeddingError::IllegalCall

use crate::distributed::{AllReduceAlgo, CollectiveBackend};
use crate::error::{EmbeddingError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// How the slots are all-reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeMode {
    /// One fused all-reduce over every slot.
    Grouped,
    /// Each slot is all-reduced on its own.
    PerNetwork,
}

/// Handle to a registered slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeSlot(usize);

#[derive(Debug)]
struct SlotLayout {
    name: String,
    offset: usize,
    len: usize,
    algo: AllReduceAlgo,
    pending: bool,
}

#[derive(Debug)]
struct Inner {
    sealed: bool,
    slots: Vec<SlotLayout>,
    buffers: Vec<Vec<f32>>,
}

#[derive(Debug)]
pub struct ExchangeWgrad {
    mode: ExchangeMode,
    num_gpus: usize,
    inner: Mutex<Inner>,
}

impl ExchangeWgrad {
    pub fn new(mode: ExchangeMode, num_gpus: usize) -> Arc<Self> {
        Arc::new(Self {
            mode,
            num_gpus,
            inner: Mutex::new(Inner {
                sealed: false,
                slots: Vec::new(),
                buffers: vec![Vec::new(); num_gpus],
            }),
        })
    }

    pub fn mode(&self) -> ExchangeMode {
        self.mode
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    pub fn num_slots(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Reserves `len` values per GPU for contributor `name`.
    pub fn register(
        &self,
        name: impl Into<String>,
        len: usize,
        algo: AllReduceAlgo,
    ) -> Result<ExchangeSlot> {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.sealed {
            return Err(EmbeddingError::IllegalCall(format!(
                "cannot register {name}: exchange buffer already finalized"
            )));
        }
        if self.mode == ExchangeMode::Grouped {
            if let Some(first) = inner.slots.first() {
                if first.algo != algo {
                    return Err(EmbeddingError::wrong_input(format!(
                        "{name} uses {algo:?} all-reduce but the grouped buffer uses {:?}",
                        first.algo
                    )));
                }
            }
        }
        let offset = inner.slots.last().map_or(0, |s| s.offset + s.len);
        inner.slots.push(SlotLayout {
            name,
            offset,
            len,
            algo,
            pending: false,
        });
        Ok(ExchangeSlot(inner.slots.len() - 1))
    }

    /// Finalizes the layout and allocates the per-GPU buffers. Idempotent.
    pub fn seal(&self) {
        let mut inner = self.inner.lock();
        Self::seal_locked(&mut inner);
    }

    fn seal_locked(inner: &mut Inner) {
        if inner.sealed {
            return;
        }
        let total = inner.slots.last().map_or(0, |s| s.offset + s.len);
        for buf in inner.buffers.iter_mut() {
            *buf = vec![0.0; total];
        }
        inner.sealed = true;
        info!(
            slots = inner.slots.len(),
            values_per_gpu = total,
            "exchange buffer finalized"
        );
    }

    fn layout<'a>(inner: &'a Inner, slot: ExchangeSlot) -> Result<&'a SlotLayout> {
        inner.slots.get(slot.0).ok_or_else(|| {
            EmbeddingError::UnspecificError(format!("unknown exchange slot {}", slot.0))
        })
    }

    fn check_gpu(&self, gpu: usize) -> Result<()> {
        if gpu >= self.num_gpus {
            return Err(EmbeddingError::IllegalCall(format!(
                "GPU {gpu} out of range for {} GPUs",
                self.num_gpus
            )));
        }
        Ok(())
    }

    /// Overwrites GPU `gpu`'s part of `slot`.
    pub fn write(&self, slot: ExchangeSlot, gpu: usize, data: &[f32]) -> Result<()> {
        self.check_gpu(gpu)?;
        let mut inner = self.inner.lock();
        Self::seal_locked(&mut inner);
        let (offset, len) = {
            let l = Self::layout(&inner, slot)?;
            (l.offset, l.len)
        };
        if data.len() != len {
            return Err(EmbeddingError::UnspecificError(format!(
                "exchange slot holds {len} values, got {}",
                data.len()
            )));
        }
        inner.buffers[gpu][offset..offset + len].copy_from_slice(data);
        inner.slots[slot.0].pending = true;
        Ok(())
    }

    pub fn read(&self, slot: ExchangeSlot, gpu: usize) -> Result<Vec<f32>> {
        self.check_gpu(gpu)?;
        let inner = self.inner.lock();
        if !inner.sealed {
            return Err(EmbeddingError::IllegalCall(
                "exchange buffer read before it was finalized".to_string(),
            ));
        }
        let l = Self::layout(&inner, slot)?;
        Ok(inner.buffers[gpu][l.offset..l.offset + l.len].to_vec())
    }

    /// Whether `slot` was written since its last all-reduce.
    pub fn is_pending(&self, slot: ExchangeSlot) -> bool {
        self.inner
            .lock()
            .slots
            .get(slot.0)
            .is_some_and(|s| s.pending)
    }

    /// All-reduces every pending slot: one fused collective in grouped mode, one per slot
    /// otherwise.
    pub fn all_reduce<B: CollectiveBackend>(&self, backend: &B) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::seal_locked(&mut inner);
        if !inner.slots.iter().any(|s| s.pending) {
            return Ok(());
        }
        match self.mode {
            ExchangeMode::Grouped => Self::reduce_all_locked(&mut inner, backend),
            ExchangeMode::PerNetwork => {
                for idx in 0..inner.slots.len() {
                    if inner.slots[idx].pending {
                        Self::reduce_slot_locked(&mut inner, idx, backend)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// All-reduces `slot`. In grouped mode the whole fused buffer is reduced.
    pub fn all_reduce_slot<B: CollectiveBackend>(
        &self,
        slot: ExchangeSlot,
        backend: &B,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::seal_locked(&mut inner);
        Self::layout(&inner, slot)?;
        match self.mode {
            ExchangeMode::Grouped => Self::reduce_all_locked(&mut inner, backend),
            ExchangeMode::PerNetwork => Self::reduce_slot_locked(&mut inner, slot.0, backend),
        }
    }

    fn reduce_all_locked<B: CollectiveBackend>(inner: &mut Inner, backend: &B) -> Result<()> {
        let Some(algo) = inner.slots.first().map(|s| s.algo) else {
            return Ok(());
        };
        backend.all_reduce_sum(&mut inner.buffers, algo)?;
        for s in inner.slots.iter_mut() {
            s.pending = false;
        }
        debug!(slots = inner.slots.len(), "grouped wgrad all-reduce");
        Ok(())
    }

    fn reduce_slot_locked<B: CollectiveBackend>(
        inner: &mut Inner,
        idx: usize,
        backend: &B,
    ) -> Result<()> {
        let (offset, len, algo) = {
            let s = &inner.slots[idx];
            (s.offset, s.len, s.algo)
        };
        let mut parts: Vec<Vec<f32>> = inner
            .buffers
            .iter()
            .map(|b| b[offset..offset + len].to_vec())
            .collect();
        backend.all_reduce_sum(&mut parts, algo)?;
        for (buf, part) in inner.buffers.iter_mut().zip(parts) {
            buf[offset..offset + len].copy_from_slice(&part);
        }
        inner.slots[idx].pending = false;
        debug!(slot = %inner.slots[idx].name, "per-network wgrad all-reduce");
        Ok(())
    }
}
