use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes moved between distinct GPUs, per primitive.
#[derive(Debug, Default)]
pub struct CommStats {
    all_to_all_bytes: AtomicU64,
    all_reduce_bytes: AtomicU64,
    all_gather_bytes: AtomicU64,
    calls: AtomicU64,
}

/// Point-in-time copy of [`CommStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommSnapshot {
    pub all_to_all_bytes: u64,
    pub all_reduce_bytes: u64,
    pub all_gather_bytes: u64,
    pub calls: u64,
}

impl CommSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.all_to_all_bytes + self.all_reduce_bytes + self.all_gather_bytes
    }
}

impl CommStats {
    pub fn record_all_to_all(&self, bytes: u64) {
        self.all_to_all_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_all_reduce(&self, bytes: u64) {
        self.all_reduce_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_all_gather(&self, bytes: u64) {
        self.all_gather_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CommSnapshot {
        CommSnapshot {
            all_to_all_bytes: self.all_to_all_bytes.load(Ordering::Relaxed),
            all_reduce_bytes: self.all_reduce_bytes.load(Ordering::Relaxed),
            all_gather_bytes: self.all_gather_bytes.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.all_to_all_bytes.store(0, Ordering::Relaxed);
        self.all_reduce_bytes.store(0, Ordering::Relaxed);
        self.all_gather_bytes.store(0, Ordering::Relaxed);
        self.calls.store(0, Ordering::Relaxed);
    }
}
