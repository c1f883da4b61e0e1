use crate::error::Result;
use sparsectr_kernels::KernelElem;

/// Which all-reduce schedule to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllReduceAlgo {
    /// One ring over every GPU.
    Flat,
    /// Intra-node reduce-scatter, one inter-node ring per local rank, intra-node all-gather.
    Hierarchical,
}

/// Abstraction for the collectives the embedding variants need.
///
/// Every method takes the buffers of all participants at once, indexed by GPU, and returns
/// only after every participant's part is complete. That is the barrier of a collective: no
/// GPU can observe the result before all of them have joined.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the number of participants.
    fn world_size(&self) -> usize;

    /// Personalized exchange. `send[src][dst]` is what `src` sends to `dst`; the result is
    /// `recv[dst][src]`.
    fn all_to_all_v<T: Send>(&self, send: Vec<Vec<Vec<T>>>) -> Result<Vec<Vec<Vec<T>>>>;

    /// Element-wise sum of every buffer, written back into all of them.
    fn all_reduce_sum<T: KernelElem>(&self, buffers: &mut [Vec<T>], algo: AllReduceAlgo)
        -> Result<()>;

    /// Concatenates every participant's part in rank order. Every GPU receives the same result.
    fn all_gather<T: Clone + Send>(&self, parts: Vec<Vec<T>>) -> Result<Vec<T>>;
}
