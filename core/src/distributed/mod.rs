//! # Collectives
//!
//! The embedding variants move data between GPUs with three primitives:
//!
//! *   **All-to-All**: personalized exchange. Used by the distributed and localized variants
//!     to route lookup requests to the owning GPU and to return the gathered rows.
//! *   **All-Reduce**: element-wise sum. Keeps the replicated frequent rows of the hybrid
//!     variant identical on every GPU.
//! *   **All-Gather**: every GPU receives every other GPU's part. Used when rows are promoted
//!     to the replicated set.
//!
//! [`LocalCollective`] runs them over the GPUs simulated in this process. All-reduce uses a
//! crossbeam-channel ring (see [`ring`]), either over every GPU or hierarchically: reduce inside
//! each node, ring across nodes, then broadcast inside each node.

pub mod backend;
pub mod local;
pub mod rendezvous;
pub mod ring;
pub mod stats;

pub use backend::{AllReduceAlgo, CollectiveBackend};
pub use local::LocalCollective;
pub use rendezvous::agree_on_iteration;
pub use ring::{ring_all_reduce, RingPeer};
pub use stats::{CommSnapshot, CommStats};
