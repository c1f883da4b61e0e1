//! Error taxonomy for graph construction and training steps.
//!
//! Construction-time problems (`WrongInput`) are reported synchronously and never retried.
//! Everything raised during a step is fatal to the step; recovery belongs to the caller.

use crate::tensor::TensorError;
use sparsectr_kernels::KernelError;
use thiserror::Error;

/// Coarse classification of an [`EmbeddingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    WrongInput,
    UnspecificError,
    OutOfCapacity,
    IllegalCall,
    Communication,
    DataCheck,
}

#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Malformed, missing or contradictory configuration.
    #[error("Wrong input: {0}")]
    WrongInput(String),
    /// An internal invariant was violated.
    #[error("Unspecific error: {0}")]
    UnspecificError(String),
    /// A fixed-size table or buffer cannot hold the requested entries.
    #[error("{what} is full: capacity {capacity}, requested {requested}")]
    OutOfCapacity {
        what: String,
        capacity: usize,
        requested: usize,
    },
    /// An operation was called in a state that does not allow it.
    #[error("Illegal call: {0}")]
    IllegalCall(String),
    /// A collective could not complete.
    #[error("Communication failure: {0}")]
    Communication(String),
    /// Batch contents violate the layout the embedding was built for.
    #[error("Data check failed: {0}")]
    DataCheck(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// A table snapshot could not be encoded or decoded.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EmbeddingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbeddingError::WrongInput(_) | EmbeddingError::Json(_) => ErrorKind::WrongInput,
            EmbeddingError::UnspecificError(_)
            | EmbeddingError::Io(_)
            | EmbeddingError::Checkpoint(_) => ErrorKind::UnspecificError,
            EmbeddingError::OutOfCapacity { .. } => ErrorKind::OutOfCapacity,
            EmbeddingError::IllegalCall(_) => ErrorKind::IllegalCall,
            EmbeddingError::Communication(_) => ErrorKind::Communication,
            EmbeddingError::DataCheck(_)
            | EmbeddingError::Tensor(_)
            | EmbeddingError::Kernel(_) => ErrorKind::DataCheck,
        }
    }

    pub(crate) fn wrong_input(msg: impl Into<String>) -> Self {
        EmbeddingError::WrongInput(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;
