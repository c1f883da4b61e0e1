//! CPU kernels for sparse embedding combine and gradient scatter.
//!
//! Every kernel works on flat, row-major slices: an embedding row is `vec_size`
//! consecutive elements and a CSR segment is delimited by `row_offset[i]..row_offset[i + 1]`.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_combine;
pub mod cpu_scatter;

pub use cpu_combine::{cpu_combine_backward, cpu_combine_forward};
pub use cpu_scatter::{cpu_accumulate_unique, unique_index};

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Index {index} out of bounds for {len} rows")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("Malformed row offsets: {0}")]
    MalformedOffsets(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors the element bound of the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// How the rows of one slot of one sample are reduced into a single vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Combiner {
    Sum,
    Mean,
}

/// Checks that `row_offset` is a non-decreasing CSR boundary array ending at `nnz`.
pub fn check_row_offset(row_offset: &[usize], nnz: usize) -> Result<()> {
    let Some(&first) = row_offset.first() else {
        return Err(KernelError::MalformedOffsets(
            "row_offset must hold at least one entry".to_string(),
        ));
    };
    if first != 0 {
        return Err(KernelError::MalformedOffsets(format!(
            "row_offset must start at 0, got {first}"
        )));
    }
    if row_offset.windows(2).any(|w| w[0] > w[1]) {
        return Err(KernelError::MalformedOffsets(
            "row_offset must be non-decreasing".to_string(),
        ));
    }
    let last = row_offset[row_offset.len() - 1];
    if last != nnz {
        return Err(KernelError::ShapeMismatch {
            expected: vec![nnz],
            got: vec![last],
        });
    }
    Ok(())
}
