//! Dense tensors exchanged between the embedding layer and the dense network.
//!
//! An embedding output is a row-major `[batch, slot_num, embedding_vec_size]` tensor per GPU.
//! The dense network reads it after the forward pass and writes the gradient of the loss with
//! respect to it back into the same buffer before the backward pass.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
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

/// A row-major N-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![T::zero(); size],
        }
    }

    pub fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Replaces the whole buffer, keeping the shape.
    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        if src.len() != self.data.len() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: vec![src.len()],
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Returns the element at the given multi-dimensional index.
    pub fn get(&self, index: [usize; RANK]) -> Result<T> {
        let offset = self.offset(index)?;
        Ok(self.data[offset])
    }

    fn offset(&self, index: [usize; RANK]) -> Result<usize> {
        if index.iter().zip(self.shape.iter()).any(|(i, s)| i >= s) {
            return Err(TensorError::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.shape.to_vec(),
            });
        }
        Ok(index
            .iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum())
    }
}

/// An embedding output buffer shared between the embedding that writes it and the dense
/// network that consumes it.
pub type SharedTensor = Arc<RwLock<Tensor<f32, 3>>>;

pub fn shared_zeros(shape: [usize; 3]) -> SharedTensor {
    Arc::new(RwLock::new(Tensor::zeros(shape)))
}

/// Computes row-major strides for a given shape.
pub const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_shape_mismatch() {
        let result = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [2, 2]);
        assert!(matches!(result, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_strides_and_get() {
        let t = Tensor::<f32, 3>::new((0..24).map(|v| v as f32).collect(), [2, 3, 4]).unwrap();
        assert_eq!(t.strides(), &[12, 4, 1]);
        assert_eq!(t.get([1, 2, 3]).unwrap(), 23.0);
        assert_eq!(t.get([1, 0, 2]).unwrap(), 14.0);
        assert!(t.get([2, 0, 0]).is_err());
    }

    #[test]
    fn test_copy_from_slice() {
        let mut t = Tensor::<f32, 3>::zeros([1, 1, 2]);
        t.copy_from_slice(&[3.0, 4.0]).unwrap();
        assert_eq!(t.data(), &[3.0, 4.0]);
        assert!(t.copy_from_slice(&[1.0]).is_err());
    }
}
