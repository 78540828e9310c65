//! Optional conversions between [`Tensor`] and `ndarray` arrays.
//!
//! Gated behind the `ndarray` feature; the core crate stores tensors as flat
//! row-major vectors.

use ndarray::{ArrayD, IxDyn};

use crate::core::{EnvError, Result};
use crate::spaces::{Element, Tensor};

impl Tensor {
    /// Copies the tensor into an `ndarray::ArrayD<T>`. Fails if `T` is not the dtype.
    pub fn to_ndarray<T: Element>(&self) -> Result<ArrayD<T>> {
        let data = self.as_slice::<T>().ok_or_else(|| {
            EnvError::SpaceMismatch(format!("tensor holds {:?}, not {:?}", self.dtype(), T::DTYPE))
        })?;
        ArrayD::from_shape_vec(IxDyn(self.shape()), data.to_vec())
            .map_err(|e| EnvError::SpaceMismatch(e.to_string()))
    }

    /// Builds a tensor from any `ndarray` array, in logical row-major order.
    pub fn from_ndarray<T: Element>(arr: &ArrayD<T>) -> Self {
        let shape = arr.shape().to_vec();
        let data: Vec<T> = arr.iter().copied().collect();
        Tensor::from_parts(shape, T::wrap(data))
    }
}
