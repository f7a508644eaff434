// SPDX-License-Identifier: AGPL-3.0-only

//! Dense row-major f32 tensor
//!
//! Flattening and reshaping never copy or reorder values: a tensor is a
//! shape plus one contiguous buffer.

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};

/// Shape plus row-major data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = ModelError;

    fn try_from(raw: RawTensor) -> Result<Self> {
        Self::new(raw.shape, raw.data)
    }
}

/// Number of elements of `shape`
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl Tensor {
    /// Wrap `data` with `shape`.
    ///
    /// # Errors
    ///
    /// Returns error if `data.len()` differs from the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        if numel(&shape) != data.len() {
            return Err(ModelError::parse(format!(
                "tensor of shape {shape:?} needs {} values, got {}",
                numel(&shape),
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Tensor filled with `value`
    pub fn full(shape: &[usize], value: f32) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![value; numel(shape)],
        }
    }

    /// Zero tensor
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Dimensions
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element count
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a tensor with a zero dimension
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Values in row-major order
    pub fn flatten(&self) -> &[f32] {
        &self.data
    }

    /// Take the values in row-major order
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Same values under a new shape.
    ///
    /// # Errors
    ///
    /// Returns error if the element counts differ.
    pub fn reshape(self, shape: &[usize]) -> Result<Self> {
        if numel(shape) != self.data.len() {
            return Err(ModelError::shape_mismatch("reshape", shape, &self.shape));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: self.data,
        })
    }

    /// Check the shape against `expected`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` naming `context`.
    pub fn expect_shape(&self, context: &str, expected: &[usize]) -> Result<()> {
        if self.shape != expected {
            return Err(ModelError::shape_mismatch(context, expected, &self.shape));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_round_trip_is_exact() {
        let values: Vec<f32> = (0..150).map(|i| i as f32 * 0.37 - 11.0).collect();
        let original = Tensor::new(vec![6, 1, 5, 5], values.clone()).unwrap();
        let flat = original.clone().reshape(&[150]).unwrap();
        assert_eq!(flat.flatten(), values.as_slice());
        let back = flat.reshape(&[6, 1, 5, 5]).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn reshape_wrong_count_rejected() {
        let t = Tensor::zeros(&[2, 3]);
        assert!(t.reshape(&[7]).is_err());
    }

    #[test]
    fn deserialization_checks_length() {
        let ok: Tensor = serde_json::from_str(r#"{"shape":[2,2],"data":[1,2,3,4]}"#).unwrap();
        assert_eq!(ok.shape(), &[2, 2]);
        let bad = serde_json::from_str::<Tensor>(r#"{"shape":[2,2],"data":[1,2,3]}"#);
        assert!(bad.is_err());
    }
}
