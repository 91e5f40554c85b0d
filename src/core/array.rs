//! Flat numeric arrays with a shape.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Number of elements of an array with given shape. The empty shape denotes a
/// scalar.
pub fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// A dense array of values stored in row-major order.
///
/// Arrays are used for default values, bounds and values set through the
/// problem. An array with empty shape is a scalar and it is broadcast to the
/// shape of the variable it is assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    data: Vec<f64>,
    shape: Vec<usize>,
}

impl Array {
    /// Creates a scalar.
    pub fn scalar(value: f64) -> Self {
        Self {
            data: vec![value],
            shape: Vec::new(),
        }
    }

    /// Creates an array with given shape from row-major data. Returns `None`
    /// if the number of elements does not match the shape.
    pub fn from_shape_vec(shape: Vec<usize>, data: Vec<f64>) -> Option<Self> {
        if shape_size(&shape) == data.len() {
            Some(Self { data, shape })
        } else {
            None
        }
    }

    /// Creates an array of given shape filled with a value.
    pub fn filled(shape: Vec<usize>, value: f64) -> Self {
        Self {
            data: vec![value; shape_size(&shape)],
            shape,
        }
    }

    /// Row-major data of the array.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Shape of the array. Empty for scalars.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the array is a scalar.
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Expands the array into `size` elements, broadcasting scalars. Returns
    /// `None` if the array is not a scalar and its size differs.
    pub fn broadcast(&self, size: usize) -> Option<Vec<f64>> {
        if self.is_scalar() {
            Some(vec![self.data[0]; size])
        } else if self.data.len() == size {
            Some(self.data.clone())
        } else {
            None
        }
    }

    /// Consumes the array and returns the row-major data.
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }
}

impl From<f64> for Array {
    fn from(value: f64) -> Self {
        Array::scalar(value)
    }
}

impl From<Vec<f64>> for Array {
    fn from(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }
}

impl From<&[f64]> for Array {
    fn from(data: &[f64]) -> Self {
        data.to_vec().into()
    }
}

impl<const N: usize> From<[f64; N]> for Array {
    fn from(data: [f64; N]) -> Self {
        data.to_vec().into()
    }
}

impl From<DVector<f64>> for Array {
    fn from(v: DVector<f64>) -> Self {
        Self {
            shape: vec![v.len()],
            data: v.as_slice().to_vec(),
        }
    }
}

impl From<DMatrix<f64>> for Array {
    fn from(m: DMatrix<f64>) -> Self {
        // nalgebra stores matrices column-major.
        let data = m.transpose().as_slice().to_vec();
        Self {
            shape: vec![m.nrows(), m.ncols()],
            data,
        }
    }
}
