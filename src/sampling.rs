//! Interface to design of experiments generators.
//!
//! A generator needs the size of every factor it samples, which is derived
//! from the bounds of the factor, and produces cases applied to the problem
//! before each evaluation with [`Problem::apply_case`](crate::Problem::apply_case).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Array;

/// Error when determining the size of a factor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SamplingError {
    /// The bounds of a factor differ in size.
    #[error("Size mismatch for factor '{name}': 'lower' bound size ({lower}) does not match 'upper' bound size ({upper}).")]
    SizeMismatch {
        /// Name of the factor.
        name: String,
        /// Size of the lower bound.
        lower: usize,
        /// Size of the upper bound.
        upper: usize,
    },
    /// A bound of a factor is missing.
    #[error("Unable to determine levels for factor '{0}'. Factors dictionary must contain both 'lower' and 'upper' keys.")]
    MissingBounds(String),
}

/// Bounds of a sampled variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    /// Lower bound.
    pub lower: Option<Array>,
    /// Upper bound.
    pub upper: Option<Array>,
}

impl Factor {
    /// Factor with both bounds.
    pub fn new(lower: impl Into<Array>, upper: impl Into<Array>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
        }
    }
}

/// Number of values sampled for a factor.
pub fn factor_size(name: &str, factor: &Factor) -> Result<usize, SamplingError> {
    match (&factor.lower, &factor.upper) {
        (Some(lower), Some(upper)) if lower.size() == upper.size() => Ok(lower.size()),
        (Some(lower), Some(upper)) => Err(SamplingError::SizeMismatch {
            name: name.to_string(),
            lower: lower.size(),
            upper: upper.size(),
        }),
        _ => Err(SamplingError::MissingBounds(name.to_string())),
    }
}

/// Value of one variable in a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseValue {
    /// The values.
    pub val: Array,
    /// Units of the values, if they differ from the units of the variable.
    #[serde(default)]
    pub units: Option<String>,
    /// Flat indices of the variable the values are assigned to. All values
    /// are assigned if not given.
    #[serde(default)]
    pub indices: Option<Vec<usize>>,
}

impl CaseValue {
    /// Assigns all values.
    pub fn new(val: impl Into<Array>) -> Self {
        Self {
            val: val.into(),
            units: None,
            indices: None,
        }
    }

    /// Units of the values.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Assigns the values only to given flat indices.
    pub fn with_indices(mut self, indices: Vec<usize>) -> Self {
        self.indices = Some(indices);
        self
    }
}

/// Values keyed by promoted names.
pub type Case = BTreeMap<String, CaseValue>;
