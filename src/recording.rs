//! Snapshots of the model state.
//!
//! A [`Snapshot`] holds the value and metadata of every variable in tree
//! order. It can be serialized to JSON and queried with the same listing
//! functions as the live model, giving identical results.

use std::collections::BTreeSet;

use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::VarKind;
use crate::model::AUTO_IVC;
use crate::reports::{self, ListOptions, Listing, ListingError};

/// Value and metadata of one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct VarEntry {
    /// Absolute name.
    pub(crate) abs_name: String,
    /// Promoted name at the root.
    pub(crate) prom_name: String,
    /// Kind of the variable.
    pub(crate) kind: VarKind,
    /// Whether the owning component is explicit.
    pub(crate) explicit: bool,
    /// Continuous values. Empty for discrete variables.
    pub(crate) val: Vec<f64>,
    /// Value of a discrete variable.
    pub(crate) discrete_val: Option<Value>,
    /// Residuals of a continuous output.
    pub(crate) resids: Option<Vec<f64>>,
    /// Units.
    pub(crate) units: Option<String>,
    /// Shape.
    pub(crate) shape: Vec<usize>,
    /// Description.
    pub(crate) desc: String,
    /// Tags.
    pub(crate) tags: BTreeSet<String>,
    /// Lower bound.
    pub(crate) lower: Option<Vec<f64>>,
    /// Upper bound.
    pub(crate) upper: Option<Vec<f64>>,
    /// Scaling reference mapped to 1.
    pub(crate) reference: f64,
    /// Scaling reference mapped to 0.
    pub(crate) reference0: f64,
    /// Scaling reference of the residuals.
    pub(crate) res_ref: f64,
}

impl VarEntry {
    /// Returns `true` for the automatic independent outputs.
    pub fn is_auto_ivc(&self) -> bool {
        self.abs_name
            .strip_prefix(AUTO_IVC)
            .map_or(false, |rest| rest.starts_with('.'))
    }

    /// Euclidean norm of the residuals, if any.
    pub fn resids_norm(&self) -> Option<f64> {
        self.resids
            .as_ref()
            .map(|r| r.iter().map(|v| v * v).sum::<f64>().sqrt())
    }
}

/// State of all variables of the model in tree order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    vars: Vec<VarEntry>,
}

impl Snapshot {
    pub(crate) fn new(vars: Vec<VarEntry>) -> Self {
        Self { vars }
    }

    /// All entries in tree order.
    pub fn vars(&self) -> &[VarEntry] {
        &self.vars
    }

    /// Entry of a variable given by its absolute name.
    pub fn get(&self, abs_name: &str) -> Option<&VarEntry> {
        self.vars.iter().find(|v| v.abs_name == abs_name)
    }

    /// Serializes the snapshot.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Loads a snapshot serialized by [`to_json`](Snapshot::to_json).
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Lists inputs, see [`ListOptions`].
    pub fn list_inputs(&self, options: &ListOptions) -> Result<Vec<Listing>, ListingError> {
        reports::list(&self.vars, true, options)
    }

    /// Lists outputs, see [`ListOptions`].
    pub fn list_outputs(&self, options: &ListOptions) -> Result<Vec<Listing>, ListingError> {
        reports::list(&self.vars, false, options)
    }
}
