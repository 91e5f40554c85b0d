//! Listings of inputs and outputs.
//!
//! Listings are ordered by the position of the variables in the model tree,
//! parents before children and siblings in the order they were added. Only
//! the data is produced here, rendering it as text is left to the caller.

use std::collections::BTreeSet;

use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::naming::fnmatch;
use crate::recording::VarEntry;

/// Error of invalid listing options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListingError {
    /// Both explicit and implicit outputs were excluded.
    #[error("You have excluded both Explicit and Implicit components.")]
    ExcludedBoth,
}

/// Options of [`list_inputs`](crate::Problem::list_inputs) and
/// [`list_outputs`](crate::Problem::list_outputs).
///
/// Filters are applied in this order: component kind, name patterns, tags and
/// residual tolerance. The remaining options select the fields of the
/// listing.
#[derive(Debug, Clone)]
pub struct ListOptions {
    includes: Vec<String>,
    excludes: Vec<String>,
    tags: BTreeSet<String>,
    explicit: bool,
    implicit: bool,
    residuals_tol: Option<f64>,
    val: bool,
    prom_name: bool,
    units: bool,
    shape: bool,
    desc: bool,
    show_tags: bool,
    bounds: bool,
    scaling: bool,
    residuals: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            tags: BTreeSet::new(),
            explicit: true,
            implicit: true,
            residuals_tol: None,
            val: true,
            prom_name: true,
            units: false,
            shape: false,
            desc: false,
            show_tags: false,
            bounds: false,
            scaling: false,
            residuals: false,
        }
    }
}

impl ListOptions {
    /// Default options: all variables with their values and promoted names.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps only variables whose absolute or promoted name matches one of
    /// the glob patterns.
    pub fn with_includes<I>(mut self, patterns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.includes = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Drops variables whose absolute or promoted name matches one of the
    /// glob patterns.
    pub fn with_excludes<I>(mut self, patterns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.excludes = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Keeps only variables having at least one of the tags. An empty set
    /// does not filter.
    pub fn with_tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Whether outputs of explicit components are listed. Default: `true`.
    pub fn with_explicit(mut self, explicit: bool) -> Self {
        self.explicit = explicit;
        self
    }

    /// Whether outputs of implicit components are listed. Default: `true`.
    pub fn with_implicit(mut self, implicit: bool) -> Self {
        self.implicit = implicit;
        self
    }

    /// Keeps only outputs whose residual norm exceeds the tolerance.
    pub fn with_residuals_tol(mut self, tol: f64) -> Self {
        self.residuals_tol = Some(tol);
        self
    }

    /// Include values. Default: `true`.
    pub fn with_val(mut self, val: bool) -> Self {
        self.val = val;
        self
    }

    /// Include promoted names. Default: `true`.
    pub fn with_prom_name(mut self, prom_name: bool) -> Self {
        self.prom_name = prom_name;
        self
    }

    /// Include units. Default: `false`.
    pub fn with_units(mut self, units: bool) -> Self {
        self.units = units;
        self
    }

    /// Include shapes. Default: `false`.
    pub fn with_shape(mut self, shape: bool) -> Self {
        self.shape = shape;
        self
    }

    /// Include descriptions. Default: `false`.
    pub fn with_desc(mut self, desc: bool) -> Self {
        self.desc = desc;
        self
    }

    /// Include tags. Default: `false`.
    pub fn with_show_tags(mut self, show_tags: bool) -> Self {
        self.show_tags = show_tags;
        self
    }

    /// Include bounds of outputs. Default: `false`.
    pub fn with_bounds(mut self, bounds: bool) -> Self {
        self.bounds = bounds;
        self
    }

    /// Include scaling references of outputs. Default: `false`.
    pub fn with_scaling(mut self, scaling: bool) -> Self {
        self.scaling = scaling;
        self
    }

    /// Include residuals of outputs. Default: `false`.
    pub fn with_residuals(mut self, residuals: bool) -> Self {
        self.residuals = residuals;
        self
    }
}

/// Selected fields of a listed variable. Fields that were not requested are
/// `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct ListedVar {
    /// Continuous values.
    val: Option<Vec<f64>>,
    /// Value of a discrete variable.
    discrete_val: Option<Value>,
    /// Promoted name.
    prom_name: Option<String>,
    /// Units, also `None` for variables without units.
    units: Option<String>,
    /// Shape.
    shape: Option<Vec<usize>>,
    /// Description.
    desc: Option<String>,
    /// Tags.
    tags: Option<BTreeSet<String>>,
    /// Lower bound.
    lower: Option<Vec<f64>>,
    /// Upper bound.
    upper: Option<Vec<f64>>,
    /// `ref`, `ref0` and `res_ref`.
    scaling: Option<(f64, f64, f64)>,
    /// Residuals.
    resids: Option<Vec<f64>>,
}

/// Absolute name and the selected fields of a variable.
pub type Listing = (String, ListedVar);

fn matches_any(patterns: &[String], entry: &VarEntry) -> bool {
    patterns
        .iter()
        .any(|p| fnmatch(p, &entry.abs_name) || fnmatch(p, &entry.prom_name))
}

fn keep(entry: &VarEntry, inputs: bool, options: &ListOptions) -> bool {
    if entry.is_auto_ivc() || entry.kind.is_input() != inputs {
        return false;
    }

    if !inputs {
        let allowed = if entry.explicit {
            options.explicit
        } else {
            options.implicit
        };
        if !allowed {
            return false;
        }
    }

    if !options.includes.is_empty() && !matches_any(&options.includes, entry) {
        return false;
    }
    if matches_any(&options.excludes, entry) {
        return false;
    }

    if !options.tags.is_empty() && entry.tags.is_disjoint(&options.tags) {
        return false;
    }

    match options.residuals_tol {
        Some(tol) if !inputs => entry.resids_norm().map_or(false, |norm| norm > tol),
        _ => true,
    }
}

fn project(entry: &VarEntry, inputs: bool, options: &ListOptions) -> ListedVar {
    let outputs = !inputs;
    let discrete = entry.kind.is_discrete();

    ListedVar {
        val: (options.val && !discrete).then(|| entry.val.clone()),
        discrete_val: (options.val && discrete)
            .then(|| entry.discrete_val.clone())
            .flatten(),
        prom_name: options.prom_name.then(|| entry.prom_name.clone()),
        units: options.units.then(|| entry.units.clone()).flatten(),
        shape: options.shape.then(|| entry.shape.clone()),
        desc: options.desc.then(|| entry.desc.clone()),
        tags: options.show_tags.then(|| entry.tags.clone()),
        lower: (options.bounds && outputs).then(|| entry.lower.clone()).flatten(),
        upper: (options.bounds && outputs).then(|| entry.upper.clone()).flatten(),
        scaling: (options.scaling && outputs && !discrete)
            .then_some((entry.reference, entry.reference0, entry.res_ref)),
        resids: (options.residuals && outputs).then(|| entry.resids.clone()).flatten(),
    }
}

/// Lists inputs (or outputs) among given entries.
pub(crate) fn list(
    entries: &[VarEntry],
    inputs: bool,
    options: &ListOptions,
) -> Result<Vec<Listing>, ListingError> {
    if !inputs && !options.explicit && !options.implicit {
        return Err(ListingError::ExcludedBoth);
    }

    Ok(entries
        .iter()
        .filter(|e| keep(e, inputs, options))
        .map(|e| (e.abs_name.clone(), project(e, inputs, options)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::core::VarKind;

    fn entry(abs: &str, kind: VarKind, tags: &[&str]) -> VarEntry {
        VarEntry {
            abs_name: abs.to_string(),
            prom_name: abs.rsplit('.').next().unwrap_or(abs).to_string(),
            kind,
            explicit: true,
            val: vec![1.0],
            discrete_val: None,
            resids: (kind == VarKind::Output).then(|| vec![0.0]),
            units: None,
            shape: vec![1],
            desc: String::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            lower: None,
            upper: None,
            reference: 1.0,
            reference0: 0.0,
            res_ref: 1.0,
        }
    }

    fn names(listing: &[Listing]) -> Vec<&str> {
        listing.iter().map(|(name, _)| name.as_str()).collect()
    }

    #[test]
    fn tag_filter_is_closed() {
        let pool = ["a", "b", "c", "d"];
        let mut rng = StdRng::seed_from_u64(42);

        let entries: Vec<VarEntry> = (0..30)
            .map(|i| {
                let tags: Vec<&str> = pool.iter().copied().filter(|_| rng.gen_bool(0.4)).collect();
                entry(&format!("comp{}.y{}", i / 3, i % 3), VarKind::Output, &tags)
            })
            .collect();

        let all = list(&entries, false, &ListOptions::new()).unwrap();
        assert_eq!(all.len(), entries.len());
        assert_eq!(list(&entries, false, &ListOptions::new().with_tags(Vec::<String>::new())).unwrap(), all);

        for _ in 0..20 {
            let filter: BTreeSet<String> = pool
                .iter()
                .filter(|_| rng.gen_bool(0.5))
                .map(|t| t.to_string())
                .collect();

            let filtered = list(&entries, false, &ListOptions::new().with_tags(filter.clone())).unwrap();
            let expected: Vec<Listing> = all
                .iter()
                .filter(|(name, _)| {
                    let e = entries.iter().find(|e| &e.abs_name == name).unwrap();
                    filter.is_empty() || !e.tags.is_disjoint(&filter)
                })
                .cloned()
                .collect();
            assert_eq!(filtered, expected);
        }
    }

    #[test]
    fn excluding_both_kinds() {
        let options = ListOptions::new().with_explicit(false).with_implicit(false);
        let err = list(&[], false, &options).unwrap_err();
        assert_eq!(
            err.to_string(),
            "You have excluded both Explicit and Implicit components."
        );
    }

    #[test]
    fn name_patterns() {
        let entries = vec![
            entry("sub.comp.x", VarKind::Input, &[]),
            entry("sub.comp.y", VarKind::Output, &[]),
            entry("other.z", VarKind::Input, &[]),
        ];

        let inputs = list(&entries, true, &ListOptions::new().with_includes(["sub.*"])).unwrap();
        assert_eq!(names(&inputs), vec!["sub.comp.x"]);

        // Promoted names match too.
        let inputs = list(&entries, true, &ListOptions::new().with_excludes(["z"])).unwrap();
        assert_eq!(names(&inputs), vec!["sub.comp.x"]);
    }

    #[test]
    fn residual_tolerance_ignores_sign() {
        let mut entries = vec![
            entry("c.z1", VarKind::Output, &[]),
            entry("c.z2", VarKind::Output, &[]),
            entry("c.z3", VarKind::Output, &[]),
        ];
        entries[1].resids = Some(vec![-3.0]);
        entries[2].resids = Some(vec![3.0]);

        let outputs = list(&entries, false, &ListOptions::new().with_residuals_tol(1e-2)).unwrap();
        assert_eq!(names(&outputs), vec!["c.z2", "c.z3"]);
    }

    #[test]
    fn fields_are_selected() {
        let entries = vec![entry("c.y", VarKind::Output, &["t"])];
        let options = ListOptions::new()
            .with_val(false)
            .with_show_tags(true)
            .with_scaling(true);

        let outputs = list(&entries, false, &options).unwrap();
        let (_, listed) = &outputs[0];
        assert!(listed.val().is_none());
        assert_eq!(listed.prom_name().as_deref(), Some("y"));
        assert_eq!(listed.tags().as_ref().map(BTreeSet::len), Some(1));
        assert_eq!(*listed.scaling(), Some((1.0, 0.0, 1.0)));
        assert!(listed.resids().is_none());
    }

    #[test]
    fn auto_ivc_is_hidden() {
        let entries = vec![
            entry("_auto_ivc.v0", VarKind::Output, &[]),
            entry("c.y", VarKind::Output, &[]),
        ];
        let outputs = list(&entries, false, &ListOptions::new()).unwrap();
        assert_eq!(names(&outputs), vec!["c.y"]);
    }
}
