//! Declaration of component variables and partial derivatives.
//!
//! Components declare their variables in [`setup`](super::ExplicitComponent::setup)
//! through [`Declarations`]. Every declaration returns the resolved
//! [`VarMeta`] record, so the component (and tests) can inspect what was
//! actually registered.
//!
//! ```rust
//! use mdao::{Declarations, VarOptions};
//!
//! let mut decl = Declarations::new();
//! let meta = decl
//!     .add_input("length", VarOptions::from(3.0).with_units("ft"))
//!     .unwrap();
//!
//! assert_eq!(meta.val(), &[3.0]);
//! assert_eq!(meta.shape(), &[1]);
//! assert_eq!(meta.size(), 1);
//! assert_eq!(meta.units().as_deref(), Some("ft"));
//! assert!(meta.tags().is_empty());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::array::{shape_size, Array};
use crate::naming::fnmatch;
use crate::units;

/// Error in a variable or partial derivative declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeclarationError {
    /// An element of the tags list is not a string.
    #[error("Items in tags should be of type string, but type '{0}' was found.")]
    TagItemType(&'static str),
    /// The tags argument is neither a string nor a list.
    #[error("The tags argument should be a str, set, or list")]
    TagsType,
    /// The variable name is already used by the component.
    #[error("Variable name '{0}' already exists.")]
    DuplicateName(String),
    /// The unit string cannot be parsed.
    #[error("The units '{0}' are invalid.")]
    InvalidUnits(String),
    /// More than one way of determining the shape was given.
    #[error("'{0}': Only one of 'shape', 'shape_by_conn', 'compute_shape' or 'copy_shape' may be specified.")]
    ConflictingShape(String),
    /// `compute_shape` is only meaningful for outputs.
    #[error("'{0}': 'compute_shape' is only supported for outputs.")]
    ComputeShapeOnInput(String),
    /// The default value does not fit the declared shape.
    #[error("'{name}': The value has {got} element(s) but the shape {shape:?} requires {expected}.")]
    ValueShape {
        /// Name of the variable.
        name: String,
        /// Declared shape.
        shape: Vec<usize>,
        /// Number of elements required by the shape.
        expected: usize,
        /// Number of elements of the value.
        got: usize,
    },
    /// A bound does not fit the shape of the variable.
    #[error("'{name}': The size of '{bound}' ({got}) does not match the size of the variable ({expected}).")]
    BoundSize {
        /// Name of the variable.
        name: String,
        /// Which bound (`lower` or `upper`).
        bound: &'static str,
        /// Size of the variable.
        expected: usize,
        /// Size of the bound.
        got: usize,
    },
    /// A partials pattern matched no variable.
    #[error("No matches were found for {kind}=\"{pattern}\"")]
    PartialsNoMatch {
        /// Either `of` or `wrt`.
        kind: &'static str,
        /// The pattern.
        pattern: String,
    },
    /// Row and column indices of a sparse partial differ in length.
    #[error("'{of}' wrt '{wrt}': rows and cols must have the same length ({rows} != {cols}).")]
    SparsityLength {
        /// Pattern of the differentiated variables.
        of: String,
        /// Pattern of the variables the derivative is taken with respect to.
        wrt: String,
        /// Number of row indices.
        rows: usize,
        /// Number of column indices.
        cols: usize,
    },
    /// A sparse index is out of the block, or the constant value does not
    /// fit the block.
    #[error("'{of}' wrt '{wrt}': {message}")]
    PartialsSize {
        /// Name of the differentiated variable.
        of: String,
        /// Name of the variable the derivative is taken with respect to.
        wrt: String,
        /// Description of the problem.
        message: String,
    },
}

/// Kind of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    /// Continuous input.
    Input,
    /// Continuous output.
    Output,
    /// Discrete input.
    DiscreteInput,
    /// Discrete output.
    DiscreteOutput,
}

impl VarKind {
    /// Returns `true` for continuous and discrete inputs.
    pub fn is_input(&self) -> bool {
        matches!(self, VarKind::Input | VarKind::DiscreteInput)
    }

    /// Returns `true` for discrete variables.
    pub fn is_discrete(&self) -> bool {
        matches!(self, VarKind::DiscreteInput | VarKind::DiscreteOutput)
    }
}

/// Function computing the shape of an output from the shapes of the inputs of
/// the same component (keyed by their local names).
pub type ShapeFn = Rc<dyn Fn(&BTreeMap<String, Vec<usize>>) -> Result<Vec<usize>, String>>;

/// How the shape of a variable is determined.
#[derive(Clone, Default)]
pub enum ShapeSpec {
    /// The shape is given or inferred from the value.
    #[default]
    Known,
    /// Taken from the connected source (inputs) or targets (outputs).
    ByConn,
    /// Computed from the shapes of the component inputs.
    Compute(ShapeFn),
    /// Copied from another variable of the same component.
    Copy(String),
}

impl ShapeSpec {
    /// Returns `true` if the shape is resolved only after connections are
    /// known.
    pub fn is_deferred(&self) -> bool {
        !matches!(self, ShapeSpec::Known)
    }
}

impl fmt::Debug for ShapeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeSpec::Known => write!(f, "Known"),
            ShapeSpec::ByConn => write!(f, "ByConn"),
            ShapeSpec::Compute(_) => write!(f, "Compute(..)"),
            ShapeSpec::Copy(name) => f.debug_tuple("Copy").field(name).finish(),
        }
    }
}

/// Returns the name of the type of a loosely-typed value.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Normalizes the tags argument into a set of strings.
pub fn parse_tags(tags: Option<&Value>) -> Result<BTreeSet<String>, DeclarationError> {
    match tags {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::String(tag)) => Ok(BTreeSet::from([tag.clone()])),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(tag) => Ok(tag.clone()),
                other => Err(DeclarationError::TagItemType(type_name(other))),
            })
            .collect(),
        Some(_) => Err(DeclarationError::TagsType),
    }
}

/// Resolved metadata of a declared variable.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct VarMeta {
    /// Local name within the component.
    #[getset(get = "pub")]
    name: String,
    /// Kind of the variable.
    #[getset(get_copy = "pub")]
    kind: VarKind,
    /// Default value, flattened in row-major order. Empty for discrete
    /// variables.
    #[getset(get = "pub")]
    val: Vec<f64>,
    /// Shape. Empty until resolved for deferred shapes.
    #[getset(get = "pub")]
    shape: Vec<usize>,
    /// Number of elements. Zero until resolved for deferred shapes.
    #[getset(get_copy = "pub")]
    size: usize,
    /// Units, if any.
    #[getset(get = "pub")]
    units: Option<String>,
    /// Description.
    #[getset(get = "pub")]
    desc: String,
    /// Tags.
    #[getset(get = "pub")]
    tags: BTreeSet<String>,
    /// Name used by the primal evaluation routine.
    #[getset(get = "pub")]
    primal_name: Option<String>,
    /// Lower bound (outputs only).
    #[getset(get = "pub")]
    lower: Option<Vec<f64>>,
    /// Upper bound (outputs only).
    #[getset(get = "pub")]
    upper: Option<Vec<f64>>,
    /// Scaling reference value mapped to 1 (outputs only). Default: `1`.
    #[getset(get_copy = "pub")]
    reference: f64,
    /// Scaling reference value mapped to 0 (outputs only). Default: `0`.
    #[getset(get_copy = "pub")]
    reference0: f64,
    /// Scaling reference of residuals (outputs only). Default: `reference`.
    #[getset(get_copy = "pub")]
    res_ref: f64,
    /// Default value of a discrete variable.
    #[getset(get = "pub")]
    discrete_val: Option<Value>,
    /// How the shape is determined.
    #[getset(get = "pub")]
    shape_spec: ShapeSpec,
    #[getset(skip)]
    pending_lower: Option<Array>,
    #[getset(skip)]
    pending_upper: Option<Array>,
}

impl VarMeta {
    /// Name of the type of a discrete variable (`int`, `float`, `str`, ...).
    pub fn type_name(&self) -> Option<&'static str> {
        self.discrete_val.as_ref().map(type_name)
    }

    /// Returns `true` once the shape is known.
    pub fn is_shape_resolved(&self) -> bool {
        self.kind.is_discrete() || !self.shape.is_empty()
    }

    pub(crate) fn new_output(name: &str, shape: Vec<usize>, val: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            kind: VarKind::Output,
            size: val.len(),
            val,
            shape,
            units: None,
            desc: String::new(),
            tags: BTreeSet::new(),
            primal_name: None,
            lower: None,
            upper: None,
            reference: 1.0,
            reference0: 0.0,
            res_ref: 1.0,
            discrete_val: None,
            shape_spec: ShapeSpec::Known,
            pending_lower: None,
            pending_upper: None,
        }
    }

    /// Output whose shape is taken from the inputs it is connected to.
    pub(crate) fn new_deferred_output(name: &str, val: Vec<f64>) -> Self {
        let mut meta = Self::new_output(name, Vec::new(), val);
        meta.size = 0;
        meta.shape_spec = ShapeSpec::ByConn;
        meta
    }

    pub(crate) fn new_discrete_output(name: &str, val: Value) -> Self {
        let mut meta = Self::new_output(name, Vec::new(), Vec::new());
        meta.kind = VarKind::DiscreteOutput;
        meta.discrete_val = Some(val);
        meta
    }

    pub(crate) fn set_units(&mut self, units: Option<String>) {
        self.units = units;
    }

    pub(crate) fn set_val(&mut self, val: Vec<f64>) {
        self.val = val;
    }

    /// Fixes a deferred shape, broadcasting the default value and bounds.
    pub(crate) fn resolve_shape(&mut self, shape: Vec<usize>) -> Result<(), DeclarationError> {
        let size = shape_size(&shape);

        let val = if self.val.len() == 1 {
            vec![self.val[0]; size]
        } else if self.val.len() == size {
            std::mem::take(&mut self.val)
        } else {
            return Err(DeclarationError::ValueShape {
                name: self.name.clone(),
                shape,
                expected: size,
                got: self.val.len(),
            });
        };

        self.val = val;
        self.shape = shape;
        self.size = size;
        self.resolve_bounds()
    }

    fn resolve_bounds(&mut self) -> Result<(), DeclarationError> {
        if let Some(lower) = self.pending_lower.take() {
            self.lower = Some(broadcast_bound(&self.name, "lower", &lower, self.size)?);
        }
        if let Some(upper) = self.pending_upper.take() {
            self.upper = Some(broadcast_bound(&self.name, "upper", &upper, self.size)?);
        }
        Ok(())
    }
}

fn broadcast_bound(
    name: &str,
    bound: &'static str,
    value: &Array,
    size: usize,
) -> Result<Vec<f64>, DeclarationError> {
    value
        .broadcast(size)
        .ok_or_else(|| DeclarationError::BoundSize {
            name: name.to_string(),
            bound,
            expected: size,
            got: value.size(),
        })
}

/// Options of a continuous variable declaration.
///
/// Start from [`VarOptions::new`] (default value `1.0`) or convert a value
/// directly, e.g. `VarOptions::from(3.0)`.
#[derive(Clone, Default)]
pub struct VarOptions {
    val: Option<Array>,
    shape: Option<Vec<usize>>,
    units: Option<String>,
    desc: String,
    tags: Option<Value>,
    primal_name: Option<String>,
    shape_by_conn: bool,
    compute_shape: Option<ShapeFn>,
    copy_shape: Option<String>,
    lower: Option<Array>,
    upper: Option<Array>,
    reference: Option<f64>,
    reference0: Option<f64>,
    res_ref: Option<f64>,
}

impl VarOptions {
    /// Options with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default value. Scalars are broadcast to the shape.
    pub fn with_val(mut self, val: impl Into<Array>) -> Self {
        self.val = Some(val.into());
        self
    }

    /// Shape of the variable.
    pub fn with_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    /// Units of the variable.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Description.
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    /// Tags given as a string or a list of strings.
    pub fn with_tags(mut self, tags: impl Into<Value>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    /// Name of the argument or return value of the primal routine.
    pub fn with_primal_name(mut self, name: impl Into<String>) -> Self {
        self.primal_name = Some(name.into());
        self
    }

    /// Take the shape from the connected variable.
    pub fn with_shape_by_conn(mut self) -> Self {
        self.shape_by_conn = true;
        self
    }

    /// Compute the shape from the shapes of the component inputs.
    pub fn with_compute_shape<F>(mut self, f: F) -> Self
    where
        F: Fn(&BTreeMap<String, Vec<usize>>) -> Result<Vec<usize>, String> + 'static,
    {
        self.compute_shape = Some(Rc::new(f));
        self
    }

    /// Copy the shape of another variable of the component.
    pub fn with_copy_shape(mut self, other: impl Into<String>) -> Self {
        self.copy_shape = Some(other.into());
        self
    }

    /// Lower bound.
    pub fn with_lower(mut self, lower: impl Into<Array>) -> Self {
        self.lower = Some(lower.into());
        self
    }

    /// Upper bound.
    pub fn with_upper(mut self, upper: impl Into<Array>) -> Self {
        self.upper = Some(upper.into());
        self
    }

    /// Scaling reference mapped to 1.
    pub fn with_ref(mut self, reference: f64) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Scaling reference mapped to 0.
    pub fn with_ref0(mut self, reference0: f64) -> Self {
        self.reference0 = Some(reference0);
        self
    }

    /// Scaling reference of the residual.
    pub fn with_res_ref(mut self, res_ref: f64) -> Self {
        self.res_ref = Some(res_ref);
        self
    }
}

impl From<Array> for VarOptions {
    fn from(val: Array) -> Self {
        VarOptions::new().with_val(val)
    }
}

impl From<f64> for VarOptions {
    fn from(val: f64) -> Self {
        VarOptions::new().with_val(val)
    }
}

impl From<Vec<f64>> for VarOptions {
    fn from(val: Vec<f64>) -> Self {
        VarOptions::new().with_val(val)
    }
}

impl<const N: usize> From<[f64; N]> for VarOptions {
    fn from(val: [f64; N]) -> Self {
        VarOptions::new().with_val(val)
    }
}

/// Options of a discrete variable declaration.
#[derive(Debug, Clone)]
pub struct DiscreteOptions {
    val: Value,
    desc: String,
    tags: Option<Value>,
    primal_name: Option<String>,
}

impl DiscreteOptions {
    /// Options with given default value.
    pub fn new(val: impl Into<Value>) -> Self {
        Self {
            val: val.into(),
            desc: String::new(),
            tags: None,
            primal_name: None,
        }
    }

    /// Description.
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    /// Tags given as a string or a list of strings.
    pub fn with_tags(mut self, tags: impl Into<Value>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    /// Name of the argument or return value of the primal routine.
    pub fn with_primal_name(mut self, name: impl Into<String>) -> Self {
        self.primal_name = Some(name.into());
        self
    }
}

/// How a partial derivative is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialMethod {
    /// Provided by the component.
    #[default]
    Exact,
    /// Approximated by forward finite differences.
    Fd,
}

/// Options of a partial derivative declaration.
#[derive(Debug, Clone, Default)]
pub struct PartialOptions {
    method: PartialMethod,
    rows: Option<Vec<usize>>,
    cols: Option<Vec<usize>>,
    val: Option<Array>,
}

impl PartialOptions {
    /// Exact dense partial derivative.
    pub fn new() -> Self {
        Self::default()
    }

    /// Method of obtaining the derivative.
    pub fn with_method(mut self, method: PartialMethod) -> Self {
        self.method = method;
        self
    }

    /// Sparsity pattern given by row and column indices of nonzero entries.
    pub fn with_sparsity(mut self, rows: Vec<usize>, cols: Vec<usize>) -> Self {
        self.rows = Some(rows);
        self.cols = Some(cols);
        self
    }

    /// Constant value of the derivative. It is set once at setup and never
    /// needs to be recomputed.
    pub fn with_val(mut self, val: impl Into<Array>) -> Self {
        self.val = Some(val.into());
        self
    }
}

#[derive(Debug, Clone)]
struct PartialPattern {
    of: String,
    wrt: String,
    options: PartialOptions,
}

/// Resolved declaration of a single partial derivative block.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct PartialDecl {
    /// Local name of the differentiated output.
    #[getset(get = "pub")]
    of: String,
    /// Local name of the variable the derivative is taken with respect to.
    #[getset(get = "pub")]
    wrt: String,
    /// Method of obtaining the derivative.
    #[getset(get_copy = "pub")]
    method: PartialMethod,
    /// Sparsity pattern, if any.
    #[getset(get = "pub")]
    sparsity: Option<(Vec<usize>, Vec<usize>)>,
    /// Constant value, if any.
    #[getset(get = "pub")]
    val: Option<Array>,
}

impl PartialDecl {
    /// Validates sparsity and the constant value against block dimensions.
    pub(crate) fn validate(&self, nrows: usize, ncols: usize) -> Result<(), DeclarationError> {
        let err = |message: String| DeclarationError::PartialsSize {
            of: self.of.clone(),
            wrt: self.wrt.clone(),
            message,
        };

        let expected = match &self.sparsity {
            Some((rows, cols)) => {
                if let Some(&r) = rows.iter().find(|&&r| r >= nrows) {
                    return Err(err(format!("row index {r} is out of range for {nrows} row(s)")));
                }
                if let Some(&c) = cols.iter().find(|&&c| c >= ncols) {
                    return Err(err(format!(
                        "column index {c} is out of range for {ncols} column(s)"
                    )));
                }
                rows.len()
            }
            None => nrows * ncols,
        };

        if let Some(val) = &self.val {
            if val.broadcast(expected).is_none() {
                return Err(err(format!(
                    "the value has {} element(s) but {expected} are required",
                    val.size()
                )));
            }
        }

        Ok(())
    }
}

/// Declarations collected from a component during setup.
#[derive(Debug, Default)]
pub struct Declarations {
    vars: Vec<VarMeta>,
    patterns: Vec<PartialPattern>,
}

impl Declarations {
    /// Empty declarations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared variables in declaration order.
    pub fn vars(&self) -> &[VarMeta] {
        &self.vars
    }

    /// Declares a continuous input.
    pub fn add_input(
        &mut self,
        name: &str,
        options: impl Into<VarOptions>,
    ) -> Result<VarMeta, DeclarationError> {
        self.add_continuous(name, VarKind::Input, options.into())
    }

    /// Declares a continuous output.
    pub fn add_output(
        &mut self,
        name: &str,
        options: impl Into<VarOptions>,
    ) -> Result<VarMeta, DeclarationError> {
        self.add_continuous(name, VarKind::Output, options.into())
    }

    /// Declares a discrete input.
    pub fn add_discrete_input(
        &mut self,
        name: &str,
        options: DiscreteOptions,
    ) -> Result<VarMeta, DeclarationError> {
        self.add_discrete(name, VarKind::DiscreteInput, options)
    }

    /// Declares a discrete output.
    pub fn add_discrete_output(
        &mut self,
        name: &str,
        options: DiscreteOptions,
    ) -> Result<VarMeta, DeclarationError> {
        self.add_discrete(name, VarKind::DiscreteOutput, options)
    }

    /// Declares partial derivatives of outputs matching `of` with respect to
    /// variables matching `wrt`. Both accept glob patterns (`*`, `?`).
    pub fn declare_partials(
        &mut self,
        of: &str,
        wrt: &str,
        options: PartialOptions,
    ) -> Result<(), DeclarationError> {
        if let (Some(rows), Some(cols)) = (&options.rows, &options.cols) {
            if rows.len() != cols.len() {
                return Err(DeclarationError::SparsityLength {
                    of: of.to_string(),
                    wrt: wrt.to_string(),
                    rows: rows.len(),
                    cols: cols.len(),
                });
            }
        }

        self.patterns.push(PartialPattern {
            of: of.to_string(),
            wrt: wrt.to_string(),
            options,
        });
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<(), DeclarationError> {
        if self.vars.iter().any(|v| v.name == name) {
            Err(DeclarationError::DuplicateName(name.to_string()))
        } else {
            Ok(())
        }
    }

    fn add_continuous(
        &mut self,
        name: &str,
        kind: VarKind,
        options: VarOptions,
    ) -> Result<VarMeta, DeclarationError> {
        self.check_name(name)?;

        let tags = parse_tags(options.tags.as_ref())?;

        if let Some(u) = &options.units {
            units::validate(u).map_err(|_| DeclarationError::InvalidUnits(u.clone()))?;
        }

        let deferred = [
            options.shape_by_conn,
            options.compute_shape.is_some(),
            options.copy_shape.is_some(),
        ]
        .into_iter()
        .filter(|&x| x)
        .count();

        if deferred > 1 || (deferred == 1 && options.shape.is_some()) {
            return Err(DeclarationError::ConflictingShape(name.to_string()));
        }

        if kind == VarKind::Input && options.compute_shape.is_some() {
            return Err(DeclarationError::ComputeShapeOnInput(name.to_string()));
        }

        let shape_spec = if options.shape_by_conn {
            ShapeSpec::ByConn
        } else if let Some(f) = options.compute_shape {
            ShapeSpec::Compute(f)
        } else if let Some(other) = options.copy_shape {
            ShapeSpec::Copy(other)
        } else {
            ShapeSpec::Known
        };

        let val = options.val.unwrap_or_else(|| Array::scalar(1.0));
        let reference = options.reference.unwrap_or(1.0);

        let mut meta = VarMeta {
            name: name.to_string(),
            kind,
            val: val.as_slice().to_vec(),
            shape: Vec::new(),
            size: 0,
            units: options.units,
            desc: options.desc,
            tags,
            primal_name: options.primal_name,
            lower: None,
            upper: None,
            reference,
            reference0: options.reference0.unwrap_or(0.0),
            res_ref: options.res_ref.unwrap_or(reference),
            discrete_val: None,
            shape_spec,
            pending_lower: options.lower,
            pending_upper: options.upper,
        };

        if !meta.shape_spec.is_deferred() {
            let shape = match options.shape {
                Some(shape) => shape,
                None if val.is_scalar() => vec![1],
                None => val.shape().to_vec(),
            };

            meta.resolve_shape(shape)?;
        }

        self.vars.push(meta.clone());
        Ok(meta)
    }

    fn add_discrete(
        &mut self,
        name: &str,
        kind: VarKind,
        options: DiscreteOptions,
    ) -> Result<VarMeta, DeclarationError> {
        self.check_name(name)?;

        let tags = parse_tags(options.tags.as_ref())?;

        let mut meta = VarMeta::new_output(name, Vec::new(), Vec::new());
        meta.kind = kind;
        meta.desc = options.desc;
        meta.tags = tags;
        meta.primal_name = options.primal_name;
        meta.discrete_val = Some(options.val);

        self.vars.push(meta.clone());
        Ok(meta)
    }

    /// Resolves the partial derivative patterns against the declared
    /// variables. Explicit components may only differentiate with respect to
    /// inputs, implicit ones also with respect to outputs.
    pub(crate) fn finish(
        self,
        implicit: bool,
    ) -> Result<(Vec<VarMeta>, Vec<PartialDecl>), DeclarationError> {
        let outputs: Vec<&str> = self
            .vars
            .iter()
            .filter(|v| v.kind == VarKind::Output)
            .map(|v| v.name.as_str())
            .collect();
        let wrts: Vec<&str> = self
            .vars
            .iter()
            .filter(|v| v.kind == VarKind::Input || (implicit && v.kind == VarKind::Output))
            .map(|v| v.name.as_str())
            .collect();

        // Later declarations override earlier ones for the same pair.
        let mut resolved: BTreeMap<(String, String), PartialDecl> = BTreeMap::new();
        let mut order: Vec<(String, String)> = Vec::new();

        for pattern in &self.patterns {
            let of: Vec<&str> = outputs
                .iter()
                .copied()
                .filter(|name| fnmatch(&pattern.of, name))
                .collect();
            let wrt: Vec<&str> = wrts
                .iter()
                .copied()
                .filter(|name| fnmatch(&pattern.wrt, name))
                .collect();

            if of.is_empty() {
                return Err(DeclarationError::PartialsNoMatch {
                    kind: "of",
                    pattern: pattern.of.clone(),
                });
            }
            if wrt.is_empty() {
                return Err(DeclarationError::PartialsNoMatch {
                    kind: "wrt",
                    pattern: pattern.wrt.clone(),
                });
            }

            for o in &of {
                for w in &wrt {
                    let key = (o.to_string(), w.to_string());
                    if !resolved.contains_key(&key) {
                        order.push(key.clone());
                    }
                    resolved.insert(
                        key,
                        PartialDecl {
                            of: o.to_string(),
                            wrt: w.to_string(),
                            method: pattern.options.method,
                            sparsity: pattern
                                .options
                                .rows
                                .clone()
                                .zip(pattern.options.cols.clone()),
                            val: pattern.options.val.clone(),
                        },
                    );
                }
            }
        }

        let partials = order
            .into_iter()
            .filter_map(|key| resolved.remove(&key))
            .collect();

        Ok((self.vars, partials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn add_input_retval() {
        let mut decl = Declarations::new();
        let meta = decl
            .add_input("length", VarOptions::from(3.0).with_units("ft"))
            .unwrap();

        assert_eq!(meta.name(), "length");
        assert_eq!(meta.kind(), VarKind::Input);
        assert_eq!(meta.val(), &[3.0]);
        assert_eq!(meta.shape(), &[1]);
        assert_eq!(meta.size(), 1);
        assert_eq!(meta.units().as_deref(), Some("ft"));
        assert_eq!(meta.desc(), "");
        assert!(meta.tags().is_empty());
    }

    #[test]
    fn add_discrete_input_retval() {
        let mut decl = Declarations::new();
        let meta = decl
            .add_discrete_input("int_in", DiscreteOptions::new(3))
            .unwrap();

        assert_eq!(meta.discrete_val(), &Some(json!(3)));
        assert_eq!(meta.type_name(), Some("int"));
        assert_eq!(meta.desc(), "");
        assert!(meta.tags().is_empty());

        let meta = decl
            .add_discrete_output("flag", DiscreteOptions::new(json!({"a": 1})))
            .unwrap();
        assert_eq!(meta.type_name(), Some("dict"));
    }

    #[test]
    fn scalar_value_broadcasts_to_shape() {
        let mut decl = Declarations::new();
        let meta = decl
            .add_output("y", VarOptions::from(2.0).with_shape([2, 3]))
            .unwrap();

        assert_eq!(meta.shape(), &[2, 3]);
        assert_eq!(meta.size(), 6);
        assert_eq!(meta.val(), &[2.0; 6]);
    }

    #[test]
    fn value_shape_mismatch() {
        let mut decl = Declarations::new();
        let err = decl
            .add_input("x", VarOptions::from(vec![1.0, 2.0]).with_shape([3]))
            .unwrap_err();
        assert!(matches!(err, DeclarationError::ValueShape { expected: 3, got: 2, .. }));
    }

    #[test]
    fn tags_are_normalized() {
        let mut decl = Declarations::new();
        let meta = decl
            .add_input("x", VarOptions::new().with_tags("tag1"))
            .unwrap();
        assert_eq!(meta.tags(), &BTreeSet::from(["tag1".to_string()]));

        let meta = decl
            .add_output("y", VarOptions::new().with_tags(vec!["a", "b", "a"]))
            .unwrap();
        assert_eq!(meta.tags().len(), 2);
    }

    #[test]
    fn tag_item_of_wrong_type() {
        let mut decl = Declarations::new();
        let err = decl
            .add_input("x", VarOptions::new().with_tags(json!(["tag1", {"a": 1}])))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Items in tags should be of type string, but type 'dict' was found."
        );
    }

    #[test]
    fn tags_of_wrong_type() {
        let mut decl = Declarations::new();
        let err = decl
            .add_input("x", VarOptions::new().with_tags(333))
            .unwrap_err();
        assert_eq!(err.to_string(), "The tags argument should be a str, set, or list");

        let err = decl
            .add_discrete_input("d", DiscreteOptions::new(1).with_tags(333))
            .unwrap_err();
        assert_eq!(err, DeclarationError::TagsType);
    }

    #[test]
    fn duplicate_name() {
        let mut decl = Declarations::new();
        decl.add_input("x", 1.0).unwrap();
        let err = decl.add_output("x", 1.0).unwrap_err();
        assert_eq!(err.to_string(), "Variable name 'x' already exists.");
    }

    #[test]
    fn invalid_units() {
        let mut decl = Declarations::new();
        let err = decl
            .add_input("x", VarOptions::new().with_units("furlongs"))
            .unwrap_err();
        assert_eq!(err.to_string(), "The units 'furlongs' are invalid.");
    }

    #[test]
    fn conflicting_shape_strategies() {
        let mut decl = Declarations::new();
        let err = decl
            .add_input(
                "x",
                VarOptions::new().with_shape_by_conn().with_copy_shape("y"),
            )
            .unwrap_err();
        assert_eq!(err, DeclarationError::ConflictingShape("x".to_string()));

        let err = decl
            .add_output("z", VarOptions::new().with_shape([2]).with_shape_by_conn())
            .unwrap_err();
        assert_eq!(err, DeclarationError::ConflictingShape("z".to_string()));
    }

    #[test]
    fn deferred_shape_is_resolved_later() {
        let mut decl = Declarations::new();
        let meta = decl
            .add_input("x", VarOptions::from(0.5).with_shape_by_conn())
            .unwrap();
        assert!(!meta.is_shape_resolved());

        let mut meta = meta;
        meta.resolve_shape(vec![4]).unwrap();
        assert_eq!(meta.val(), &[0.5; 4]);
        assert_eq!(meta.size(), 4);
    }

    #[test]
    fn bounds_are_checked() {
        let mut decl = Declarations::new();
        let meta = decl
            .add_output(
                "y",
                VarOptions::from(vec![1.0, 2.0, 3.0])
                    .with_lower(0.0)
                    .with_upper(vec![5.0, 5.0, 5.0])
                    .with_ref(10.0),
            )
            .unwrap();
        assert_eq!(meta.lower(), &Some(vec![0.0; 3]));
        assert_eq!(meta.res_ref(), 10.0);

        let err = decl
            .add_output("z", VarOptions::from(vec![1.0, 2.0]).with_upper(vec![1.0; 3]))
            .unwrap_err();
        assert!(matches!(err, DeclarationError::BoundSize { bound: "upper", .. }));
    }

    #[test]
    fn partials_patterns() {
        let mut decl = Declarations::new();
        decl.add_input("x1", 1.0).unwrap();
        decl.add_input("x2", 1.0).unwrap();
        decl.add_input("p", 1.0).unwrap();
        decl.add_output("y", 1.0).unwrap();
        decl.declare_partials("y", "x*", PartialOptions::new())
            .unwrap();
        decl.declare_partials(
            "y",
            "x2",
            PartialOptions::new().with_method(PartialMethod::Fd),
        )
        .unwrap();

        let (_, partials) = decl.finish(false).unwrap();
        assert_eq!(partials.len(), 2);
        assert_eq!(partials[0].wrt(), "x1");
        assert_eq!(partials[1].method(), PartialMethod::Fd);
    }

    #[test]
    fn partials_without_match() {
        let mut decl = Declarations::new();
        decl.add_input("x", 1.0).unwrap();
        decl.add_output("y", 1.0).unwrap();
        decl.declare_partials("y", "q", PartialOptions::new())
            .unwrap();
        let err = decl.finish(false).unwrap_err();
        assert_eq!(err.to_string(), "No matches were found for wrt=\"q\"");
    }

    #[test]
    fn explicit_partials_exclude_outputs_from_wrt() {
        let mut decl = Declarations::new();
        decl.add_input("x", 1.0).unwrap();
        decl.add_output("y", 1.0).unwrap();
        decl.declare_partials("y", "y", PartialOptions::new())
            .unwrap();
        assert!(decl.finish(false).is_err());

        let mut decl = Declarations::new();
        decl.add_input("x", 1.0).unwrap();
        decl.add_output("y", 1.0).unwrap();
        decl.declare_partials("y", "*", PartialOptions::new())
            .unwrap();
        let (_, partials) = decl.finish(true).unwrap();
        assert_eq!(partials.len(), 2);
    }

    #[test]
    fn sparse_partials_validation() {
        let mut decl = Declarations::new();
        let err = decl
            .declare_partials(
                "y",
                "x",
                PartialOptions::new().with_sparsity(vec![0, 1], vec![0]),
            )
            .unwrap_err();
        assert!(matches!(err, DeclarationError::SparsityLength { .. }));

        decl.add_input("x", VarOptions::new().with_shape([3])).unwrap();
        decl.add_output("y", VarOptions::new().with_shape([3])).unwrap();
        decl.declare_partials(
            "y",
            "x",
            PartialOptions::new()
                .with_sparsity(vec![0, 1, 2], vec![0, 1, 2])
                .with_val(2.0),
        )
        .unwrap();
        let (_, partials) = decl.finish(false).unwrap();
        assert!(partials[0].validate(3, 3).is_ok());
        assert!(partials[0].validate(2, 3).is_err());
    }
}
