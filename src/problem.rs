//! High-level API for running a model.
//!
//! [`Problem`] owns the model tree and the state created by its setup. The
//! typical session builds the tree, sets it up, sets values of independent
//! variables, runs the model and computes total derivatives:
//!
//! ```rust
//! use mdao::{Group, Mode, Problem};
//! # use mdao::{
//! #     DeclarationError, Declarations, EvalError, ExplicitComponent, PartialOptions, Partials,
//! #     View,
//! # };
//! #
//! # struct Rectangle;
//! #
//! # impl ExplicitComponent for Rectangle {
//! #     fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
//! #         decl.add_input("length", 1.0)?;
//! #         decl.add_input("width", 1.0)?;
//! #         decl.add_output("area", 1.0)?;
//! #         decl.declare_partials("*", "*", PartialOptions::new())
//! #     }
//! #
//! #     fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
//! #         outputs.set_scalar("area", inputs.scalar("length")? * inputs.scalar("width")?)
//! #     }
//! #
//! #     fn compute_partials(
//! #         &mut self,
//! #         inputs: &mut View,
//! #         partials: &mut Partials,
//! #     ) -> Result<(), EvalError> {
//! #         partials.set("area", "length", &[inputs.scalar("width")?])?;
//! #         partials.set("area", "width", &[inputs.scalar("length")?])
//! #     }
//! # }
//!
//! let mut model = Group::new();
//! model.add_explicit("rect", Rectangle).promotes(["*"]);
//!
//! let mut problem = Problem::new(model);
//! problem.setup().unwrap();
//! problem.set_val("length", 3.0).unwrap();
//! problem.set_val("width", 2.0).unwrap();
//! problem.run_model().unwrap();
//!
//! assert_eq!(problem.get_val("area").unwrap().as_slice(), &[6.0]);
//!
//! let totals = problem
//!     .compute_totals_with_mode(&["area"], &["length"], Mode::Rev)
//!     .unwrap();
//! assert_eq!(totals.get("area", "length").unwrap()[(0, 0)], 2.0);
//! ```
//!
//! Names accepted by the problem are promoted names at the root or absolute
//! names. A promoted input fed by an automatic independent output is set
//! through that output, so the value survives runs of the model.

use getset::{CopyGetters, Setters};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::{Array, EvalError, Mode};
use crate::derivatives::PartialCheck;
use crate::group::Group;
use crate::model::{Model, SetupError, AUTO_IVC};
use crate::naming::join;
use crate::recording::{Snapshot, VarEntry};
use crate::reports::{ListOptions, Listing, ListingError};
use crate::sampling::{Case, SamplingError};
use crate::solver::{self, RunReport};
use crate::totals::{self, Totals};
use crate::units::{self, UnitsError};

/// Error returned by [`Problem`] methods.
#[derive(Debug, Error)]
pub enum ProblemError {
    /// Setup of the model failed.
    #[error(transparent)]
    Setup(#[from] SetupError),
    /// Evaluation of the model failed.
    #[error(transparent)]
    Eval(#[from] EvalError),
    /// Units conversion failed.
    #[error(transparent)]
    Units(#[from] UnitsError),
    /// Invalid listing options.
    #[error(transparent)]
    Listing(#[from] ListingError),
    /// Invalid sampling factor.
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    /// The name is neither a promoted nor an absolute variable name.
    #[error("Variable name '{0}' not found.")]
    UnknownName(String),
    /// The operation needs the model to be set up.
    #[error("The problem must be set up first.")]
    NotSetUp,
    /// A continuous operation was requested for a discrete variable, or the
    /// other way around.
    #[error("Variable '{name}' is {actual}, expected {expected}.")]
    KindMismatch {
        /// Name of the variable.
        name: String,
        /// What the variable is.
        actual: &'static str,
        /// What the operation needs.
        expected: &'static str,
    },
    /// The number of values does not fit the variable.
    #[error("Expected {expected} value(s) for '{name}' but got {got}.")]
    SizeMismatch {
        /// Name of the variable.
        name: String,
        /// Expected number of values.
        expected: usize,
        /// Number of given values.
        got: usize,
    },
    /// An index is out of the variable.
    #[error("Index {index} is out of bounds for '{name}' with size {size}.")]
    IndexOutOfBounds {
        /// Name of the variable.
        name: String,
        /// The index.
        index: usize,
        /// Size of the variable.
        size: usize,
    },
    /// Units were given for a variable without units.
    #[error("Can't express variable '{name}' with units of '{units}' because it has no units.")]
    NoUnits {
        /// Name of the variable.
        name: String,
        /// The requested units.
        units: String,
    },
}

/// Options for [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters, Setters, Serialize, Deserialize)]
#[getset(get_copy = "pub", set = "pub")]
#[serde(default)]
pub struct ProblemOptions {
    /// Mode of [`compute_totals`](Problem::compute_totals). Default:
    /// [`Mode::Fwd`].
    mode: Mode,
    /// Fail the setup if an input has neither a source nor input defaults.
    /// Default: `false`.
    require_input_defaults: bool,
}

impl Default for ProblemOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Fwd,
            require_input_defaults: false,
        }
    }
}

/// What a name refers to.
enum Target {
    Output(String),
    /// Inputs promoted to the same name, in tree order.
    Inputs(Vec<String>),
}

fn is_auto_ivc(abs: &str) -> bool {
    abs.strip_prefix(AUTO_IVC)
        .map_or(false, |rest| rest.starts_with('.'))
}

fn target(model: &Model, name: &str) -> Result<Target, ProblemError> {
    let root = model.naming.root();
    if let Some(abs) = root.outputs.get(name) {
        return Ok(Target::Output(abs.clone()));
    }
    if let Some(inputs) = root.inputs.get(name) {
        return Ok(Target::Inputs(inputs.clone()));
    }

    match model.meta(name) {
        Some(meta) if meta.kind().is_input() => Ok(Target::Inputs(vec![name.to_string()])),
        Some(_) => Ok(Target::Output(name.to_string())),
        None => Err(ProblemError::UnknownName(name.to_string())),
    }
}

/// Absolute name of the variable holding the value of a name.
fn holder(model: &Model, name: &str) -> Result<String, ProblemError> {
    Ok(match target(model, name)? {
        Target::Output(abs) => abs,
        Target::Inputs(mut inputs) => inputs.swap_remove(0),
    })
}

/// Absolute name of the output a name refers to, following connections of
/// inputs.
fn source(model: &Model, name: &str) -> Result<String, ProblemError> {
    match target(model, name)? {
        Target::Output(abs) => Ok(abs),
        Target::Inputs(inputs) => model
            .conns
            .sources
            .get(&inputs[0])
            .cloned()
            .ok_or_else(|| ProblemError::UnknownName(name.to_string())),
    }
}

fn kind_mismatch(name: &str, discrete: bool) -> ProblemError {
    let (actual, expected) = if discrete {
        ("discrete", "continuous")
    } else {
        ("continuous", "discrete")
    };
    ProblemError::KindMismatch {
        name: name.to_string(),
        actual,
        expected,
    }
}

/// Broadcasts a value to the size of a variable and converts it from given
/// units to the units of the variable.
fn prepare(
    model: &Model,
    abs: &str,
    name: &str,
    val: &Array,
    units: Option<&str>,
) -> Result<Vec<f64>, ProblemError> {
    let meta = model
        .meta(abs)
        .ok_or_else(|| ProblemError::UnknownName(name.to_string()))?;
    if meta.kind().is_discrete() {
        return Err(kind_mismatch(name, true));
    }

    let values = val
        .broadcast(meta.size())
        .ok_or_else(|| ProblemError::SizeMismatch {
            name: name.to_string(),
            expected: meta.size(),
            got: val.size(),
        })?;

    match units {
        None => Ok(values),
        Some(from) => {
            let to = meta.units().as_deref().ok_or_else(|| ProblemError::NoUnits {
                name: name.to_string(),
                units: from.to_string(),
            })?;
            let (scale, shift) = units::conversion(from, to)?;
            Ok(values.into_iter().map(|v| scale * v + shift).collect())
        }
    }
}

/// Copies the value of a source output into all inputs connected to it.
fn propagate(model: &mut Model, src: &str) -> Result<(), ProblemError> {
    let targets: Vec<(String, f64, f64)> = model
        .conns
        .sources
        .iter()
        .filter(|(_, s)| s.as_str() == src)
        .filter_map(|(tgt, _)| {
            let &(c, v) = model.index.get(tgt)?;
            let info = &model.comps[c];
            let name = info.vars[v].name();
            if info.vars[v].kind().is_discrete() {
                return Some((tgt.clone(), 1.0, 0.0));
            }
            info.sources
                .iter()
                .find(|s| info.inputs.slots[s.slot].name == *name)
                .map(|s| (tgt.clone(), s.scale, s.shift))
        })
        .collect();

    if let Some(value) = model.read_discrete(src).cloned() {
        for (tgt, _, _) in targets {
            model.write_discrete(&tgt, value.clone())?;
        }
        return Ok(());
    }

    let values = model.read(src).map(<[f64]>::to_vec).unwrap_or_default();
    for (tgt, scale, shift) in targets {
        let converted: Vec<f64> = values.iter().map(|v| scale * v + shift).collect();
        model.write(&tgt, &converted)?;
    }
    Ok(())
}

/// A model tree together with the state of its setup.
///
/// See [module](self) documentation for more details.
pub struct Problem {
    root: Group,
    model: Option<Model>,
    options: ProblemOptions,
}

impl Problem {
    /// Creates the problem with default options.
    pub fn new(root: Group) -> Self {
        Self::with_options(root, ProblemOptions::default())
    }

    /// Creates the problem with given options.
    pub fn with_options(root: Group, options: ProblemOptions) -> Self {
        Self {
            root,
            model: None,
            options,
        }
    }

    /// The options.
    pub fn options(&self) -> &ProblemOptions {
        &self.options
    }

    /// The options, mutably.
    pub fn options_mut(&mut self) -> &mut ProblemOptions {
        &mut self.options
    }

    /// The model tree.
    pub fn root(&self) -> &Group {
        &self.root
    }

    /// The model tree, mutably. Changes take effect after the next
    /// [`setup`](Problem::setup).
    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    /// Returns `true` once the problem was successfully set up.
    pub fn is_set_up(&self) -> bool {
        self.model.is_some()
    }

    /// Sets up the model. It can be called repeatedly, every call rebuilds
    /// everything from the tree and resets the values to their defaults.
    pub fn setup(&mut self) -> Result<(), ProblemError> {
        self.model = None;
        let model = Model::setup(&mut self.root, self.options.require_input_defaults)?;
        debug!("problem set up with {} blocks", model.blocks.len());
        self.model = Some(model);
        Ok(())
    }

    fn model(&self) -> Result<&Model, ProblemError> {
        self.model.as_ref().ok_or(ProblemError::NotSetUp)
    }

    fn model_mut(&mut self) -> Result<&mut Model, ProblemError> {
        self.model.as_mut().ok_or(ProblemError::NotSetUp)
    }

    /// Sets the value of a continuous variable, in its own units.
    pub fn set_val(&mut self, name: &str, val: impl Into<Array>) -> Result<(), ProblemError> {
        self.set(name, &val.into(), None)
    }

    /// Sets the value of a continuous variable given in other units.
    pub fn set_val_with_units(
        &mut self,
        name: &str,
        val: impl Into<Array>,
        units: &str,
    ) -> Result<(), ProblemError> {
        self.set(name, &val.into(), Some(units))
    }

    fn set(&mut self, name: &str, val: &Array, units: Option<&str>) -> Result<(), ProblemError> {
        let model = self.model_mut()?;

        let abs = match target(model, name)? {
            Target::Output(abs) => vec![abs],
            Target::Inputs(inputs) => match model.conns.sources.get(&inputs[0]) {
                Some(src) if is_auto_ivc(src) => {
                    let src = src.clone();
                    let values = prepare(model, &src, name, val, units)?;
                    model.write(&src, &values)?;
                    return propagate(model, &src);
                }
                _ => inputs,
            },
        };

        for abs in abs {
            let values = prepare(model, &abs, name, val, units)?;
            model.write(&abs, &values)?;
        }
        Ok(())
    }

    /// Value of a continuous variable in its own units.
    pub fn get_val(&self, name: &str) -> Result<Array, ProblemError> {
        let model = self.model()?;
        let abs = holder(model, name)?;
        let meta = model
            .meta(&abs)
            .ok_or_else(|| ProblemError::UnknownName(name.to_string()))?;
        let values = model
            .read(&abs)
            .ok_or_else(|| kind_mismatch(name, true))?
            .to_vec();

        Ok(Array::from_shape_vec(meta.shape().clone(), values.clone())
            .unwrap_or_else(|| Array::from(values)))
    }

    /// Value of a continuous variable converted to given units.
    pub fn get_val_with_units(&self, name: &str, units: &str) -> Result<Array, ProblemError> {
        let model = self.model()?;
        let abs = holder(model, name)?;
        let from = model
            .meta(&abs)
            .and_then(|meta| meta.units().clone())
            .ok_or_else(|| ProblemError::NoUnits {
                name: name.to_string(),
                units: units.to_string(),
            })?;
        let (scale, shift) = units::conversion(&from, units)?;

        let val = self.get_val(name)?;
        let shape = val.shape().to_vec();
        let values: Vec<f64> = val.into_vec().into_iter().map(|v| scale * v + shift).collect();
        Ok(Array::from_shape_vec(shape, values.clone()).unwrap_or_else(|| Array::from(values)))
    }

    /// Sets the value of a discrete variable.
    pub fn set_discrete(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ProblemError> {
        let value = value.into();
        let model = self.model_mut()?;

        let abs = match target(model, name)? {
            Target::Output(abs) => vec![abs],
            Target::Inputs(inputs) => match model.conns.sources.get(&inputs[0]) {
                Some(src) if is_auto_ivc(src) => vec![src.clone()],
                _ => inputs,
            },
        };

        for abs in &abs {
            let discrete = model.meta(abs).map_or(false, |m| m.kind().is_discrete());
            if !discrete {
                return Err(kind_mismatch(name, false));
            }
            model.write_discrete(abs, value.clone())?;
            if is_auto_ivc(abs) {
                propagate(model, abs)?;
            }
        }
        Ok(())
    }

    /// Value of a discrete variable.
    pub fn get_discrete(&self, name: &str) -> Result<Value, ProblemError> {
        let model = self.model()?;
        let abs = holder(model, name)?;
        model
            .read_discrete(&abs)
            .cloned()
            .ok_or_else(|| kind_mismatch(name, false))
    }

    /// Runs the model: evaluates all components in execution order and
    /// converges coupled blocks.
    pub fn run_model(&mut self) -> Result<RunReport, ProblemError> {
        let model = self.model.as_mut().ok_or(ProblemError::NotSetUp)?;
        Ok(solver::run_model(model, &mut self.root)?)
    }

    /// Evaluates the residuals of all components at the current values.
    pub fn run_apply_nonlinear(&mut self) -> Result<(), ProblemError> {
        let model = self.model.as_mut().ok_or(ProblemError::NotSetUp)?;
        for c in 0..model.comps.len() {
            model.run_apply(&mut self.root, c)?;
        }
        Ok(())
    }

    /// Computes total derivatives in the mode given by the options.
    pub fn compute_totals(&mut self, of: &[&str], wrt: &[&str]) -> Result<Totals, ProblemError> {
        self.compute_totals_with_mode(of, wrt, self.options.mode)
    }

    /// Computes total derivatives of responses `of` with respect to design
    /// variables `wrt` at the current point. Inputs are replaced by their
    /// sources.
    pub fn compute_totals_with_mode(
        &mut self,
        of: &[&str],
        wrt: &[&str],
        mode: Mode,
    ) -> Result<Totals, ProblemError> {
        let model = self.model.as_mut().ok_or(ProblemError::NotSetUp)?;

        let resolve = |names: &[&str]| {
            names
                .iter()
                .map(|&name| {
                    let abs = source(model, name)?;
                    match model.locate(&abs) {
                        Some(loc) if !loc.kind.is_discrete() => Ok((name.to_string(), loc.range)),
                        Some(_) => Err(kind_mismatch(name, true)),
                        None => Err(ProblemError::UnknownName(name.to_string())),
                    }
                })
                .collect::<Result<Vec<_>, ProblemError>>()
        };
        let of = resolve(of)?;
        let wrt = resolve(wrt)?;

        Ok(totals::compute(model, &mut self.root, &of, &wrt, mode)?)
    }

    /// Compares the partial derivatives of all components with finite
    /// differences at the current point.
    pub fn check_partials(&mut self) -> Result<Vec<PartialCheck>, ProblemError> {
        let model = self.model.as_mut().ok_or(ProblemError::NotSetUp)?;
        Ok(model.check_partials(&mut self.root)?)
    }

    /// Value and metadata of every variable in tree order.
    pub fn snapshot(&self) -> Result<Snapshot, ProblemError> {
        let model = self.model()?;
        let mut vars = Vec::new();

        for info in &model.comps {
            for meta in &info.vars {
                let abs = join(info.path(), meta.name());
                let prom_name = model.naming.prom_name(&abs).unwrap_or(abs.as_str()).to_string();

                vars.push(VarEntry {
                    prom_name,
                    kind: meta.kind(),
                    explicit: !model.is_implicit(&abs),
                    val: model.read(&abs).map(<[f64]>::to_vec).unwrap_or_default(),
                    discrete_val: model.read_discrete(&abs).cloned(),
                    resids: model.read_residuals(&abs).map(<[f64]>::to_vec),
                    units: meta.units().clone(),
                    shape: meta.shape().clone(),
                    desc: meta.desc().clone(),
                    tags: meta.tags().clone(),
                    lower: meta.lower().clone(),
                    upper: meta.upper().clone(),
                    reference: meta.reference(),
                    reference0: meta.reference0(),
                    res_ref: meta.res_ref(),
                    abs_name: abs,
                });
            }
        }

        Ok(Snapshot::new(vars))
    }

    /// Lists inputs, see [`ListOptions`].
    pub fn list_inputs(&self, options: &ListOptions) -> Result<Vec<Listing>, ProblemError> {
        Ok(self.snapshot()?.list_inputs(options)?)
    }

    /// Lists outputs, see [`ListOptions`].
    pub fn list_outputs(&self, options: &ListOptions) -> Result<Vec<Listing>, ProblemError> {
        Ok(self.snapshot()?.list_outputs(options)?)
    }

    /// Applies values of a case produced by a sampling driver.
    pub fn apply_case(&mut self, case: &Case) -> Result<(), ProblemError> {
        for (name, value) in case {
            let units = value.units.as_deref();

            let val = match &value.indices {
                None => value.val.clone(),
                Some(indices) => {
                    let current = match units {
                        Some(units) => self.get_val_with_units(name, units)?,
                        None => self.get_val(name)?,
                    };
                    let mut current = current.into_vec();
                    let size = current.len();

                    let new = value.val.broadcast(indices.len()).ok_or_else(|| {
                        ProblemError::SizeMismatch {
                            name: name.clone(),
                            expected: indices.len(),
                            got: value.val.size(),
                        }
                    })?;
                    for (&index, v) in indices.iter().zip(new) {
                        let slot = current.get_mut(index).ok_or_else(|| {
                            ProblemError::IndexOutOfBounds {
                                name: name.clone(),
                                index,
                                size,
                            }
                        })?;
                        *slot = v;
                    }
                    Array::from(current)
                }
            };

            self.set(name, &val, units)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::core::{
        AnalysisError, DeclarationError, Declarations, ExplicitComponent, ImplicitComponent,
        PartialOptions, VarOptions,
    };
    use crate::group::InputDefaults;
    use crate::partials::Partials;
    use crate::sampling::CaseValue;
    use crate::solver::{BlockGsOptions, NewtonOptions};
    use crate::testing::*;
    use crate::vectors::View;

    fn rectangles(comp: fn() -> RectangleComp) -> Problem {
        let mut model = Group::new();
        model.add_explicit("r1", comp()).promotes_inputs(["length", "width"]);
        model.add_explicit("r2", comp()).promotes_inputs(["length", "width"]);
        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem
    }

    #[test]
    fn rectangles_share_promoted_inputs() {
        let mut problem = rectangles(RectangleComp::new);
        problem.set_val("length", 3.0).unwrap();
        problem.set_val("width", 2.0).unwrap();
        problem.run_model().unwrap();

        assert_abs_diff_eq!(problem.get_val("r1.area").unwrap().as_slice()[0], 6.0);
        assert_abs_diff_eq!(problem.get_val("r2.area").unwrap().as_slice()[0], 6.0);

        for mode in [Mode::Fwd, Mode::Rev] {
            let totals = problem
                .compute_totals_with_mode(&["r1.area", "r2.area"], &["length", "width"], mode)
                .unwrap();
            assert_eq!(totals.len(), 4);
            assert_abs_diff_eq!(totals.get("r1.area", "length").unwrap()[(0, 0)], 2.0);
            assert_abs_diff_eq!(totals.get("r2.area", "width").unwrap()[(0, 0)], 3.0);
        }
    }

    #[test]
    fn matrix_free_and_primal_rectangles_agree() {
        for comp in [RectangleComp::matrix_free, RectangleComp::primal] {
            let mut problem = rectangles(comp);
            problem.set_val("length", 3.0).unwrap();
            problem.set_val("width", 2.0).unwrap();
            problem.run_model().unwrap();
            assert_abs_diff_eq!(problem.get_val("r2.area").unwrap().as_slice()[0], 6.0);

            for mode in [Mode::Fwd, Mode::Rev] {
                let totals = problem
                    .compute_totals_with_mode(&["r1.area"], &["length", "width"], mode)
                    .unwrap();
                assert_abs_diff_eq!(
                    totals.get("r1.area", "length").unwrap()[(0, 0)],
                    2.0,
                    epsilon = 1e-6
                );
                assert_abs_diff_eq!(
                    totals.get("r1.area", "width").unwrap()[(0, 0)],
                    3.0,
                    epsilon = 1e-6
                );
            }
        }
    }

    #[test]
    fn tags_with_non_string_item() {
        let mut model = Group::new();
        model.add_explicit("comp", TaggedComp::new(serde_json::json!(["a", {}])));
        let mut problem = Problem::new(model);

        match problem.setup().unwrap_err() {
            ProblemError::Setup(SetupError::Declaration { source, path, .. }) => {
                assert_eq!(path, "comp");
                assert_eq!(
                    source.to_string(),
                    "Items in tags should be of type string, but type 'dict' was found."
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!problem.is_set_up());
    }

    #[test]
    fn lock_is_released_after_failed_evaluation() {
        let mut model = Group::new();
        model.add_explicit("bad", FailingComp::new()).promotes(["*"]);
        let mut problem = Problem::new(model);
        problem.setup().unwrap();

        let err = problem.run_model().unwrap_err();
        assert!(matches!(err, ProblemError::Eval(EvalError::Analysis(_))));

        // The output written before the failure was not committed.
        assert_abs_diff_eq!(problem.get_val("y").unwrap().as_slice()[0], 1.0);

        problem.set_val("x", 5.0).unwrap();
        problem.set_val("bad.x", 6.0).unwrap();
        assert_abs_diff_eq!(problem.get_val("x").unwrap().as_slice()[0], 6.0);
    }

    #[test]
    fn writing_inputs_inside_compute_fails() {
        let mut model = Group::new();
        model.add_explicit("comp", InputWriterComp);
        let mut problem = Problem::new(model);
        problem.setup().unwrap();

        let err = problem.run_model().unwrap_err();
        assert_eq!(
            err.to_string(),
            "'comp' <class InputWriterComp>: Attempt to set value of 'x' in input vector when it is read only."
        );

        problem.set_val("comp.x", 2.0).unwrap();
    }

    #[test]
    fn forward_and_reverse_totals_agree() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..5 {
            let mut model = Group::new();
            model.add_explicit("p", Paraboloid).promotes(["*"]);
            model
                .add_explicit("r", RectangleComp::new())
                .promotes_inputs([("width", "x")])
                .promotes_outputs(["area"]);
            model.connect("f_xy", "r.length");
            model.set_input_defaults("x", InputDefaults::new().with_val(1.0));

            let mut problem = Problem::new(model);
            problem.setup().unwrap();
            problem.set_val("x", rng.gen_range(-5.0..5.0)).unwrap();
            problem.set_val("y", rng.gen_range(-5.0..5.0)).unwrap();
            problem.run_model().unwrap();

            let of = ["f_xy", "area"];
            let wrt = ["x", "y"];
            let fwd = problem.compute_totals_with_mode(&of, &wrt, Mode::Fwd).unwrap();
            let rev = problem.compute_totals_with_mode(&of, &wrt, Mode::Rev).unwrap();

            for ((key, f), (_, r)) in fwd.iter().zip(rev.iter()) {
                assert_relative_eq!(f, r, max_relative = 1e-6, epsilon = 1e-12);
                assert!(key.0 == "f_xy" || key.0 == "area");
            }
        }
    }

    #[test]
    fn sellar_converges_with_both_solvers() {
        for solver in [
            BlockGsOptions::default().set_maxiter(50).to_owned().into(),
            NewtonOptions::default().set_maxiter(20).to_owned().into(),
        ] {
            let mut problem = Problem::new(sellar(Some(solver)));
            problem.setup().unwrap();
            let report = problem.run_model().unwrap();

            assert!(report.converged());
            assert_relative_eq!(
                problem.get_val("y1").unwrap().as_slice()[0],
                25.58830237,
                epsilon = 1e-6
            );
            assert_relative_eq!(
                problem.get_val("y2").unwrap().as_slice()[0],
                12.05848815,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn coupled_totals_match_finite_differences() {
        let solver = NewtonOptions::default()
            .set_maxiter(30)
            .set_atol(1e-14)
            .to_owned();
        let mut problem = Problem::new(sellar(Some(solver.into())));
        problem.setup().unwrap();
        problem.run_model().unwrap();

        let fwd = problem.compute_totals_with_mode(&["y1", "y2"], &["x", "z"], Mode::Fwd).unwrap();
        let rev = problem.compute_totals_with_mode(&["y1", "y2"], &["x", "z"], Mode::Rev).unwrap();

        let h = 1e-6;
        let at = |problem: &mut Problem, x: f64| {
            problem.set_val("x", x).unwrap();
            problem.run_model().unwrap();
            problem.get_val("y1").unwrap().as_slice()[0]
        };
        let fd = (at(&mut problem, 1.0 + h) - at(&mut problem, 1.0 - h)) / (2.0 * h);

        assert_relative_eq!(fwd.get("y1", "x").unwrap()[(0, 0)], fd, max_relative = 1e-4);
        assert_relative_eq!(rev.get("y1", "x").unwrap()[(0, 0)], fd, max_relative = 1e-4);
        assert_relative_eq!(
            fwd.get("y2", "z").unwrap(),
            rev.get("y2", "z").unwrap(),
            max_relative = 1e-8
        );
    }

    #[test]
    fn setup_is_idempotent() {
        let mut problem = Problem::new(sellar(None));
        problem.setup().unwrap();
        let naming = problem.model().unwrap().naming.clone();
        let sources = problem.model().unwrap().conns.sources.clone();

        problem.setup().unwrap();
        assert_eq!(problem.model().unwrap().naming, naming);
        assert_eq!(problem.model().unwrap().conns.sources, sources);
    }

    #[test]
    fn residuals_tolerance_filters_outputs() {
        let mut model = Group::new();
        model.add_explicit("d", DoubleComp).promotes(["*"]);
        model.add_implicit("i", PartialSolveComp).promotes(["*"]);
        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem.run_model().unwrap();

        let outputs = problem
            .list_outputs(&ListOptions::new().with_residuals_tol(1e-2).with_residuals(true))
            .unwrap();
        let names: Vec<&str> = outputs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["i.z2", "i.z3"]);

        let resids = outputs[0].1.resids().clone().unwrap();
        assert_abs_diff_eq!(resids[0], -3.0);
    }

    #[test]
    fn apply_nonlinear_refreshes_residuals() {
        let mut model = Group::new();
        model.add_implicit("i", PartialSolveComp).promotes(["*"]);
        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem.set_val("a", 2.0).unwrap();
        problem.run_apply_nonlinear().unwrap();

        let snapshot = problem.snapshot().unwrap();
        let resids = |name: &str| snapshot.get(name).unwrap().resids().clone().unwrap()[0];
        assert_abs_diff_eq!(resids("i.z1"), -2.0);
        assert_abs_diff_eq!(resids("i.z2"), -3.0);
        assert_abs_diff_eq!(resids("i.z3"), 3.0);
    }

    #[test]
    fn listing_order_and_snapshot_reload() {
        let mut problem = Problem::new(sellar(None));
        problem.setup().unwrap();
        let inputs = problem.list_inputs(&ListOptions::new()).unwrap();
        let names: Vec<&str> = inputs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["d1.z", "d1.x", "d1.y2", "d2.z", "d2.y1"]);

        let mut problem = rectangles(RectangleComp::new);
        problem.set_val("length", 3.0).unwrap();
        problem.set_val("width", 2.0).unwrap();
        problem.run_model().unwrap();

        let options = ListOptions::new().with_units(true).with_shape(true).with_residuals(true);
        let inputs = problem.list_inputs(&options).unwrap();
        assert_eq!(inputs.len(), 4);

        let json = problem.snapshot().unwrap().to_json().unwrap();
        let reloaded = Snapshot::from_json(&json).unwrap();
        assert_eq!(reloaded.list_inputs(&options).unwrap(), inputs);
        assert_eq!(
            reloaded.list_outputs(&options).unwrap(),
            problem.list_outputs(&options).unwrap()
        );
    }

    #[test]
    fn units_conversion() {
        let mut model = Group::new();
        model.add_explicit("src", UnitsComp::new("m", "m")).promotes_inputs([("x", "a")]);
        model.add_explicit("tgt", UnitsComp::new("cm", "cm"));
        model.connect("src.y", "tgt.x");

        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem.set_val_with_units("a", 300.0, "cm").unwrap();
        assert_abs_diff_eq!(problem.get_val("a").unwrap().as_slice()[0], 3.0);

        problem.run_model().unwrap();
        assert_abs_diff_eq!(problem.get_val("tgt.x").unwrap().as_slice()[0], 300.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            problem.get_val_with_units("tgt.y", "m").unwrap().as_slice()[0],
            3.0,
            epsilon = 1e-12
        );

        // Derivatives are scaled by the conversion factor.
        let totals = problem.compute_totals(&["tgt.y"], &["a"]).unwrap();
        assert_abs_diff_eq!(totals.get("tgt.y", "a").unwrap()[(0, 0)], 100.0, epsilon = 1e-9);
    }

    #[test]
    fn input_defaults_units() {
        let mut model = Group::new();
        model.add_explicit("c1", UnitsComp::new("m", "m")).promotes_inputs([("x", "a")]);
        model.add_explicit("c2", UnitsComp::new("cm", "cm")).promotes_inputs([("x", "a")]);
        model.set_input_defaults("a", InputDefaults::new().with_val(2.0).with_units("m"));

        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem.run_model().unwrap();

        assert_abs_diff_eq!(problem.get_val("c1.y").unwrap().as_slice()[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(problem.get_val("c2.y").unwrap().as_slice()[0], 200.0, epsilon = 1e-9);
    }

    #[test]
    fn apply_case_with_indices() {
        let mut model = Group::new();
        model.add_explicit("v", VectorSum::new(3)).promotes(["*"]);
        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem.set_val("x", vec![1.0, 2.0, 3.0]).unwrap();

        let mut case = Case::new();
        case.insert("x".to_string(), CaseValue::new(vec![10.0, 30.0]).with_indices(vec![0, 2]));
        problem.apply_case(&case).unwrap();
        problem.run_model().unwrap();

        assert_eq!(problem.get_val("x").unwrap().as_slice(), &[10.0, 2.0, 30.0]);
        assert_abs_diff_eq!(problem.get_val("total").unwrap().as_slice()[0], 42.0);

        case.insert("x".to_string(), CaseValue::new(1.0).with_indices(vec![3]));
        assert!(matches!(
            problem.apply_case(&case),
            Err(ProblemError::IndexOutOfBounds { index: 3, size: 3, .. })
        ));
    }

    #[test]
    fn unknown_names_and_missing_setup() {
        let mut problem = rectangles(RectangleComp::new);
        assert!(matches!(
            problem.set_val("nope", 1.0),
            Err(ProblemError::UnknownName(ref name)) if name == "nope"
        ));
        assert!(matches!(
            problem.set_val("length", vec![1.0, 2.0]),
            Err(ProblemError::SizeMismatch { expected: 1, got: 2, .. })
        ));

        let mut fresh = Problem::new(Group::new());
        assert!(matches!(fresh.run_model(), Err(ProblemError::NotSetUp)));
    }

    #[test]
    fn discrete_values_flow_through_connections() {
        let mut model = Group::new();
        model.add_explicit("d", DiscreteComp).promotes(["*"]);
        let mut problem = Problem::new(model);
        problem.setup().unwrap();

        problem.set_discrete("n", 4).unwrap();
        problem.run_model().unwrap();
        assert_eq!(problem.get_discrete("label").unwrap(), Value::from("n=4"));
        assert!(matches!(
            problem.set_val("n", 1.0),
            Err(ProblemError::KindMismatch { .. })
        ));
    }

    #[test]
    fn partials_check_out() {
        let mut problem = rectangles(RectangleComp::new);
        problem.set_val("length", 3.0).unwrap();
        problem.set_val("width", 2.0).unwrap();
        problem.run_model().unwrap();

        let checks = problem.check_partials().unwrap();
        assert_eq!(checks.len(), 4);
        assert!(checks.iter().all(|c| c.is_within(1e-5, 1e-5)));
    }

    struct LogComp;

    impl ImplicitComponent for LogComp {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("b", 0.0)?;
            decl.add_output("y", 10.0)?;
            decl.declare_partials("y", "*", PartialOptions::new())
        }

        fn apply_nonlinear(
            &mut self,
            inputs: &mut View,
            outputs: &mut View,
            residuals: &mut View,
        ) -> Result<(), EvalError> {
            let y = outputs.scalar("y")?;
            if y <= 0.0 {
                return Err(AnalysisError::new("logarithm of a non-positive number").into());
            }
            residuals.set_scalar("y", y.ln() - inputs.scalar("b")?)
        }

        fn linearize(
            &mut self,
            _inputs: &mut View,
            outputs: &mut View,
            partials: &mut Partials,
        ) -> Result<(), EvalError> {
            partials.set("y", "y", &[1.0 / outputs.scalar("y")?])?;
            partials.set("y", "b", &[-1.0])
        }
    }

    #[test]
    fn newton_backtracks_on_analysis_errors() {
        let mut model = Group::new();
        model.add_implicit("log", LogComp);
        model.set_nonlinear_solver(NewtonOptions::default().set_maxiter(30).to_owned());

        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        let report = problem.run_model().unwrap();

        assert!(report.converged());
        assert_abs_diff_eq!(problem.get_val("log.y").unwrap().as_slice()[0], 1.0, epsilon = 1e-8);

        // dy/db = y at the solution.
        let totals = problem.compute_totals(&["log.y"], &["log.b"]).unwrap();
        assert_abs_diff_eq!(totals.get("log.y", "log.b").unwrap()[(0, 0)], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn non_convergence_is_reported() {
        let mut problem = Problem::new(sellar(Some(
            BlockGsOptions::default().set_maxiter(2).to_owned().into(),
        )));
        problem.setup().unwrap();
        let report = problem.run_model().unwrap();
        assert!(!report.converged());

        let mut strict = Problem::new(sellar(Some(
            BlockGsOptions::default()
                .set_maxiter(2)
                .set_err_on_non_convergence(true)
                .to_owned()
                .into(),
        )));
        strict.setup().unwrap();
        assert!(matches!(
            strict.run_model(),
            Err(ProblemError::Eval(EvalError::NonConvergence { iterations: 2, .. }))
        ));
    }

    #[test]
    fn options_from_json() {
        let options: ProblemOptions =
            serde_json::from_str(r#"{"mode": "rev", "require_input_defaults": true}"#).unwrap();
        assert_eq!(options.mode(), Mode::Rev);
        assert!(options.require_input_defaults());

        let mut model = Group::new();
        model.add_explicit("c", VectorSum::new(2));
        let mut problem = Problem::with_options(model, options);
        assert!(matches!(
            problem.setup(),
            Err(ProblemError::Setup(SetupError::MissingInputDefaults(_)))
        ));
    }

    struct Ramp;

    impl ExplicitComponent for Ramp {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("s", 1.0)?;
            decl.add_output("y", VarOptions::new().with_shape([4]))?;
            Ok(())
        }

        fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
            let s = inputs.scalar("s")?;
            outputs.set("y", &[0.0, s, 2.0 * s, 3.0 * s])
        }
    }

    #[test]
    fn shapes_follow_connections() {
        let mut model = Group::new();
        model.add_explicit("ramp", Ramp).promotes_inputs(["s"]);
        model.add_explicit("copy", ScaledCopy::new(2.0)).promotes_outputs([("y", "scaled")]);
        model.connect("ramp.y", "copy.x");

        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem.set_val("s", 1.5).unwrap();
        problem.run_model().unwrap();

        let scaled = problem.get_val("scaled").unwrap();
        assert_eq!(scaled.shape(), &[4]);
        assert_eq!(scaled.as_slice(), &[0.0, 3.0, 6.0, 9.0]);
    }
}
