#![allow(clippy::type_complexity)]
#![warn(missing_docs)]

//! # Mdao
//!
//! A pure Rust core of a framework for multidisciplinary design analysis and
//! optimization.
//!
//! Models are trees of [groups](Group) whose leaves are components. Each
//! component declares named, shaped and unit-annotated variables and either
//! computes its outputs from its inputs ([`ExplicitComponent`]) or drives its
//! own residuals to zero ([`ImplicitComponent`]). The framework resolves
//! promoted names and connections, converts units between connected
//! variables, converges coupled components with nonlinear solvers and
//! computes total derivatives in forward or reverse mode.
//!
//! ## Problem
//!
//! Every output `y` of a model has a residual. For explicit components the
//! residual is `R(y) = y - f(x)`, for implicit components it is given by the
//! component itself. Running the model means finding outputs such that
//!
//! ```text
//! R(x, y) = 0
//! ```
//!
//! for the current values of independent inputs `x`. Components that do not
//! depend on each other in a cycle are simply evaluated in dependency order.
//! Strongly connected sets of components are converged by
//! [nonlinear block Gauss-Seidel](solver::BlockGaussSeidel) or
//! [Newton's method](solver::Newton).
//!
//! Total derivatives `dy/dx` are obtained from the linearized residuals by
//! solving one linear system per design variable (forward mode) or one per
//! response (reverse mode). Both modes give the same result.
//!
//! ## Usage
//!
//! ```rust
//! use mdao::{
//!     DeclarationError, Declarations, EvalError, ExplicitComponent, Group, Mode,
//!     PartialOptions, Partials, Problem, View,
//! };
//!
//! struct Doubler;
//!
//! impl ExplicitComponent for Doubler {
//!     fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
//!         decl.add_input("x", 1.0)?;
//!         decl.add_output("y", 1.0)?;
//!         decl.declare_partials("y", "x", PartialOptions::new().with_val(2.0))
//!     }
//!
//!     fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
//!         outputs.set_scalar("y", 2.0 * inputs.scalar("x")?)
//!     }
//! }
//!
//! let mut model = Group::new();
//! model.add_explicit("first", Doubler).promotes_inputs(["x"]);
//! model.add_explicit("second", Doubler).promotes_outputs(["y"]);
//! model.connect("first.y", "second.x");
//!
//! let mut problem = Problem::new(model);
//! problem.setup().expect("invalid model");
//! problem.set_val("x", 3.0).expect("unknown variable");
//! problem.run_model().expect("evaluation failed");
//!
//! assert_eq!(problem.get_val("y").unwrap().as_slice(), &[12.0]);
//!
//! let totals = problem
//!     .compute_totals_with_mode(&["y"], &["x"], Mode::Rev)
//!     .expect("linear solve failed");
//! assert_eq!(totals.get("y", "x").unwrap()[(0, 0)], 4.0);
//! ```
//!
//! ## License
//!
//! Licensed under MIT.

mod connections;
mod core;
pub mod derivatives;
mod group;
mod model;
mod naming;
mod partials;
mod problem;
pub mod recording;
pub mod reports;
pub mod sampling;
mod shapes;
pub mod solver;
mod totals;
pub mod units;
mod vectors;

pub use core::*;
pub use derivatives::PartialCheck;
pub use group::{Group, InputDefaults, Promote, Promotes, Subsystem};
pub use model::SetupError;
pub use naming::fnmatch;
pub use partials::Partials;
pub use problem::{Problem, ProblemError, ProblemOptions};
pub use recording::{Snapshot, VarEntry};
pub use reports::{ListOptions, ListedVar, Listing, ListingError};
pub use sampling::{Case, CaseValue, Factor, SamplingError};
pub use solver::{BlockReport, NonlinearSolver, RunReport};
pub use totals::Totals;
pub use units::UnitsError;
pub use vectors::{Owner, ReadOnlyGuard, Vector, VectorKind, View};

#[cfg(feature = "testing")]
pub mod testing;

#[cfg(not(feature = "testing"))]
pub(crate) mod testing;

pub use nalgebra;
pub use serde_json;
