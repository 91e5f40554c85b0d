//! Nonlinear solvers of strongly connected blocks.
//!
//! Blocks of the execution order that contain a single explicit component
//! are simply evaluated. Coupled blocks, and blocks with an implicit
//! component, are driven to zero residuals by the solver configured on the
//! nearest group containing the whole block. Coupled blocks without any
//! configured solver use [`BlockGaussSeidel`] with default options.

use getset::{CopyGetters, Getters};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::EvalError;
use crate::group::Group;
use crate::model::{Block, CompKind, Model};

pub mod block_gs;
pub mod newton;

pub use block_gs::{BlockGaussSeidel, BlockGsOptions};
pub use newton::{Newton, NewtonOptions};

/// Solver configured on a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NonlinearSolver {
    /// Nonlinear block Gauss-Seidel.
    BlockGaussSeidel(BlockGsOptions),
    /// Newton's method on the residuals of the block.
    Newton(NewtonOptions),
}

impl NonlinearSolver {
    /// Name of the solver.
    pub fn name(&self) -> &'static str {
        match self {
            NonlinearSolver::BlockGaussSeidel(_) => BlockGaussSeidel::NAME,
            NonlinearSolver::Newton(_) => Newton::NAME,
        }
    }
}

impl From<BlockGsOptions> for NonlinearSolver {
    fn from(options: BlockGsOptions) -> Self {
        NonlinearSolver::BlockGaussSeidel(options)
    }
}

impl From<NewtonOptions> for NonlinearSolver {
    fn from(options: NewtonOptions) -> Self {
        NonlinearSolver::Newton(options)
    }
}

/// Common interface of nonlinear block solvers.
pub(crate) trait BlockSolver {
    /// Name of the solver.
    const NAME: &'static str;

    /// Drives the residuals of given components to zero.
    fn solve(
        &self,
        model: &mut Model,
        root: &mut Group,
        members: &[usize],
    ) -> Result<BlockReport, EvalError>;
}

/// Outcome of evaluating one block of the execution order.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct BlockReport {
    /// Paths of the components of the block.
    #[getset(get = "pub")]
    components: Vec<String>,
    /// Name of the solver, if any was used.
    #[getset(get_copy = "pub")]
    solver: Option<&'static str>,
    /// Number of solver iterations.
    #[getset(get_copy = "pub")]
    iterations: usize,
    /// Final norm of the residuals of the block. Zero for blocks that were
    /// simply evaluated.
    #[getset(get_copy = "pub")]
    norm: f64,
    /// Whether the solver reached the tolerance.
    #[getset(get_copy = "pub")]
    converged: bool,
}

impl BlockReport {
    pub(crate) fn new(
        components: Vec<String>,
        solver: &'static str,
        iterations: usize,
        norm: f64,
        converged: bool,
    ) -> Self {
        Self {
            components,
            solver: Some(solver),
            iterations,
            norm,
            converged,
        }
    }

    fn evaluated(components: Vec<String>) -> Self {
        Self {
            components,
            solver: None,
            iterations: 0,
            norm: 0.0,
            converged: true,
        }
    }

    /// Logs non-convergence and turns it into an error if requested.
    pub(crate) fn check(self, err_on_non_convergence: bool) -> Result<Self, EvalError> {
        if self.converged {
            return Ok(self);
        }

        let solver = self.solver.unwrap_or("none");
        warn!(
            "Solver '{}' on system(s) {:?} failed to converge in {} iterations (residual norm {:e}).",
            solver, self.components, self.iterations, self.norm
        );

        if err_on_non_convergence {
            Err(EvalError::NonConvergence {
                solver,
                block: self.components,
                iterations: self.iterations,
                norm: self.norm,
            })
        } else {
            Ok(self)
        }
    }
}

/// Outcome of a model run.
#[derive(Debug, Clone, Default, Getters)]
pub struct RunReport {
    /// Reports of all blocks in execution order.
    #[getset(get = "pub")]
    blocks: Vec<BlockReport>,
}

impl RunReport {
    /// Returns `true` if every solver converged.
    pub fn converged(&self) -> bool {
        self.blocks.iter().all(|b| b.converged)
    }

    /// Total number of solver iterations.
    pub fn iterations(&self) -> usize {
        self.blocks.iter().map(|b| b.iterations).sum()
    }
}

/// Converged when the norm is below the absolute tolerance or sufficiently
/// reduced relative to the initial norm.
pub(crate) fn is_converged(norm: f64, norm0: f64, atol: f64, rtol: f64) -> bool {
    norm < atol || (norm0 > 0.0 && norm / norm0 < rtol)
}

/// Evaluates one block of the execution order.
pub(crate) fn run_block(
    model: &mut Model,
    root: &mut Group,
    block: &Block,
) -> Result<BlockReport, EvalError> {
    match (&block.solver, block.coupled) {
        (Some(NonlinearSolver::Newton(options)), _) => {
            Newton::new(*options).solve(model, root, &block.comps)
        }
        (Some(NonlinearSolver::BlockGaussSeidel(options)), true) => {
            BlockGaussSeidel::new(*options).solve(model, root, &block.comps)
        }
        (None, true) => BlockGaussSeidel::default().solve(model, root, &block.comps),
        _ => {
            // Explicit outputs satisfy their residuals once computed, implicit
            // ones only as far as their own solve goes.
            for &c in &block.comps {
                model.run_solve(root, c)?;
                if model.comps[c].kind == CompKind::Implicit {
                    model.run_apply(root, c)?;
                } else {
                    model.clear_residuals(c);
                }
            }
            Ok(BlockReport::evaluated(block.paths(&model.comps)))
        }
    }
}

/// Evaluates all blocks in execution order.
pub(crate) fn run_model(model: &mut Model, root: &mut Group) -> Result<RunReport, EvalError> {
    let blocks = model.blocks.clone();
    let mut report = RunReport::default();
    for block in &blocks {
        report.blocks.push(run_block(model, root, block)?);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convergence_criteria() {
        assert!(is_converged(1e-12, 1.0, 1e-10, 1e-10));
        assert!(is_converged(1e-5, 1e6, 1e-10, 1e-10));
        assert!(!is_converged(1e-5, 1.0, 1e-10, 1e-10));
        assert!(!is_converged(1.0, 0.0, 1e-10, 1e-10));
    }

    #[test]
    fn non_convergence_is_an_error_only_on_request() {
        let report = BlockReport::new(vec!["a".to_string()], "NLBGS", 10, 1.0, false);
        assert!(report.clone().check(false).is_ok());

        let err = report.check(true).unwrap_err();
        assert!(matches!(err, EvalError::NonConvergence { iterations: 10, .. }));
    }

    #[test]
    fn solver_names() {
        let gs: NonlinearSolver = BlockGsOptions::default().into();
        let newton: NonlinearSolver = NewtonOptions::default().into();
        assert_eq!(gs.name(), "NLBGS");
        assert_eq!(newton.name(), "Newton");
    }
}
