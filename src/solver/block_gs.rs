//! Nonlinear block Gauss-Seidel.
//!
//! Every iteration evaluates the components of the block one after another,
//! each one seeing the latest outputs of the components evaluated before it.
//! Implicit components are asked to solve themselves. The iteration stops
//! when the residual norm of the block satisfies the tolerances.

use getset::{CopyGetters, Setters};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{is_converged, BlockReport, BlockSolver};
use crate::core::EvalError;
use crate::group::Group;
use crate::model::Model;

/// Options for [`BlockGaussSeidel`] solver.
#[derive(Debug, Clone, Copy, PartialEq, CopyGetters, Setters, Serialize, Deserialize)]
#[getset(get_copy = "pub", set = "pub")]
#[serde(default)]
pub struct BlockGsOptions {
    /// Maximum number of iterations. Default: `10`.
    maxiter: usize,
    /// Absolute tolerance of the residual norm. Default: `1e-10`.
    atol: f64,
    /// Tolerance of the residual norm relative to the initial one. Default:
    /// `1e-10`.
    rtol: f64,
    /// Whether failing to converge is an error. Default: `false`.
    err_on_non_convergence: bool,
}

impl Default for BlockGsOptions {
    fn default() -> Self {
        Self {
            maxiter: 10,
            atol: 1e-10,
            rtol: 1e-10,
            err_on_non_convergence: false,
        }
    }
}

/// Nonlinear block Gauss-Seidel solver.
///
/// See [module](self) documentation for more details.
#[derive(Debug, Clone, Default)]
pub struct BlockGaussSeidel {
    options: BlockGsOptions,
}

impl BlockGaussSeidel {
    /// Initializes the solver with given options.
    pub fn new(options: BlockGsOptions) -> Self {
        Self { options }
    }
}

impl BlockSolver for BlockGaussSeidel {
    const NAME: &'static str = "NLBGS";

    fn solve(
        &self,
        model: &mut Model,
        root: &mut Group,
        members: &[usize],
    ) -> Result<BlockReport, EvalError> {
        let BlockGsOptions {
            maxiter,
            atol,
            rtol,
            err_on_non_convergence,
        } = self.options;

        for &c in members {
            model.run_apply(root, c)?;
        }
        let norm0 = model.residual_norm(members);
        let mut norm = norm0;
        let mut iter = 0;

        debug!("{} iter {:>3} | norm {:e}", Self::NAME, iter, norm);

        while !is_converged(norm, norm0, atol, rtol) && iter < maxiter {
            iter += 1;

            for &c in members {
                model.run_solve(root, c)?;
            }
            for &c in members {
                model.run_apply(root, c)?;
            }

            norm = model.residual_norm(members);
            debug!("{} iter {:>3} | norm {:e}", Self::NAME, iter, norm);
        }

        let converged = is_converged(norm, norm0, atol, rtol);
        let paths = members
            .iter()
            .map(|&c| model.comps[c].path().to_string())
            .collect();

        BlockReport::new(paths, Self::NAME, iter, norm, converged).check(err_on_non_convergence)
    }
}
