//! Newton's method on the residuals of a block.
//!
//! The outputs of all components of the block are the unknowns. Every
//! iteration linearizes the block, solves the Newton system with LU
//! decomposition and takes the step. When a component rejects the trial
//! point with an [`AnalysisError`](crate::AnalysisError), the step is
//! shortened by the backtracking factor and tried again.

use getset::{CopyGetters, Setters};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{is_converged, BlockReport, BlockSolver};
use crate::core::EvalError;
use crate::group::Group;
use crate::model::Model;
use crate::totals::block_matrix;

/// Options for [`Newton`] solver.
#[derive(Debug, Clone, Copy, PartialEq, CopyGetters, Setters, Serialize, Deserialize)]
#[getset(get_copy = "pub", set = "pub")]
#[serde(default)]
pub struct NewtonOptions {
    /// Maximum number of iterations. Default: `10`.
    maxiter: usize,
    /// Absolute tolerance of the residual norm. Default: `1e-10`.
    atol: f64,
    /// Tolerance of the residual norm relative to the initial one. Default:
    /// `1e-10`.
    rtol: f64,
    /// Maximum number of step reductions after an analysis error. Default:
    /// `5`.
    max_backtracks: usize,
    /// Factor the step is multiplied by on every reduction. Default: `0.5`.
    backtrack_factor: f64,
    /// Whether failing to converge is an error. Default: `false`.
    err_on_non_convergence: bool,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            maxiter: 10,
            atol: 1e-10,
            rtol: 1e-10,
            max_backtracks: 5,
            backtrack_factor: 0.5,
            err_on_non_convergence: false,
        }
    }
}

/// Newton solver.
///
/// See [module](self) documentation for more details.
#[derive(Debug, Clone, Default)]
pub struct Newton {
    options: NewtonOptions,
}

impl Newton {
    /// Initializes the solver with given options.
    pub fn new(options: NewtonOptions) -> Self {
        Self { options }
    }
}

fn apply_all(model: &mut Model, root: &mut Group, members: &[usize]) -> Result<(), EvalError> {
    for &c in members {
        model.run_apply(root, c)?;
    }
    Ok(())
}

impl BlockSolver for Newton {
    const NAME: &'static str = "Newton";

    fn solve(
        &self,
        model: &mut Model,
        root: &mut Group,
        members: &[usize],
    ) -> Result<BlockReport, EvalError> {
        let NewtonOptions {
            maxiter,
            atol,
            rtol,
            max_backtracks,
            backtrack_factor,
            err_on_non_convergence,
        } = self.options;

        let paths: Vec<String> = members
            .iter()
            .map(|&c| model.comps[c].path().to_string())
            .collect();

        apply_all(model, root, members)?;
        let norm0 = model.residual_norm(members);
        let mut norm = norm0;
        let mut iter = 0;

        debug!("{} iter {:>3} | norm {:e}", Self::NAME, iter, norm);

        while !is_converged(norm, norm0, atol, rtol) && iter < maxiter {
            iter += 1;

            for &c in members {
                model.linearize(root, c)?;
            }
            let jac = block_matrix(model, root, members)?;
            let r = model.gather_residuals(members);
            let rx_neg = -&r;

            let step = jac
                .lu()
                .solve(&rx_neg)
                .ok_or_else(|| EvalError::SingularJacobian(paths.clone()))?;

            let u = model.gather_outputs(members);
            let mut alpha = 1.0;
            let mut backtracks = 0;

            loop {
                model.scatter_outputs(members, &(&u + &step * alpha));
                match apply_all(model, root, members) {
                    Ok(()) => break,
                    Err(error) if error.is_analysis() && backtracks < max_backtracks => {
                        backtracks += 1;
                        alpha *= backtrack_factor;
                        debug!(
                            "{} rejected trial point ({}), backtracking with step length {}",
                            Self::NAME,
                            error,
                            alpha
                        );
                    }
                    Err(error) => {
                        model.scatter_outputs(members, &u);
                        model.scatter_residuals(members, &r);
                        for &c in members {
                            model.transfer(c);
                        }
                        return Err(error);
                    }
                }
            }

            norm = model.residual_norm(members);
            debug!("{} iter {:>3} | norm {:e}", Self::NAME, iter, norm);
        }

        let converged = is_converged(norm, norm0, atol, rtol);
        BlockReport::new(paths, Self::NAME, iter, norm, converged).check(err_on_non_convergence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    use crate::core::{AnalysisError, DeclarationError, Declarations, ImplicitComponent, PartialOptions};
    use crate::partials::Partials;
    use crate::vectors::View;

    /// `R = z - x - 1`.
    struct Offset;

    impl ImplicitComponent for Offset {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("x", 1.0)?;
            decl.add_output("z", 1.0)?;
            decl.declare_partials("z", "*", PartialOptions::new())
        }

        fn apply_nonlinear(
            &mut self,
            inputs: &mut View,
            outputs: &mut View,
            residuals: &mut View,
        ) -> Result<(), EvalError> {
            residuals.set_scalar("z", outputs.scalar("z")? - inputs.scalar("x")? - 1.0)
        }

        fn linearize(
            &mut self,
            _inputs: &mut View,
            _outputs: &mut View,
            partials: &mut Partials,
        ) -> Result<(), EvalError> {
            partials.set("z", "z", &[1.0])?;
            partials.set("z", "x", &[-1.0])
        }
    }

    /// `R = y - u / 2`, defined only for `y >= 2`.
    struct Bounded;

    impl ImplicitComponent for Bounded {
        fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
            decl.add_input("u", 1.0)?;
            decl.add_output("y", 3.0)?;
            decl.declare_partials("y", "*", PartialOptions::new())
        }

        fn apply_nonlinear(
            &mut self,
            inputs: &mut View,
            outputs: &mut View,
            residuals: &mut View,
        ) -> Result<(), EvalError> {
            let y = outputs.scalar("y")?;
            if y < 2.0 {
                return Err(AnalysisError::new("y out of range").into());
            }
            residuals.set_scalar("y", y - 0.5 * inputs.scalar("u")?)
        }

        fn linearize(
            &mut self,
            _inputs: &mut View,
            _outputs: &mut View,
            partials: &mut Partials,
        ) -> Result<(), EvalError> {
            partials.set("y", "y", &[1.0])?;
            partials.set("y", "u", &[-0.5])
        }
    }

    #[test]
    fn default_options() {
        let options = NewtonOptions::default();
        assert_eq!(options.max_backtracks(), 5);
        assert_eq!(options.backtrack_factor(), 0.5);
    }

    #[test]
    fn options_setters() {
        let mut options = NewtonOptions::default();
        options.set_maxiter(20).set_err_on_non_convergence(true);
        assert_eq!(options.maxiter(), 20);
        assert!(options.err_on_non_convergence());
    }

    #[test]
    fn rejected_step_restores_block_state() {
        let mut root = Group::new();
        root.add_implicit("off", Offset);
        root.add_implicit("bnd", Bounded);
        root.connect("off.z", "bnd.u");
        root.connect("bnd.y", "off.x");

        let mut model = Model::setup(&mut root, false).unwrap();
        let block = model.blocks.iter().find(|b| b.coupled).unwrap().clone();

        let mut options = NewtonOptions::default();
        options.set_max_backtracks(0);
        let err = Newton::new(options)
            .solve(&mut model, &mut root, &block.comps)
            .unwrap_err();
        assert!(err.is_analysis());

        let z = model.locate("off.z").unwrap().range;
        let y = model.locate("bnd.y").unwrap().range;
        assert_abs_diff_eq!(model.outputs.as_slice()[z.clone()][0], 1.0);
        assert_abs_diff_eq!(model.outputs.as_slice()[y][0], 3.0);
        // Residual of `off` at the starting point, not at the rejected one.
        assert_abs_diff_eq!(model.residuals.as_slice()[z][0], -3.0);
    }
}
