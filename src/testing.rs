//! Testing components and models useful for benchmarking, debugging and smoke
//! testing.
//!
//! [`RectangleComp`] and the [Sellar](sellar) problem are recommended for
//! first tests. Others can be used for specific conditions (e.g., a failing
//! evaluation or residuals that a component does not drive to zero).
//!
//! # References
//!
//! \[1\] [Response Surface Based, Concurrent Subspace Optimization for
//! Multidisciplinary System Design](https://doi.org/10.2514/6.1996-714)
//!
//! \[2\] [OpenMDAO: an open-source framework for multidisciplinary design,
//! analysis, and optimization](https://doi.org/10.1007/s00158-019-02211-z)

#![allow(unused)]

use serde_json::Value;

use crate::core::{
    AnalysisError, DeclarationError, Declarations, DiscreteOptions, EvalError,
    EvaluationStrategy, ExplicitComponent, ImplicitComponent, Mode, PartialMethod,
    PartialOptions, PrimalSignature, PrimalValue, VarOptions,
};
use crate::group::Group;
use crate::partials::Partials;
use crate::solver::NonlinearSolver;
use crate::vectors::View;

/// Area of a rectangle, `area = length * width`.
///
/// The same function is available with all evaluation strategies, which is
/// useful for checking that they give the same results.
#[derive(Debug, Clone, Copy)]
pub struct RectangleComp {
    strategy: EvaluationStrategy,
}

impl RectangleComp {
    /// Rectangle with exact partial derivatives.
    pub fn new() -> Self {
        Self {
            strategy: EvaluationStrategy::ComputeApply,
        }
    }

    /// Rectangle providing Jacobian-vector products instead of partials.
    pub fn matrix_free() -> Self {
        Self {
            strategy: EvaluationStrategy::MatrixFree,
        }
    }

    /// Rectangle evaluated through its primal routine.
    pub fn primal() -> Self {
        Self {
            strategy: EvaluationStrategy::ComputePrimal,
        }
    }
}

impl Default for RectangleComp {
    fn default() -> Self {
        Self::new()
    }
}

impl ExplicitComponent for RectangleComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("length", VarOptions::from(1.0).with_tags(vec!["geometry"]))?;
        decl.add_input("width", VarOptions::from(1.0).with_tags(vec!["geometry"]))?;
        decl.add_output("area", VarOptions::from(1.0).with_tags(vec!["result"]))?;
        if self.strategy == EvaluationStrategy::ComputeApply {
            decl.declare_partials("area", "*", PartialOptions::new())?;
        }
        Ok(())
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        outputs.set_scalar("area", inputs.scalar("length")? * inputs.scalar("width")?)
    }

    fn compute_partials(
        &mut self,
        inputs: &mut View,
        partials: &mut Partials,
    ) -> Result<(), EvalError> {
        partials.set("area", "length", &[inputs.scalar("width")?])?;
        partials.set("area", "width", &[inputs.scalar("length")?])
    }

    fn compute_jacvec_product(
        &mut self,
        inputs: &mut View,
        d_inputs: &mut View,
        d_outputs: &mut View,
        mode: Mode,
    ) -> Result<(), EvalError> {
        let length = inputs.scalar("length")?;
        let width = inputs.scalar("width")?;

        match mode {
            Mode::Fwd => {
                let d_area = width * d_inputs.scalar("length")? + length * d_inputs.scalar("width")?;
                d_outputs.set_scalar("area", d_outputs.scalar("area")? + d_area)
            }
            Mode::Rev => {
                let d_area = d_outputs.scalar("area")?;
                d_inputs.set_scalar("length", d_inputs.scalar("length")? + width * d_area)?;
                d_inputs.set_scalar("width", d_inputs.scalar("width")? + length * d_area)
            }
        }
    }

    fn primal_signature(&self) -> Option<PrimalSignature> {
        Some(PrimalSignature::new(["length", "width"], ["area"]))
    }

    fn compute_primal(&mut self, args: &[PrimalValue]) -> Result<Vec<PrimalValue>, EvalError> {
        let area: f64 = args.iter().filter_map(PrimalValue::as_scalar).product();
        Ok(vec![PrimalValue::Array(vec![area])])
    }

    fn evaluation_strategy(&self) -> EvaluationStrategy {
        self.strategy
    }
}

/// Paraboloid `f_xy = (x - 3)^2 + x y + (y + 4)^2 - 3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Paraboloid;

impl ExplicitComponent for Paraboloid {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("x", 0.0)?;
        decl.add_input("y", 0.0)?;
        decl.add_output("f_xy", 0.0)?;
        decl.declare_partials("f_xy", "*", PartialOptions::new())
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        let x = inputs.scalar("x")?;
        let y = inputs.scalar("y")?;
        outputs.set_scalar("f_xy", (x - 3.0).powi(2) + x * y + (y + 4.0).powi(2) - 3.0)
    }

    fn compute_partials(
        &mut self,
        inputs: &mut View,
        partials: &mut Partials,
    ) -> Result<(), EvalError> {
        let x = inputs.scalar("x")?;
        let y = inputs.scalar("y")?;
        partials.set("f_xy", "x", &[2.0 * (x - 3.0) + y])?;
        partials.set("f_xy", "y", &[x + 2.0 * (y + 4.0)])
    }
}

/// First discipline of the Sellar problem \[1\],
/// `y1 = z1^2 + z2 + x - 0.2 y2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SellarDis1;

impl ExplicitComponent for SellarDis1 {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("z", vec![5.0, 2.0])?;
        decl.add_input("x", 1.0)?;
        decl.add_input("y2", 1.0)?;
        decl.add_output("y1", VarOptions::from(1.0).with_ref(10.0))?;
        decl.declare_partials("y1", "*", PartialOptions::new())
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        let z = inputs.get("z")?;
        let y1 = z[0] * z[0] + z[1] + inputs.scalar("x")? - 0.2 * inputs.scalar("y2")?;
        outputs.set_scalar("y1", y1)
    }

    fn compute_partials(
        &mut self,
        inputs: &mut View,
        partials: &mut Partials,
    ) -> Result<(), EvalError> {
        let z0 = inputs.get("z")?[0];
        partials.set("y1", "z", &[2.0 * z0, 1.0])?;
        partials.set("y1", "x", &[1.0])?;
        partials.set("y1", "y2", &[-0.2])
    }
}

/// Second discipline of the Sellar problem \[1\],
/// `y2 = sqrt(|y1|) + z1 + z2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SellarDis2;

impl ExplicitComponent for SellarDis2 {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("z", vec![5.0, 2.0])?;
        decl.add_input("y1", 1.0)?;
        decl.add_output("y2", VarOptions::from(1.0).with_ref(10.0))?;
        decl.declare_partials("y2", "*", PartialOptions::new())
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        let z = inputs.get("z")?;
        let y2 = inputs.scalar("y1")?.abs().sqrt() + z[0] + z[1];
        outputs.set_scalar("y2", y2)
    }

    fn compute_partials(
        &mut self,
        inputs: &mut View,
        partials: &mut Partials,
    ) -> Result<(), EvalError> {
        let y1 = inputs.scalar("y1")?;
        // Derivative of sqrt(|y1|) is undefined at zero.
        let d_y1 = if y1 == 0.0 {
            0.0
        } else {
            0.5 * y1.signum() / y1.abs().sqrt()
        };
        partials.set("y2", "y1", &[d_y1])?;
        partials.set("y2", "z", &[1.0, 1.0])
    }
}

/// The Sellar problem \[1\] as a flat group with all variables promoted. The
/// solver, if any, is configured on the group.
///
/// At `x = 1` and `z = [5, 2]` the coupled solution is `y1 = 25.58830237`
/// and `y2 = 12.05848815`.
pub fn sellar(solver: Option<NonlinearSolver>) -> Group {
    let mut model = Group::new();
    model.add_explicit("d1", SellarDis1).promotes(["*"]);
    model.add_explicit("d2", SellarDis2).promotes(["*"]);
    if let Some(solver) = solver {
        model.set_nonlinear_solver(solver);
    }
    model
}

/// Declares tags given as an arbitrary JSON value on its input.
#[derive(Debug, Clone)]
pub struct TaggedComp {
    tags: Value,
}

impl TaggedComp {
    /// Component with given tags.
    pub fn new(tags: Value) -> Self {
        Self { tags }
    }
}

impl ExplicitComponent for TaggedComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("x", VarOptions::from(1.0).with_tags(self.tags.clone()))?;
        decl.add_output("y", 1.0)?;
        Ok(())
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        outputs.set_scalar("y", inputs.scalar("x")?)
    }
}

/// Writes its output and then fails with an [`AnalysisError`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingComp;

impl FailingComp {
    /// Creates the component.
    pub fn new() -> Self {
        Self
    }
}

impl ExplicitComponent for FailingComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("x", 1.0)?;
        decl.add_output("y", 1.0)?;
        Ok(())
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        outputs.set_scalar("y", 100.0 * inputs.scalar("x")?)?;
        Err(AnalysisError::new("evaluation failed on purpose").into())
    }
}

/// Attempts to write into its inputs during `compute`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputWriterComp;

impl ExplicitComponent for InputWriterComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("x", 1.0)?;
        decl.add_output("y", 1.0)?;
        Ok(())
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        inputs.set_scalar("x", 0.0)?;
        outputs.set_scalar("y", 0.0)
    }
}

/// `y = 2 a`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleComp;

impl ExplicitComponent for DoubleComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("a", 1.0)?;
        decl.add_output("y", 1.0)?;
        decl.declare_partials("y", "a", PartialOptions::new().with_val(2.0))
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        outputs.set_scalar("y", 2.0 * inputs.scalar("a")?)
    }
}

/// Implicit component with three outputs of which `solve_nonlinear` only
/// solves the first one. The residuals of the others stay at `-3` and `3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialSolveComp;

impl ImplicitComponent for PartialSolveComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("a", 1.0)?;
        decl.add_output("z1", 0.0)?;
        decl.add_output("z2", 0.0)?;
        decl.add_output("z3", 0.0)?;
        decl.declare_partials("z1", "z1", PartialOptions::new().with_val(1.0))?;
        decl.declare_partials("z1", "a", PartialOptions::new().with_val(-1.0))?;
        decl.declare_partials("z2", "z2", PartialOptions::new().with_val(1.0))?;
        decl.declare_partials("z3", "z3", PartialOptions::new().with_val(1.0))
    }

    fn apply_nonlinear(
        &mut self,
        inputs: &mut View,
        outputs: &mut View,
        residuals: &mut View,
    ) -> Result<(), EvalError> {
        residuals.set_scalar("z1", outputs.scalar("z1")? - inputs.scalar("a")?)?;
        residuals.set_scalar("z2", outputs.scalar("z2")? - 3.0)?;
        residuals.set_scalar("z3", outputs.scalar("z3")? + 3.0)
    }

    fn solve_nonlinear(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        outputs.set_scalar("z1", inputs.scalar("a")?)
    }
}

/// Implicit quadratic `a x^2 + b x + c = 0` for `x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticComp;

impl ImplicitComponent for QuadraticComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("a", 1.0)?;
        decl.add_input("b", 1.0)?;
        decl.add_input("c", 1.0)?;
        decl.add_output("x", 0.0)?;
        decl.declare_partials("x", "*", PartialOptions::new())
    }

    fn apply_nonlinear(
        &mut self,
        inputs: &mut View,
        outputs: &mut View,
        residuals: &mut View,
    ) -> Result<(), EvalError> {
        let (a, b, c) = (inputs.scalar("a")?, inputs.scalar("b")?, inputs.scalar("c")?);
        let x = outputs.scalar("x")?;
        residuals.set_scalar("x", a * x * x + b * x + c)
    }

    fn linearize(
        &mut self,
        inputs: &mut View,
        outputs: &mut View,
        partials: &mut Partials,
    ) -> Result<(), EvalError> {
        let (a, b) = (inputs.scalar("a")?, inputs.scalar("b")?);
        let x = outputs.scalar("x")?;
        partials.set("x", "a", &[x * x])?;
        partials.set("x", "b", &[x])?;
        partials.set("x", "c", &[1.0])?;
        partials.set("x", "x", &[2.0 * a * x + b])
    }
}

/// `y = x` with possibly different units of the input and the output.
#[derive(Debug, Clone)]
pub struct UnitsComp {
    input_units: String,
    output_units: String,
}

impl UnitsComp {
    /// Creates the component with given units.
    pub fn new(input_units: &str, output_units: &str) -> Self {
        Self {
            input_units: input_units.to_string(),
            output_units: output_units.to_string(),
        }
    }
}

impl ExplicitComponent for UnitsComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("x", VarOptions::from(1.0).with_units(self.input_units.as_str()))?;
        decl.add_output("y", VarOptions::from(1.0).with_units(self.output_units.as_str()))?;
        decl.declare_partials("y", "x", PartialOptions::new().with_val(1.0))
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        outputs.set_scalar("y", inputs.scalar("x")?)
    }
}

/// Sum of a vector input.
#[derive(Debug, Clone, Copy)]
pub struct VectorSum {
    n: usize,
}

impl VectorSum {
    /// Sum of `n` values.
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "n must be greater than zero");
        Self { n }
    }
}

impl ExplicitComponent for VectorSum {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("x", VarOptions::from(1.0).with_shape([self.n]))?;
        decl.add_output("total", 0.0)?;
        decl.declare_partials("total", "x", PartialOptions::new().with_val(1.0))
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        outputs.set_scalar("total", inputs.get("x")?.iter().sum())
    }
}

/// `y = factor * x`, with the shape of `x` taken from its source.
#[derive(Debug, Clone, Copy)]
pub struct ScaledCopy {
    factor: f64,
}

impl ScaledCopy {
    /// Creates the component with given factor.
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }
}

impl ExplicitComponent for ScaledCopy {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("x", VarOptions::new().with_shape_by_conn())?;
        decl.add_output("y", VarOptions::new().with_copy_shape("x"))?;
        decl.declare_partials(
            "y",
            "x",
            PartialOptions::new().with_method(PartialMethod::Fd),
        )
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        let scaled: Vec<f64> = inputs.get("x")?.iter().map(|x| self.factor * x).collect();
        outputs.set("y", &scaled)
    }
}

/// Dot product of two vectors evaluated through a primal routine, with
/// parameters mapped by primal names.
#[derive(Debug, Clone, Copy)]
pub struct DotProductComp {
    n: usize,
}

impl DotProductComp {
    /// Dot product of vectors of size `n`.
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "n must be greater than zero");
        Self { n }
    }
}

impl ExplicitComponent for DotProductComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input(
            "a",
            VarOptions::from(1.0).with_shape([self.n]).with_primal_name("lhs"),
        )?;
        decl.add_input(
            "b",
            VarOptions::from(1.0).with_shape([self.n]).with_primal_name("rhs"),
        )?;
        decl.add_output("dot", VarOptions::from(0.0).with_primal_name("result"))?;
        Ok(())
    }

    fn primal_signature(&self) -> Option<PrimalSignature> {
        Some(PrimalSignature::new(["lhs", "rhs"], ["result"]))
    }

    fn compute_primal(&mut self, args: &[PrimalValue]) -> Result<Vec<PrimalValue>, EvalError> {
        let (Some(lhs), Some(rhs)) = (args[0].as_array(), args[1].as_array()) else {
            return Err(AnalysisError::new("dot product of discrete values").into());
        };
        let dot = lhs.iter().zip(rhs).map(|(a, b)| a * b).sum();
        Ok(vec![PrimalValue::Array(vec![dot])])
    }

    fn evaluation_strategy(&self) -> EvaluationStrategy {
        EvaluationStrategy::ComputePrimal
    }
}

/// Formats a discrete input `n` into a discrete output `label`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscreteComp;

impl ExplicitComponent for DiscreteComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_discrete_input("n", DiscreteOptions::new(1))?;
        decl.add_discrete_output("label", DiscreteOptions::new(""))?;
        Ok(())
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        let label = format!("n={}", inputs.discrete("n")?);
        outputs.set_discrete("label", label)
    }
}

/// `y = factor * x`.
#[derive(Debug, Clone, Copy)]
pub struct ScaleComp {
    factor: f64,
}

impl ScaleComp {
    /// Creates the component with given factor.
    pub fn new(factor: f64) -> Self {
        Self { factor }
    }
}

impl ExplicitComponent for ScaleComp {
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
        decl.add_input("x", 1.0)?;
        decl.add_output("y", 1.0)?;
        decl.declare_partials("y", "x", PartialOptions::new().with_val(self.factor))
    }

    fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
        outputs.set_scalar("y", self.factor * inputs.scalar("x")?)
    }
}

/// Chain of `n` [`ScaleComp`]s named `c0`, `c1`, ..., each feeding the next
/// one.
pub fn scale_chain(n: usize, factor: f64) -> Group {
    let mut model = Group::new();
    for i in 0..n {
        model.add_explicit(format!("c{i}"), ScaleComp::new(factor));
        if i > 0 {
            model.connect(format!("c{}.y", i - 1), format!("c{i}.x"));
        }
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    use crate::{Problem, ProblemError};

    #[test]
    fn quadratic_converges_with_newton() {
        let mut model = Group::new();
        model.add_implicit("q", QuadraticComp).promotes(["*"]);
        model.set_nonlinear_solver(crate::solver::NewtonOptions::default());

        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem.set_val("b", -3.0).unwrap();
        problem.set_val("c", 2.0).unwrap();
        problem.run_model().unwrap();

        // Roots are 1 and 2, Newton from zero reaches the smaller one.
        assert_abs_diff_eq!(problem.get_val("x").unwrap().as_slice()[0], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn scale_chain_product() {
        let mut problem = Problem::new(scale_chain(4, 2.0));
        problem.setup().unwrap();
        problem.set_val("c0.x", 1.5).unwrap();
        problem.run_model().unwrap();
        assert_abs_diff_eq!(problem.get_val("c3.y").unwrap().as_slice()[0], 24.0);

        let totals = problem.compute_totals(&["c3.y"], &["c0.x"]).unwrap();
        assert_abs_diff_eq!(totals.get("c3.y", "c0.x").unwrap()[(0, 0)], 16.0);
    }

    #[test]
    fn primal_dot_product_totals() {
        let mut model = Group::new();
        model.add_explicit("dot", DotProductComp::new(3)).promotes(["*"]);
        let mut problem = Problem::new(model);
        problem.setup().unwrap();
        problem.set_val("a", vec![1.0, 2.0, 3.0]).unwrap();
        problem.set_val("b", vec![4.0, 5.0, 6.0]).unwrap();
        problem.run_model().unwrap();
        assert_abs_diff_eq!(problem.get_val("dot").unwrap().as_slice()[0], 32.0);

        for mode in [Mode::Fwd, Mode::Rev] {
            let totals = problem.compute_totals_with_mode(&["dot"], &["a"], mode).unwrap();
            let d = totals.get("dot", "a").unwrap();
            assert_eq!(d.shape(), (1, 3));
            for (j, expected) in [4.0, 5.0, 6.0].into_iter().enumerate() {
                assert_abs_diff_eq!(d[(0, j)], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn failing_comp_reports_analysis_error() {
        let mut model = Group::new();
        model.add_explicit("f", FailingComp::new());
        let mut problem = Problem::new(model);
        problem.setup().unwrap();

        match problem.run_model() {
            Err(ProblemError::Eval(err)) => assert!(err.is_analysis()),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
