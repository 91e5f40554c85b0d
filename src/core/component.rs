//! Abstractions for defining components.
//!
//! # Defining a component
//!
//! A component is a leaf of the model tree. Explicit components compute
//! their outputs directly from their inputs, implicit components drive their
//! own residuals to zero. Either way, the component declares its variables in
//! `setup` and then receives [`View`]s over the global vectors whenever it is
//! evaluated.
//!
//! ```rust
//! use mdao::{
//!     Declarations, DeclarationError, EvalError, ExplicitComponent, PartialOptions, Partials,
//!     View,
//! };
//!
//! struct Rectangle;
//!
//! impl ExplicitComponent for Rectangle {
//!     fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError> {
//!         decl.add_input("length", 1.0)?;
//!         decl.add_input("width", 1.0)?;
//!         decl.add_output("area", 1.0)?;
//!         decl.declare_partials("*", "*", PartialOptions::new())
//!     }
//!
//!     fn compute(&mut self, inputs: &mut View, outputs: &mut View) -> Result<(), EvalError> {
//!         let area = inputs.scalar("length")? * inputs.scalar("width")?;
//!         outputs.set_scalar("area", area)
//!     }
//!
//!     fn compute_partials(
//!         &mut self,
//!         inputs: &mut View,
//!         partials: &mut Partials,
//!     ) -> Result<(), EvalError> {
//!         partials.set("area", "length", &[inputs.scalar("width")?])?;
//!         partials.set("area", "width", &[inputs.scalar("length")?])
//!     }
//! }
//! ```
//!
//! The input view passed to `compute`, `compute_partials` and
//! `compute_jacvec_product` is read only. Attempts to write into it fail with
//! [`EvalError::ReadOnly`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::EvalError;
use super::metadata::{DeclarationError, Declarations};
use crate::partials::Partials;
use crate::vectors::View;

/// Direction of derivative propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Forward mode, one linear solve per design variable.
    #[default]
    Fwd,
    /// Reverse (adjoint) mode, one linear solve per response.
    Rev,
}

/// How an explicit component is evaluated and differentiated. The strategy
/// is queried once at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStrategy {
    /// [`compute`](ExplicitComponent::compute) and
    /// [`compute_partials`](ExplicitComponent::compute_partials).
    #[default]
    ComputeApply,
    /// [`compute_primal`](ExplicitComponent::compute_primal) with partials
    /// approximated by finite differences.
    ComputePrimal,
    /// [`compute`](ExplicitComponent::compute) and
    /// [`compute_jacvec_product`](ExplicitComponent::compute_jacvec_product).
    MatrixFree,
}

/// Argument or return value of a primal evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimalValue {
    /// Values of a continuous variable.
    Array(Vec<f64>),
    /// Value of a discrete variable.
    Discrete(Value),
}

impl PrimalValue {
    /// Continuous values, if any.
    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            PrimalValue::Array(values) => Some(values),
            PrimalValue::Discrete(_) => None,
        }
    }

    /// The first continuous value, if any.
    pub fn as_scalar(&self) -> Option<f64> {
        self.as_array().and_then(|values| values.first().copied())
    }

    /// Discrete value, if any.
    pub fn as_discrete(&self) -> Option<&Value> {
        match self {
            PrimalValue::Array(_) => None,
            PrimalValue::Discrete(value) => Some(value),
        }
    }
}

/// Parameter and return value names of a primal routine, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimalSignature {
    params: Vec<String>,
    returns: Vec<String>,
}

impl PrimalSignature {
    /// Creates the signature.
    pub fn new<P, R>(params: P, returns: R) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            returns: returns.into_iter().map(Into::into).collect(),
        }
    }

    /// Names of the parameters.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Names of the return values.
    pub fn returns(&self) -> &[String] {
        &self.returns
    }
}

/// Short name of a type, without module path and generic arguments.
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Component whose outputs are explicit functions of its inputs.
///
/// The residual of every output is `outputs - compute(inputs)`.
pub trait ExplicitComponent {
    /// Declares variables and partial derivatives.
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError>;

    /// Computes the outputs from the inputs.
    fn compute(&mut self, _inputs: &mut View, _outputs: &mut View) -> Result<(), EvalError> {
        Err(EvalError::NotImplemented("compute"))
    }

    /// Computes the declared exact partial derivatives.
    fn compute_partials(
        &mut self,
        _inputs: &mut View,
        _partials: &mut Partials,
    ) -> Result<(), EvalError> {
        Ok(())
    }

    /// Matrix-free Jacobian product. In forward mode it accumulates
    /// `J * d_inputs` into `d_outputs`, in reverse mode `J^T * d_outputs`
    /// into `d_inputs`, where `J` is the Jacobian of `compute`.
    fn compute_jacvec_product(
        &mut self,
        _inputs: &mut View,
        _d_inputs: &mut View,
        _d_outputs: &mut View,
        _mode: Mode,
    ) -> Result<(), EvalError> {
        Err(EvalError::NotImplemented("compute_jacvec_product"))
    }

    /// Names of the parameters and return values of
    /// [`compute_primal`](ExplicitComponent::compute_primal).
    fn primal_signature(&self) -> Option<PrimalSignature> {
        None
    }

    /// Native evaluation routine. Receives continuous inputs then discrete
    /// inputs in declaration order and returns continuous outputs then
    /// discrete outputs in declaration order.
    fn compute_primal(&mut self, _args: &[PrimalValue]) -> Result<Vec<PrimalValue>, EvalError> {
        Err(EvalError::NotImplemented("compute_primal"))
    }

    /// Evaluation strategy of the component.
    fn evaluation_strategy(&self) -> EvaluationStrategy {
        EvaluationStrategy::ComputeApply
    }

    /// Name of the component class used in messages.
    fn class_name(&self) -> String {
        short_type_name::<Self>()
    }
}

/// Component defined by residual equations.
pub trait ImplicitComponent {
    /// Declares variables and partial derivatives.
    fn setup(&mut self, decl: &mut Declarations) -> Result<(), DeclarationError>;

    /// Evaluates the residuals. Inputs and outputs are read only.
    fn apply_nonlinear(
        &mut self,
        inputs: &mut View,
        outputs: &mut View,
        residuals: &mut View,
    ) -> Result<(), EvalError>;

    /// Drives the residuals to zero by updating the outputs. The default
    /// leaves the outputs untouched and relies on an enclosing solver.
    fn solve_nonlinear(&mut self, _inputs: &mut View, _outputs: &mut View) -> Result<(), EvalError> {
        Ok(())
    }

    /// Computes the declared exact partial derivatives of the residuals.
    fn linearize(
        &mut self,
        _inputs: &mut View,
        _outputs: &mut View,
        _partials: &mut Partials,
    ) -> Result<(), EvalError> {
        Ok(())
    }

    /// Name of the component class used in messages.
    fn class_name(&self) -> String {
        short_type_name::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Generic<T>(T);

    #[test]
    fn short_names() {
        assert_eq!(short_type_name::<PrimalSignature>(), "PrimalSignature");
        assert_eq!(short_type_name::<Generic<f64>>(), "Generic");
    }

    #[test]
    fn primal_values() {
        let v = PrimalValue::Array(vec![2.0, 3.0]);
        assert_eq!(v.as_scalar(), Some(2.0));
        assert!(v.as_discrete().is_none());

        let d = PrimalValue::Discrete(Value::from("x"));
        assert!(d.as_array().is_none());
    }
}
