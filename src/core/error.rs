//! Errors raised while evaluating components.

use thiserror::Error;

/// Recoverable failure of a component evaluation.
///
/// Components return this error when the trial point is outside of the region
/// where the analysis is defined (e.g., a negative area). Nonlinear solvers
/// treat it as a signal to damp the step and retry instead of failing the
/// whole run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AnalysisError {
    message: String,
}

impl AnalysisError {
    /// Creates the error with given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message of the error.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error encountered while evaluating a component or solving the model.
#[derive(Debug, Error)]
pub enum EvalError {
    /// A component attempted to write into a vector that is locked for
    /// reading during the current evaluation.
    #[error("'{path}' <class {class}>: Attempt to set value of '{name}' in {vector} vector when it is read only.")]
    ReadOnly {
        /// Absolute path of the component.
        path: String,
        /// Class name of the component.
        class: String,
        /// Local name of the variable.
        name: String,
        /// Kind of the vector (input, output, residual).
        vector: &'static str,
    },
    /// Recoverable analysis failure.
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    /// The component asked for a variable it does not own.
    #[error("'{path}' <class {class}>: Variable name '{name}' not found.")]
    UnknownVariable {
        /// Absolute path of the component.
        path: String,
        /// Class name of the component.
        class: String,
        /// Requested name.
        name: String,
    },
    /// The number of values does not match the size of the variable.
    #[error("'{path}' <class {class}>: Expected {expected} value(s) for '{name}' but got {got}.")]
    SizeMismatch {
        /// Absolute path of the component.
        path: String,
        /// Class name of the component.
        class: String,
        /// Local name of the variable.
        name: String,
        /// Size of the variable.
        expected: usize,
        /// Number of given values.
        got: usize,
    },
    /// The component wrote into a partial derivative it did not declare.
    #[error("'{path}' <class {class}>: Variable name pair (\"{of}\", \"{wrt}\") must first be declared.")]
    UndeclaredPartial {
        /// Absolute path of the component.
        path: String,
        /// Class name of the component.
        class: String,
        /// Name of the differentiated variable.
        of: String,
        /// Name of the variable the derivative is taken with respect to.
        wrt: String,
    },
    /// The values returned from a primal evaluation do not fit the outputs.
    #[error("'{path}' <class {class}>: compute_primal returned {got} value(s) but {expected} output(s) are mapped.")]
    PrimalArity {
        /// Absolute path of the component.
        path: String,
        /// Class name of the component.
        class: String,
        /// Number of mapped outputs.
        expected: usize,
        /// Number of returned values.
        got: usize,
    },
    /// The component does not provide the method required by its evaluation
    /// strategy.
    #[error("'{path}' <class {class}>: method '{method}' is not implemented.")]
    Unsupported {
        /// Absolute path of the component.
        path: String,
        /// Class name of the component.
        class: String,
        /// Name of the missing method.
        method: &'static str,
    },
    /// Returned by the default implementations of optional component
    /// methods.
    #[error("method '{0}' is not implemented")]
    NotImplemented(&'static str),
    /// The linear system of a strongly connected block is singular.
    #[error("singular Jacobian in block {0:?}")]
    SingularJacobian(Vec<String>),
    /// A nonlinear solver did not converge and it was configured to fail.
    #[error("solver '{solver}' failed to converge for {block:?} in {iterations} iterations (residual norm {norm:e})")]
    NonConvergence {
        /// Name of the solver.
        solver: &'static str,
        /// Paths of the components in the block.
        block: Vec<String>,
        /// Number of performed iterations.
        iterations: usize,
        /// Final norm of the residuals.
        norm: f64,
    },
    /// A custom error specific to the component.
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl EvalError {
    /// Returns `true` if the error is a recoverable [`AnalysisError`].
    pub fn is_analysis(&self) -> bool {
        matches!(self, EvalError::Analysis(_))
    }

    /// Attaches the owner to errors raised by default trait methods, which do
    /// not know the component they run for.
    pub(crate) fn with_owner(self, owner: &crate::vectors::Owner) -> Self {
        match self {
            EvalError::NotImplemented(method) => EvalError::Unsupported {
                path: owner.path().to_string(),
                class: owner.class().to_string(),
                method,
            },
            other => other,
        }
    }
}
