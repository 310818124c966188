//! Gradient consistency checks.
//!
//! A [`Differentiable`] function exposes its forward pass and a
//! vector-Jacobian product with respect to `preds`. [`gradcheck`] compares the
//! Jacobian assembled from one-hot VJPs against central finite differences on
//! double-precision inputs.

pub mod gradcheck;
pub mod vjp;

pub use gradcheck::{GradcheckOptions, gradcheck, gradcheck_with};
pub use vjp::{Differentiable, ElementOp, vjp};

use mtest_core::{DType, TensorError};

pub type Result<T> = std::result::Result<T, GradcheckError>;

#[derive(thiserror::Error, Debug)]
pub enum GradcheckError {
    #[error("gradcheck requires f64 inputs, got {0}")]
    NotDouble(DType),

    #[error(
        "Jacobian mismatch for output {output} wrt input {input}: analytic {analytic}, numerical {numerical}"
    )]
    Mismatch {
        output: usize,
        input: usize,
        analytic: f64,
        numerical: f64,
    },

    #[error("VJP returned {got} values, expected {expected}")]
    GradientShape { expected: usize, got: usize },

    #[error(transparent)]
    Tensor(#[from] TensorError),
}
