//! VJP (Vector-Jacobian Product) building blocks.

use mtest_core::{Result, Tensor, TensorError};

/// A scalar- or tensor-valued function of `(preds, target)`, differentiable in `preds`.
pub trait Differentiable: Send + Sync {
    fn forward(&self, preds: &Tensor, target: &Tensor) -> Result<Tensor>;

    /// Gradient of `<grad_output, forward(preds, target)>` with respect to `preds`.
    fn vjp(&self, preds: &Tensor, target: &Tensor, grad_output: &Tensor) -> Result<Tensor>;
}

/// Elementwise and reduction ops with known VJPs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementOp {
    Add,
    Sub,
    Mul,
    Neg,
    Square,
    Abs,
    SumAll,
    MeanAll,
}

impl ElementOp {
    /// Number of tensor inputs the op takes.
    pub fn arity(self) -> usize {
        match self {
            ElementOp::Add | ElementOp::Sub | ElementOp::Mul => 2,
            _ => 1,
        }
    }
}

/// Given the output gradient, return gradients for each input of `op`.
pub fn vjp(op: ElementOp, inputs: &[Tensor], grad_output: &Tensor) -> Result<Vec<Tensor>> {
    if inputs.len() < op.arity() {
        return Err(TensorError::InvalidArgument(format!(
            "{op:?} takes {} inputs, got {}",
            op.arity(),
            inputs.len()
        )));
    }
    match op {
        // ── Elementwise ──────────────────────────────────────────────
        ElementOp::Add => Ok(vec![grad_output.clone(), grad_output.clone()]),

        ElementOp::Sub => Ok(vec![grad_output.clone(), grad_output.neg()]),

        ElementOp::Mul => {
            // d(a*b)/da = b, d(a*b)/db = a
            let grad_a = grad_output.mul(&inputs[1])?;
            let grad_b = grad_output.mul(&inputs[0])?;
            Ok(vec![grad_a, grad_b])
        }

        ElementOp::Neg => Ok(vec![grad_output.neg()]),

        ElementOp::Square => Ok(vec![grad_output.mul(&inputs[0])?.mul_scalar(2.0)]),

        ElementOp::Abs => {
            // sign(a); the subgradient at 0 is 0.
            let a = &inputs[0];
            let pos = a.ge_scalar(0.0).to_dtype(a.dtype());
            let nonzero = a.ne_scalar(0.0).to_dtype(a.dtype());
            let sign = pos.mul_scalar(2.0).sub(&nonzero)?.mul(&nonzero)?;
            Ok(vec![grad_output.mul(&sign)?])
        }

        // ── Reductions ───────────────────────────────────────────────
        ElementOp::SumAll => Ok(vec![grad_output.broadcast_to(inputs[0].shape())?]),

        ElementOp::MeanAll => {
            let n = inputs[0].numel().max(1) as f64;
            let grad = grad_output.broadcast_to(inputs[0].shape())?;
            Ok(vec![grad.mul_scalar(1.0 / n)])
        }
    }
}
