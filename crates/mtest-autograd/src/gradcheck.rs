//! Finite-difference Jacobian check.

use mtest_core::{DType, Shape, Tensor};
use tracing::debug;

use crate::vjp::Differentiable;
use crate::{GradcheckError, Result};

/// Step size and tolerances for [`gradcheck_with`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradcheckOptions {
    pub eps: f64,
    pub atol: f64,
    pub rtol: f64,
}

impl Default for GradcheckOptions {
    fn default() -> Self {
        Self {
            eps: 1e-6,
            atol: 1e-5,
            rtol: 1e-3,
        }
    }
}

/// [`gradcheck_with`] at the default step size and tolerances.
pub fn gradcheck(f: &dyn Differentiable, preds: &Tensor, target: &Tensor) -> Result<()> {
    gradcheck_with(f, preds, target, GradcheckOptions::default())
}

/// Check that `f`'s VJP agrees with central differences of its forward pass.
///
/// Entry `(i, j)` passes when `|analytic - numerical| <= atol + rtol * |numerical|`.
pub fn gradcheck_with(
    f: &dyn Differentiable,
    preds: &Tensor,
    target: &Tensor,
    opts: GradcheckOptions,
) -> Result<()> {
    if preds.dtype() != DType::F64 {
        return Err(GradcheckError::NotDouble(preds.dtype()));
    }
    let preds = preds.detach();
    let target = target.detach();
    let numerical = numerical_jacobian(f, &preds, &target, opts.eps)?;
    let analytic = analytic_jacobian(f, &preds, &target)?;
    debug!(
        outputs = numerical.len(),
        inputs = preds.numel(),
        "comparing Jacobians"
    );
    for (output, (a_row, n_row)) in analytic.iter().zip(numerical.iter()).enumerate() {
        for (input, (&a, &n)) in a_row.iter().zip(n_row.iter()).enumerate() {
            if (a - n).abs() > opts.atol + opts.rtol * n.abs() {
                return Err(GradcheckError::Mismatch {
                    output,
                    input,
                    analytic: a,
                    numerical: n,
                });
            }
        }
    }
    Ok(())
}

/// `J[i][j] = d out_i / d preds_j` by central differences.
pub fn numerical_jacobian(
    f: &dyn Differentiable,
    preds: &Tensor,
    target: &Tensor,
    eps: f64,
) -> Result<Vec<Vec<f64>>> {
    let n_in = preds.numel() as usize;
    let n_out = f.forward(preds, target)?.numel() as usize;
    let mut jac = vec![vec![0.0; n_in]; n_out];
    for j in 0..n_in {
        let v = preds.as_slice()[j];
        let mut plus = preds.clone();
        plus.set_flat(j, v + eps)?;
        let mut minus = preds.clone();
        minus.set_flat(j, v - eps)?;
        let out_plus = f.forward(&plus, target)?;
        let out_minus = f.forward(&minus, target)?;
        for (i, (p, m)) in out_plus
            .as_slice()
            .iter()
            .zip(out_minus.as_slice())
            .enumerate()
        {
            jac[i][j] = (p - m) / (2.0 * eps);
        }
    }
    Ok(jac)
}

/// `J[i][j]` assembled row by row from one-hot VJPs.
pub fn analytic_jacobian(
    f: &dyn Differentiable,
    preds: &Tensor,
    target: &Tensor,
) -> Result<Vec<Vec<f64>>> {
    let out = f.forward(preds, target)?;
    let out_shape: Shape = out.shape().clone();
    let n_out = out.numel() as usize;
    let n_in = preds.numel() as usize;
    let mut jac = Vec::with_capacity(n_out);
    for i in 0..n_out {
        let mut one_hot = Tensor::zeros(&out_shape, DType::F64, preds.device())?;
        one_hot.set_flat(i, 1.0)?;
        let grad = f.vjp(preds, target, &one_hot)?;
        if grad.numel() as usize != n_in {
            return Err(GradcheckError::GradientShape {
                expected: n_in,
                got: grad.numel() as usize,
            });
        }
        jac.push(grad.to_vec_f64());
    }
    Ok(jac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vjp::{ElementOp, vjp};
    use mtest_core::Device;

    fn cpu() -> Device {
        Device::Cpu
    }

    /// mean((preds - target)^2)
    struct Mse;

    impl Differentiable for Mse {
        fn forward(&self, preds: &Tensor, target: &Tensor) -> mtest_core::Result<Tensor> {
            Ok(preds.sub(target)?.square().mean_all())
        }

        fn vjp(
            &self,
            preds: &Tensor,
            target: &Tensor,
            grad_output: &Tensor,
        ) -> mtest_core::Result<Tensor> {
            let diff = preds.sub(target)?;
            let sq = diff.square();
            let g = vjp(ElementOp::MeanAll, &[sq], grad_output)?.remove(0);
            let g = vjp(ElementOp::Square, &[diff.clone()], &g)?.remove(0);
            Ok(vjp(ElementOp::Sub, &[preds.clone(), target.clone()], &g)?.remove(0))
        }
    }

    /// Deliberately wrong gradient (off by a factor of 2).
    struct BadMse;

    impl Differentiable for BadMse {
        fn forward(&self, preds: &Tensor, target: &Tensor) -> mtest_core::Result<Tensor> {
            Mse.forward(preds, target)
        }

        fn vjp(
            &self,
            preds: &Tensor,
            target: &Tensor,
            grad_output: &Tensor,
        ) -> mtest_core::Result<Tensor> {
            Ok(Mse.vjp(preds, target, grad_output)?.mul_scalar(2.0))
        }
    }

    fn pair() -> (Tensor, Tensor) {
        let p = Tensor::from_f64(&[0.2, 0.9, 0.4], &Shape::new(vec![3]), &cpu()).unwrap();
        let t = Tensor::from_f64(&[0.0, 1.0, 1.0], &Shape::new(vec![3]), &cpu()).unwrap();
        (p, t)
    }

    #[test]
    fn test_mse_passes() {
        let (p, t) = pair();
        gradcheck(&Mse, &p, &t).unwrap();
    }

    #[test]
    fn test_wrong_gradient_fails() {
        let (p, t) = pair();
        let err = gradcheck(&BadMse, &p, &t).unwrap_err();
        assert!(matches!(err, GradcheckError::Mismatch { output: 0, .. }));
    }

    #[test]
    fn test_requires_f64() {
        let (p, t) = pair();
        let err = gradcheck(&Mse, &p.to_dtype(DType::F32), &t).unwrap_err();
        assert!(matches!(err, GradcheckError::NotDouble(DType::F32)));
    }
}
