//! Reduced-precision and differentiability probes.

use std::sync::Arc;

use mtest_autograd::{Differentiable, gradcheck};
use mtest_core::{DType, Device, Tensor};
use mtest_metric::{Functional, Input, Kwargs, Metric, MetricArgs, MetricOutput};
use tracing::debug;

use crate::batch::{BatchSeq, slice_kwargs};
use crate::compare::{check_requires_grad, check_tensor_leaves};
use crate::driver::{check_lengths, merge_args};
use crate::{Phase, Result};

/// A metric instance driven by the probes, independent of its concrete type.
pub trait ProbeTarget {
    fn probe_name(&self) -> &str;
    fn probe_to_device(&mut self, device: &Device);
    fn probe_forward(
        &mut self,
        preds: &Input,
        target: &Input,
        kwargs: &Kwargs,
    ) -> mtest_metric::Result<MetricOutput>;
}

impl<M: Metric> ProbeTarget for M {
    fn probe_name(&self) -> &str {
        self.name()
    }

    fn probe_to_device(&mut self, device: &Device) {
        self.to_device(device);
    }

    fn probe_forward(
        &mut self,
        preds: &Input,
        target: &Input,
        kwargs: &Kwargs,
    ) -> mtest_metric::Result<MetricOutput> {
        self.forward(preds, target, kwargs)
    }
}

/// Inputs for the precision probes.
#[derive(Clone)]
pub struct PrecisionCase {
    pub preds: BatchSeq,
    pub target: BatchSeq,
    /// Functional form to probe alongside (or instead of) a metric instance.
    pub functional: Option<Arc<dyn Functional>>,
    /// Bound into every call of `functional`.
    pub metric_args: MetricArgs,
    pub kwargs: Kwargs,
    pub dtype: DType,
}

impl PrecisionCase {
    pub fn new(preds: impl Into<BatchSeq>, target: impl Into<BatchSeq>) -> Self {
        Self {
            preds: preds.into(),
            target: target.into(),
            functional: None,
            metric_args: MetricArgs::new(),
            kwargs: Kwargs::new(),
            dtype: DType::F16,
        }
    }

    pub fn with_functional(mut self, functional: Arc<dyn Functional>) -> Self {
        self.functional = Some(functional);
        self
    }

    pub fn with_metric_args(mut self, metric_args: MetricArgs) -> Self {
        self.metric_args = metric_args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }
}

/// Run the first batch, cast to `case.dtype` on `device`, through the metric
/// and the functional; every output leaf must be a tensor.
pub fn assert_dtype_support(
    metric: Option<&mut dyn ProbeTarget>,
    case: &PrecisionCase,
    device: &Device,
) -> Result<()> {
    check_lengths(case.preds.len(), case.target.len())?;
    let preds = case.preds.batch(0)?.to_precision(case.dtype, device);
    let target = case.target.batch(0)?.to_precision(case.dtype, device);
    let kwargs: Kwargs = slice_kwargs(&case.kwargs, 0)?
        .into_iter()
        .map(|(k, v)| {
            let v = v.map_tensor(|t| {
                let moved = t.to_device(device);
                if moved.is_floating_point() {
                    moved.to_dtype(case.dtype)
                } else {
                    moved
                }
            });
            (k, v)
        })
        .collect();

    if let Some(metric) = metric {
        let name = metric.probe_name().to_string();
        let mut run = || -> Result<()> {
            metric.probe_to_device(device);
            let out = metric.probe_forward(&preds, &target, &kwargs)?;
            check_tensor_leaves(&out)
        };
        run().map_err(|e| e.at(&name, Phase::Precision))?;
        debug!(metric = %name, dtype = %case.dtype, %device, "metric supports dtype");
    }
    if let Some(functional) = &case.functional {
        let run = || -> Result<()> {
            let call_kwargs = merge_args(&case.metric_args, &kwargs);
            let out = functional.call(&preds, &target, &call_kwargs)?;
            check_tensor_leaves(&out)
        };
        run().map_err(|e| e.at("functional", Phase::Precision))?;
        debug!(dtype = %case.dtype, %device, "functional supports dtype");
    }
    Ok(())
}

/// Clears `requires_grad` on the borrowed tensor when dropped.
struct GradGuard<'a>(&'a mut Tensor);

impl Drop for GradGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.set_requires_grad(false);
    }
}

/// `t[0, :2]`, or `t[0]` when that is already a scalar.
fn head_pair(t: &Tensor) -> Result<Tensor> {
    let first = t.get(0)?;
    if first.shape().ndim() == 0 {
        return Ok(first);
    }
    let len = first.shape().0[0].min(2);
    Ok(first.narrow(0, 0, len)?)
}

/// Check that the output's `requires_grad` matches the metric's declared
/// differentiability and, for differentiable metrics with a functional form,
/// that the functional's gradient agrees with finite differences.
///
/// Integer `preds` cannot carry gradients and are skipped. `preds` never
/// keeps `requires_grad` after this returns.
pub fn run_differentiability_test<M: Metric>(
    preds: &mut Tensor,
    target: &Tensor,
    functional: Option<&dyn Differentiable>,
    metric_args: &MetricArgs,
) -> Result<()> {
    let mut metric = M::from_args(false, metric_args)?;
    if !preds.is_floating_point() {
        debug!(metric = %metric.name(), dtype = %preds.dtype(), "skipping differentiability probe");
        return Ok(());
    }
    let name = metric.name().to_string();
    let guard = GradGuard(preds);
    let mut probe = || -> Result<()> {
        guard.0.set_requires_grad(true)?;
        let p = head_pair(guard.0)?;
        let t = head_pair(target)?;
        let out = metric.forward(&Input::Tensor(p.clone()), &Input::Tensor(t.clone()), &Kwargs::new())?;
        check_requires_grad(metric.is_differentiable(), &out)?;

        if metric.is_differentiable()
            && let Some(f) = functional
        {
            gradcheck(f, &p.detach().to_dtype(DType::F64), &t.detach())?;
            debug!(metric = %name, "gradcheck passed");
        }
        Ok(())
    };
    probe().map_err(|e| e.at(&name, Phase::Differentiability))
}
