//! Minimal metrics for exercising the harness itself.

use mtest_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::args::{Input, Kwargs, MetricArgs};
use crate::base::{MetricBase, MetricFlags};
use crate::metric::Metric;
use crate::output::MetricOutput;
use crate::state::{Reduction, StateValue};
use crate::{MetricError, Result};

fn reject_args(name: &str, args: &MetricArgs) -> Result<()> {
    match args.keys().next() {
        Some(key) => Err(MetricError::InvalidArgument(format!(
            "{name} takes no arguments, got `{key}`"
        ))),
        None => Ok(()),
    }
}

/// Base with a single scalar `x` state reduced by sum.
fn scalar_sum_base(
    name: &str,
    is_differentiable: bool,
    dist_sync_on_step: bool,
) -> Result<MetricBase> {
    let flags = MetricFlags {
        is_differentiable,
        higher_is_better: Some(true),
        full_state_update: true,
    };
    let mut base = MetricBase::new(name, flags, dist_sync_on_step);
    base.add_state(
        "x",
        StateValue::Tensor(Tensor::scalar(0.0, DType::F32, &Device::Cpu)),
        Reduction::Sum,
        false,
    )?;
    Ok(base)
}

// ── DummyMetric ─────────────────────────────────────────────────────────

/// Holds a summed scalar state but never updates it; computes nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DummyMetric {
    base: MetricBase,
}

impl Metric for DummyMetric {
    fn from_args(dist_sync_on_step: bool, args: &MetricArgs) -> Result<Self> {
        reject_args("Dummy", args)?;
        Ok(Self {
            base: scalar_sum_base("Dummy", false, dist_sync_on_step)?,
        })
    }

    fn base(&self) -> &MetricBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        &mut self.base
    }

    fn update_state(&mut self, _preds: &Input, _target: &Input, _kwargs: &Kwargs) -> Result<()> {
        Ok(())
    }

    fn compute_states(&self) -> Result<MetricOutput> {
        Ok(MetricOutput::None)
    }
}

// ── DummyListMetric ─────────────────────────────────────────────────────

/// Appends each input to a concatenated list state.
///
/// Appends `kwargs["x"]` when given, else `preds`, else the integer `1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DummyListMetric {
    base: MetricBase,
}

impl Metric for DummyListMetric {
    fn from_args(dist_sync_on_step: bool, args: &MetricArgs) -> Result<Self> {
        reject_args("DummyList", args)?;
        let mut base = MetricBase::new("DummyList", MetricFlags::default(), dist_sync_on_step);
        base.add_state("x", StateValue::List(Vec::new()), Reduction::Cat, false)?;
        Ok(Self { base })
    }

    fn base(&self) -> &MetricBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        &mut self.base
    }

    fn update_state(&mut self, preds: &Input, _target: &Input, kwargs: &Kwargs) -> Result<()> {
        let item = match (kwargs.get("x").and_then(|v| v.as_tensor()), preds) {
            (Some(x), _) => x.clone(),
            (None, Input::Tensor(t)) => t.clone(),
            (None, Input::Items(_)) => Tensor::scalar(1.0, DType::I64, self.base.device()),
        };
        self.base.push("x", item)
    }

    fn compute_states(&self) -> Result<MetricOutput> {
        Ok(self.base.list("x")?.to_vec().into())
    }
}

// ── DummyMetricSum / DummyMetricDiff ────────────────────────────────────

/// Running sum of every prediction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DummyMetricSum {
    base: MetricBase,
}

impl Metric for DummyMetricSum {
    fn from_args(dist_sync_on_step: bool, args: &MetricArgs) -> Result<Self> {
        reject_args("DummySum", args)?;
        Ok(Self {
            base: scalar_sum_base("DummySum", true, dist_sync_on_step)?,
        })
    }

    fn base(&self) -> &MetricBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        &mut self.base
    }

    fn update_state(&mut self, preds: &Input, _target: &Input, _kwargs: &Kwargs) -> Result<()> {
        let x = self.base.tensor("x")?.add(&preds.tensor()?.sum_all())?;
        self.base.set_tensor("x", x)
    }

    fn compute_states(&self) -> Result<MetricOutput> {
        Ok(self.base.tensor("x")?.clone().into())
    }
}

/// Running negated sum of every prediction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DummyMetricDiff {
    base: MetricBase,
}

impl Metric for DummyMetricDiff {
    fn from_args(dist_sync_on_step: bool, args: &MetricArgs) -> Result<Self> {
        reject_args("DummyDiff", args)?;
        Ok(Self {
            base: scalar_sum_base("DummyDiff", true, dist_sync_on_step)?,
        })
    }

    fn base(&self) -> &MetricBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        &mut self.base
    }

    fn update_state(&mut self, preds: &Input, _target: &Input, _kwargs: &Kwargs) -> Result<()> {
        let x = self.base.tensor("x")?.sub(&preds.tensor()?.sum_all())?;
        self.base.set_tensor("x", x)
    }

    fn compute_states(&self) -> Result<MetricOutput> {
        Ok(self.base.tensor("x")?.clone().into())
    }
}

// ── DummyMetricMultiOutput ──────────────────────────────────────────────

/// Running sum, reported twice as a sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DummyMetricMultiOutput {
    inner: DummyMetricSum,
}

impl Metric for DummyMetricMultiOutput {
    fn from_args(dist_sync_on_step: bool, args: &MetricArgs) -> Result<Self> {
        Ok(Self {
            inner: DummyMetricSum::from_args(dist_sync_on_step, args)?,
        })
    }

    fn base(&self) -> &MetricBase {
        self.inner.base()
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        self.inner.base_mut()
    }

    fn update_state(&mut self, preds: &Input, target: &Input, kwargs: &Kwargs) -> Result<()> {
        self.inner.update_state(preds, target, kwargs)
    }

    fn compute_states(&self) -> Result<MetricOutput> {
        let x = self.inner.base().tensor("x")?.clone();
        Ok(vec![x.clone(), x].into())
    }
}
