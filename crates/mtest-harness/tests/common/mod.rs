//! Metrics and reference functions shared by the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use mtest_autograd::{Differentiable, ElementOp, vjp};
use mtest_core::{DType, Device, Shape, Tensor};
use mtest_harness::fixtures::{BATCH_SIZE, NUM_BATCHES, NUM_CLASSES, THRESHOLD, gen_data, randint_tensor, rand_tensor};
use mtest_harness::HarnessConfig;
use mtest_metric::{
    ArgValue, Functional, Input, Kwargs, Metric, MetricArgs, MetricBase, MetricError, MetricFlags,
    MetricOutput, Reduction, StateValue,
};
use serde::{Deserialize, Serialize};

pub fn cpu() -> Device {
    Device::Cpu
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Config on a port range private to one test binary.
pub fn config(start_port: u16, max_port: u16) -> HarnessConfig {
    HarnessConfig {
        start_port,
        max_port,
        ..HarnessConfig::default()
    }
}

fn scalar_state(dtype: DType) -> StateValue {
    StateValue::Tensor(Tensor::scalar(0.0, dtype, &Device::Cpu))
}

fn values(input: &Input) -> mtest_metric::Result<Vec<f64>> {
    Ok(input.tensor()?.to_vec_f64())
}

// ── Inputs ──────────────────────────────────────────────────────────────

/// `[NUM_BATCHES]` scalar batches holding 1, 2, 3, 4.
pub fn running_sum_batches() -> Tensor {
    let data: Vec<f32> = (1..=NUM_BATCHES).map(|v| v as f32).collect();
    Tensor::from_f32(&data, &Shape::new(vec![NUM_BATCHES as i64]), &cpu()).unwrap()
}

pub fn regression_inputs(seed: u64) -> (Tensor, Tensor) {
    let n = NUM_BATCHES * BATCH_SIZE;
    let shape = Shape::new(vec![NUM_BATCHES as i64, BATCH_SIZE as i64]);
    let preds = Tensor::from_f32(&gen_data(n, seed), &shape, &cpu()).unwrap();
    let target = Tensor::from_f32(&gen_data(n, seed + 1), &shape, &cpu()).unwrap();
    (preds, target)
}

pub fn binary_inputs(seed: u64) -> (Tensor, Tensor) {
    let dims = [NUM_BATCHES, BATCH_SIZE];
    (
        rand_tensor(&dims, seed, &cpu()).unwrap(),
        randint_tensor(&dims, 2, seed + 1, &cpu()).unwrap(),
    )
}

pub fn multiclass_target(seed: u64) -> Tensor {
    randint_tensor(&[NUM_BATCHES, BATCH_SIZE], NUM_CLASSES, seed, &cpu()).unwrap()
}

// ── Functionals ─────────────────────────────────────────────────────────

fn f64_tensor(input: &Input) -> mtest_metric::Result<Tensor> {
    Ok(input.tensor()?.to_dtype(DType::F64))
}

/// Sum of every prediction, as a rank-0 tensor.
pub fn sum_fn() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        Ok(f64_tensor(preds)?.sum_all().into())
    })
}

pub fn mse_fn() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, target: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        Ok(f64_tensor(preds)?.sub(&f64_tensor(target)?)?.square().mean_all().into())
    })
}

/// Thresholded accuracy; honours a `threshold` keyword.
pub fn accuracy_fn() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, target: &Input, kwargs: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        let threshold = kwargs.get("threshold").and_then(ArgValue::as_f64).unwrap_or(THRESHOLD);
        let preds = preds.tensor()?;
        let hits = preds.ge_scalar(threshold).to_dtype(DType::I64).eq(target.tensor()?)?;
        Ok(hits.to_dtype(DType::F64).mean_all().into())
    })
}

// ── References ──────────────────────────────────────────────────────────

pub fn sum_reference() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        Ok(MetricOutput::Scalar(values(preds)?.iter().sum()))
    })
}

pub fn mse_reference() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, target: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        let p = values(preds)?;
        let t = values(target)?;
        let sse: f64 = p.iter().zip(&t).map(|(a, b)| (a - b) * (a - b)).sum();
        Ok(MetricOutput::Scalar(sse / p.len().max(1) as f64))
    })
}

pub fn accuracy_reference() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, target: &Input, kwargs: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        let threshold = kwargs.get("threshold").and_then(ArgValue::as_f64).unwrap_or(THRESHOLD);
        let p = values(preds)?;
        let t = values(target)?;
        let correct = p
            .iter()
            .zip(&t)
            .filter(|(p, t)| ((**p >= threshold) as i64 as f64) == **t)
            .count();
        Ok(MetricOutput::Scalar(correct as f64 / p.len().max(1) as f64))
    })
}

pub fn stats_reference() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        let p = values(preds)?;
        let sum: f64 = p.iter().sum();
        let mut out = BTreeMap::new();
        out.insert("sum".to_string(), MetricOutput::Scalar(sum));
        out.insert("mean".to_string(), MetricOutput::Scalar(sum / p.len().max(1) as f64));
        Ok(MetricOutput::Mapping(out))
    })
}

/// Off by one from [`sum_reference`].
pub fn wrong_sum_reference() -> Arc<dyn Functional> {
    Arc::new(|preds: &Input, _: &Input, _: &Kwargs| -> mtest_metric::Result<MetricOutput> {
        Ok(MetricOutput::Scalar(values(preds)?.iter().sum::<f64>() + 1.0))
    })
}

// ── Metrics ─────────────────────────────────────────────────────────────

/// Mean squared error, reduced by summing the error and the count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeanSquaredError {
    base: MetricBase,
}

impl Metric for MeanSquaredError {
    fn from_args(dist_sync_on_step: bool, _args: &MetricArgs) -> mtest_metric::Result<Self> {
        let flags = MetricFlags {
            is_differentiable: true,
            higher_is_better: Some(false),
            full_state_update: false,
        };
        let mut base = MetricBase::new("MeanSquaredError", flags, dist_sync_on_step);
        base.add_state("sum_squared_error", scalar_state(DType::F64), Reduction::Sum, false)?;
        base.add_state("total", scalar_state(DType::F64), Reduction::Sum, false)?;
        Ok(Self { base })
    }

    fn base(&self) -> &MetricBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        &mut self.base
    }

    fn update_state(&mut self, preds: &Input, target: &Input, _: &Kwargs) -> mtest_metric::Result<()> {
        let preds = preds.tensor()?.to_dtype(DType::F64);
        let diff = preds.sub(&target.tensor()?.to_dtype(DType::F64))?;
        let sse = self.base.tensor("sum_squared_error")?.add(&diff.square().sum_all())?;
        let n = Tensor::scalar(preds.numel() as f64, DType::F64, preds.device());
        let total = self.base.tensor("total")?.add(&n)?;
        self.base.set_tensor("sum_squared_error", sse)?;
        self.base.set_tensor("total", total)
    }

    fn compute_states(&self) -> mtest_metric::Result<MetricOutput> {
        let sse = self.base.tensor("sum_squared_error")?;
        Ok(sse.div(self.base.tensor("total")?)?.into())
    }
}

/// Functional MSE with its gradient.
pub struct MseFn;

impl Differentiable for MseFn {
    fn forward(&self, preds: &Tensor, target: &Tensor) -> mtest_core::Result<Tensor> {
        Ok(preds.sub(target)?.square().mean_all())
    }

    fn vjp(&self, preds: &Tensor, target: &Tensor, grad_output: &Tensor) -> mtest_core::Result<Tensor> {
        let diff = preds.sub(target)?;
        let g = vjp(ElementOp::MeanAll, &[diff.square()], grad_output)?.remove(0);
        let g = vjp(ElementOp::Square, &[diff], &g)?.remove(0);
        Ok(vjp(ElementOp::Sub, &[preds.clone(), target.clone()], &g)?.remove(0))
    }
}

/// Fraction of thresholded predictions equal to a 0/1 target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BinaryAccuracy {
    base: MetricBase,
    threshold: f64,
}

impl Metric for BinaryAccuracy {
    fn from_args(dist_sync_on_step: bool, args: &MetricArgs) -> mtest_metric::Result<Self> {
        use mtest_metric::ArgsExt;
        let threshold = args.f64_or("threshold", THRESHOLD)?;
        let flags = MetricFlags {
            is_differentiable: false,
            higher_is_better: Some(true),
            full_state_update: false,
        };
        let mut base = MetricBase::new("BinaryAccuracy", flags, dist_sync_on_step);
        base.add_state("correct", scalar_state(DType::I64), Reduction::Sum, false)?;
        base.add_state("total", scalar_state(DType::I64), Reduction::Sum, false)?;
        Ok(Self { base, threshold })
    }

    fn base(&self) -> &MetricBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        &mut self.base
    }

    fn update_state(&mut self, preds: &Input, target: &Input, _: &Kwargs) -> mtest_metric::Result<()> {
        let hard = preds.tensor()?.ge_scalar(self.threshold).to_dtype(DType::I64);
        let hits = hard.eq(target.tensor()?)?.sum_all();
        let n = Tensor::scalar(hard.numel() as f64, DType::I64, hard.device());
        let correct = self.base.tensor("correct")?.add(&hits)?;
        let total = self.base.tensor("total")?.add(&n)?;
        self.base.set_tensor("correct", correct)?;
        self.base.set_tensor("total", total)
    }

    fn compute_states(&self) -> mtest_metric::Result<MetricOutput> {
        let correct = self.base.tensor("correct")?.to_dtype(DType::F64);
        let total = self.base.tensor("total")?.to_dtype(DType::F64);
        Ok(correct.div(&total)?.into())
    }
}

/// Sum and mean of every prediction, as a mapping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SumAndMean {
    base: MetricBase,
}

impl Metric for SumAndMean {
    fn from_args(dist_sync_on_step: bool, _args: &MetricArgs) -> mtest_metric::Result<Self> {
        let mut base = MetricBase::new("SumAndMean", MetricFlags::default(), dist_sync_on_step);
        base.add_state("sum", scalar_state(DType::F64), Reduction::Sum, false)?;
        base.add_state("count", scalar_state(DType::F64), Reduction::Sum, false)?;
        Ok(Self { base })
    }

    fn base(&self) -> &MetricBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        &mut self.base
    }

    fn update_state(&mut self, preds: &Input, _: &Input, _: &Kwargs) -> mtest_metric::Result<()> {
        let preds = preds.tensor()?.to_dtype(DType::F64);
        let n = Tensor::scalar(preds.numel() as f64, DType::F64, preds.device());
        let sum = self.base.tensor("sum")?.add(&preds.sum_all())?;
        let count = self.base.tensor("count")?.add(&n)?;
        self.base.set_tensor("sum", sum)?;
        self.base.set_tensor("count", count)
    }

    fn compute_states(&self) -> mtest_metric::Result<MetricOutput> {
        let sum = self.base.tensor("sum")?.clone();
        let mean = sum.div(self.base.tensor("count")?)?;
        let mut out = BTreeMap::new();
        out.insert("sum".to_string(), MetricOutput::Tensor(sum));
        out.insert("mean".to_string(), MetricOutput::Tensor(mean));
        Ok(MetricOutput::Mapping(out))
    }
}

/// Running sum whose state shows up in the state dict.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistentSum {
    base: MetricBase,
}

impl Metric for PersistentSum {
    fn from_args(dist_sync_on_step: bool, _args: &MetricArgs) -> mtest_metric::Result<Self> {
        let mut base = MetricBase::new("PersistentSum", MetricFlags::default(), dist_sync_on_step);
        base.add_state("x", scalar_state(DType::F64), Reduction::Sum, true)?;
        Ok(Self { base })
    }

    fn base(&self) -> &MetricBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        &mut self.base
    }

    fn update_state(&mut self, preds: &Input, _: &Input, _: &Kwargs) -> mtest_metric::Result<()> {
        let x = self.base.tensor("x")?.add(&preds.tensor()?.sum_all())?;
        self.base.set_tensor("x", x)
    }

    fn compute_states(&self) -> mtest_metric::Result<MetricOutput> {
        Ok(self.base.tensor("x")?.clone().into())
    }
}

/// Running sum that wrongly accepts writes to its class flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutableFlags {
    inner: PersistentSum,
}

impl Metric for MutableFlags {
    fn from_args(dist_sync_on_step: bool, args: &MetricArgs) -> mtest_metric::Result<Self> {
        Ok(Self {
            inner: PersistentSum::from_args(dist_sync_on_step, args)?,
        })
    }

    fn base(&self) -> &MetricBase {
        self.inner.base()
    }

    fn base_mut(&mut self) -> &mut MetricBase {
        self.inner.base_mut()
    }

    fn set_attr(&mut self, attr: &str, _value: &ArgValue) -> mtest_metric::Result<()> {
        match attr {
            "is_differentiable" | "higher_is_better" => Ok(()),
            other => Err(MetricError::UnknownAttribute(other.to_string())),
        }
    }

    fn update_state(&mut self, preds: &Input, target: &Input, kwargs: &Kwargs) -> mtest_metric::Result<()> {
        self.inner.update_state(preds, target, kwargs)
    }

    fn compute_states(&self) -> mtest_metric::Result<MetricOutput> {
        self.inner.compute_states()
    }
}
