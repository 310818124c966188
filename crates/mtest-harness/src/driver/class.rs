//! Class-metric driver: one rank's share of a (possibly distributed) run.
//!
//! Rank `r` of `world_size` feeds batches `r, r + world_size, ...` through
//! `forward`, checking each step against the reference, then checks the
//! synced aggregate from `compute` against the reference over every batch.

use std::sync::Arc;

use mtest_core::Device;
use mtest_metric::{ArgValue, Functional, Kwargs, Metric, MetricArgs, MetricError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::check_lengths;
use crate::batch::{BatchSeq, kwargs_cpu, kwargs_to_device, slice_kwargs, union_kwargs};
use crate::compare::{check_aggregate, check_step, check_tensor_leaves};
use crate::{HarnessError, Phase, Result};

/// A metric the class driver can exercise: clonable, serializable and
/// movable to a worker thread.
pub trait TestableMetric: Metric + Clone + Serialize + DeserializeOwned + Send + 'static {}

impl<M> TestableMetric for M where M: Metric + Clone + Serialize + DeserializeOwned + Send + 'static {}

/// Switches for [`class_test`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassOptions {
    /// Construct the metric with per-step synchronisation.
    pub dist_sync_on_step: bool,
    /// Check synced per-step results on rank 0.
    pub check_dist_sync_on_step: bool,
    /// Check unsynced per-step results.
    pub check_batch: bool,
    /// Split keyword tensors across ranks the way batches are split.
    pub fragment_kwargs: bool,
    pub check_scriptable: bool,
    pub check_state_dict: bool,
}

impl Default for ClassOptions {
    fn default() -> Self {
        Self {
            dist_sync_on_step: false,
            check_dist_sync_on_step: true,
            check_batch: true,
            fragment_kwargs: false,
            check_scriptable: true,
            check_state_dict: true,
        }
    }
}

/// Inputs for [`class_test`].
#[derive(Clone)]
pub struct ClassCase {
    pub preds: BatchSeq,
    pub target: BatchSeq,
    pub reference: Arc<dyn Functional>,
    /// Construction arguments for the metric.
    pub metric_args: MetricArgs,
    /// Per-call keywords; tensors carry a leading batch axis.
    pub kwargs: Kwargs,
    pub options: ClassOptions,
}

impl ClassCase {
    pub fn new(
        preds: impl Into<BatchSeq>,
        target: impl Into<BatchSeq>,
        reference: Arc<dyn Functional>,
    ) -> Self {
        Self {
            preds: preds.into(),
            target: target.into(),
            reference,
            metric_args: MetricArgs::new(),
            kwargs: Kwargs::new(),
            options: ClassOptions::default(),
        }
    }

    pub fn with_metric_args(mut self, metric_args: MetricArgs) -> Self {
        self.metric_args = metric_args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_options(mut self, options: ClassOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dist_sync_on_step(mut self, on: bool) -> Self {
        self.options.dist_sync_on_step = on;
        self
    }
}

/// Batches fed to `rank`: `rank, rank + world_size, ...` below `num_batches`.
pub fn rank_indices(rank: usize, world_size: usize, num_batches: usize) -> Vec<usize> {
    (rank..num_batches).step_by(world_size.max(1)).collect()
}

/// Run rank `rank`'s share of `case` against a fresh `M`.
pub fn class_test<M: TestableMetric>(
    rank: usize,
    world_size: usize,
    case: &ClassCase,
    atol: f64,
    device: &Device,
) -> Result<()> {
    let num_batches = check_lengths(case.preds.len(), case.target.len())?;
    let opts = case.options;
    if opts.dist_sync_on_step && world_size > 1 && num_batches % world_size != 0 {
        return Err(HarnessError::Precondition(format!(
            "{num_batches} batches cannot be split evenly over {world_size} ranks"
        )));
    }

    let metric = M::from_args(opts.dist_sync_on_step, &case.metric_args)?;
    let name = metric.name().to_string();
    let mut metric = setup(metric, device, opts).map_err(|e| e.at(&name, Phase::Setup))?;

    let preds = case.preds.to_device(device);
    let target = case.target.to_device(device);
    let kwargs = kwargs_to_device(&case.kwargs, device);
    let host_preds = preds.cpu();
    let host_target = target.cpu();
    let host_kwargs = kwargs_cpu(&kwargs);

    for i in rank_indices(rank, world_size, num_batches) {
        let sliced = slice_kwargs(&kwargs, i)?;
        let batch_result = metric
            .forward(&preds.batch(i)?, &target.batch(i)?, &sliced)
            .map_err(|e| HarnessError::from(e).at(&name, Phase::Step(i)))?;

        if metric.dist_sync_on_step() && opts.check_dist_sync_on_step && rank == 0 {
            let check = || -> Result<()> {
                let indices: Vec<usize> = (i..i + world_size).collect();
                let ref_kwargs = if opts.fragment_kwargs {
                    union_kwargs(&host_kwargs, &indices)?
                } else {
                    kwargs_cpu(&sliced)
                };
                let expected = case.reference.call(
                    &host_preds.union(&indices)?,
                    &host_target.union(&indices)?,
                    &ref_kwargs,
                )?;
                check_step(&batch_result, &expected, atol)
            };
            check().map_err(|e| e.at(&name, Phase::SyncedStep(i)))?;
            debug!(metric = %name, rank, batch = i, "synced step matched");
        } else if opts.check_batch && !metric.dist_sync_on_step() {
            let check = || -> Result<()> {
                let ref_kwargs = if opts.fragment_kwargs {
                    kwargs_cpu(&sliced)
                } else {
                    host_kwargs.clone()
                };
                let expected = case.reference.call(
                    &host_preds.batch(i)?,
                    &host_target.batch(i)?,
                    &ref_kwargs,
                )?;
                check_step(&batch_result, &expected, atol)
            };
            check().map_err(|e| e.at(&name, Phase::Step(i)))?;
            debug!(metric = %name, rank, batch = i, "step matched");
        }
    }

    let mut aggregate = || -> Result<()> {
        let hash = metric.metric_hash();
        if metric.metric_hash() != hash {
            return Err(HarnessError::Assertion("metric hash is not stable".into()));
        }
        if opts.check_state_dict {
            let state = metric.state_dict();
            if !state.is_empty() {
                let names: Vec<&str> = state.keys().map(String::as_str).collect();
                return Err(HarnessError::Assertion(format!(
                    "state dict should be empty, found {names:?}"
                )));
            }
        }

        let result = metric.compute()?;
        check_tensor_leaves(&result)?;

        let all: Vec<usize> = (0..num_batches).collect();
        let expected = case.reference.call(
            &host_preds.union(&all)?,
            &host_target.union(&all)?,
            &union_kwargs(&host_kwargs, &all)?,
        )?;
        check_aggregate(&result, &expected, atol)
    };
    aggregate().map_err(|e| e.at(&name, Phase::Aggregate))?;
    debug!(metric = %name, rank, world_size, "aggregate matched");
    Ok(())
}

fn setup<M: TestableMetric>(mut metric: M, device: &Device, opts: ClassOptions) -> Result<M> {
    let flags = metric.flags();
    expect_immutable(
        &mut metric,
        "is_differentiable",
        ArgValue::Bool(!flags.is_differentiable),
    )?;
    let flipped = match flags.higher_is_better {
        Some(v) => ArgValue::Bool(!v),
        None => ArgValue::Bool(true),
    };
    expect_immutable(&mut metric, "higher_is_better", flipped)?;

    if opts.check_scriptable {
        metric.script()?;
    }

    let clone = metric.clone();
    if clone.instance_id() == metric.instance_id() {
        return Err(HarnessError::Assertion(
            "clone shares the metric's identity".into(),
        ));
    }
    if clone.name() != metric.name() {
        return Err(HarnessError::Assertion(format!(
            "clone is a {} but the metric is a {}",
            clone.name(),
            metric.name()
        )));
    }

    metric.to_device(device);
    let bytes = serde_json::to_vec(&metric)?;
    let restored: M = serde_json::from_slice(&bytes)?;
    Ok(restored)
}

fn expect_immutable<M: Metric>(metric: &mut M, attr: &str, value: ArgValue) -> Result<()> {
    match metric.set_attr(attr, &value) {
        Err(MetricError::ImmutableAttribute(_)) => Ok(()),
        Err(e) => Err(e.into()),
        Ok(()) => Err(HarnessError::Assertion(format!(
            "writing `{attr}` should fail after construction"
        ))),
    }
}
