//! Single-process driver for stateless metric functions.

use std::sync::Arc;

use mtest_core::Device;
use mtest_metric::{Functional, Kwargs, MetricArgs, MetricOutput};
use tracing::debug;

use super::{check_lengths, merge_args};
use crate::batch::{BatchSeq, kwargs_cpu, kwargs_to_device, slice_kwargs, union_kwargs};
use crate::compare::check_allclose;
use crate::{Phase, Result};

/// Inputs for [`functional_test`].
#[derive(Clone)]
pub struct FunctionalCase {
    pub preds: BatchSeq,
    pub target: BatchSeq,
    /// Function under test.
    pub metric: Arc<dyn Functional>,
    pub reference: Arc<dyn Functional>,
    /// Bound into every call of `metric`, never passed to `reference`.
    pub metric_args: MetricArgs,
    /// Per-call keywords; tensors carry a leading batch axis.
    pub kwargs: Kwargs,
    /// Give the reference the batch's slice of each keyword tensor rather
    /// than the full tensor.
    pub fragment_kwargs: bool,
    /// Compare the last batch's result against the reference over every batch.
    pub check_final_aggregate: bool,
}

impl FunctionalCase {
    pub fn new(
        preds: impl Into<BatchSeq>,
        target: impl Into<BatchSeq>,
        metric: Arc<dyn Functional>,
        reference: Arc<dyn Functional>,
    ) -> Self {
        Self {
            preds: preds.into(),
            target: target.into(),
            metric,
            reference,
            metric_args: MetricArgs::new(),
            kwargs: Kwargs::new(),
            fragment_kwargs: false,
            check_final_aggregate: false,
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

    pub fn fragment_kwargs(mut self, on: bool) -> Self {
        self.fragment_kwargs = on;
        self
    }

    pub fn check_final_aggregate(mut self, on: bool) -> Self {
        self.check_final_aggregate = on;
        self
    }
}

/// Run `case.metric` batch by batch on `device` and compare every result
/// against `case.reference` evaluated on host copies.
pub fn functional_test(name: &str, case: &FunctionalCase, atol: f64, device: &Device) -> Result<()> {
    let num_batches = check_lengths(case.preds.len(), case.target.len())?;
    let preds = case.preds.to_device(device);
    let target = case.target.to_device(device);
    let kwargs = kwargs_to_device(&case.kwargs, device);
    let host_kwargs = kwargs_cpu(&kwargs);

    let mut last = MetricOutput::None;
    for i in 0..num_batches {
        let step = || -> Result<MetricOutput> {
            let sliced = slice_kwargs(&kwargs, i)?;
            let call_kwargs = merge_args(&case.metric_args, &sliced);
            let result = case
                .metric
                .call(&preds.batch(i)?, &target.batch(i)?, &call_kwargs)?;
            let ref_kwargs = if case.fragment_kwargs {
                kwargs_cpu(&sliced)
            } else {
                host_kwargs.clone()
            };
            let expected = case.reference.call(
                &preds.batch(i)?.to_device(&Device::Cpu),
                &target.batch(i)?.to_device(&Device::Cpu),
                &ref_kwargs,
            )?;
            check_allclose(&result, &expected, atol, None)?;
            Ok(result)
        };
        last = step().map_err(|e| e.at(name, Phase::Batch(i)))?;
        debug!(metric = name, batch = i, "functional batch matched");
    }

    let aggregate = || -> Result<()> {
        let all = (0..num_batches).collect::<Vec<_>>();
        let expected = case.reference.call(
            &preds.cpu().union(&all)?,
            &target.cpu().union(&all)?,
            &union_kwargs(&host_kwargs, &all)?,
        )?;
        if case.check_final_aggregate {
            check_allclose(&last, &expected, atol, None)?;
        }
        Ok(())
    };
    aggregate().map_err(|e| e.at(name, Phase::Aggregate))
}
