//! Drivers that run a metric over batched inputs and compare each result
//! against a reference.

pub mod class;
pub mod functional;

pub use class::{ClassCase, ClassOptions, TestableMetric, class_test, rank_indices};
pub use functional::{FunctionalCase, functional_test};

use mtest_metric::{Kwargs, MetricArgs};

use crate::{HarnessError, Result};

/// Partially apply `metric_args` to a call's keyword arguments. A keyword
/// passed at the call site wins over a bound metric argument of the same name.
pub(crate) fn merge_args(metric_args: &MetricArgs, kwargs: &Kwargs) -> Kwargs {
    let mut merged = metric_args.clone();
    merged.extend(kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

pub(crate) fn check_lengths(preds: usize, target: usize) -> Result<usize> {
    if preds != target {
        return Err(HarnessError::LengthMismatch { preds, target });
    }
    if preds == 0 {
        return Err(HarnessError::Precondition("no batches to run".into()));
    }
    Ok(preds)
}
