//! Recursive result comparator and leaf checks.
//!
//! Closeness is absolute: `|actual - expected| <= atol`. NaN matches NaN and
//! equal infinities match. Size-1 dimensions broadcast.

use mtest_core::{DType, Device, Shape, Tensor};
use mtest_metric::MetricOutput;
use tracing::debug;

use crate::{HarnessError, Result};

/// Compare a metric result against an expected value.
///
/// Mapping and record results need `key`: `actual[key]` is compared against
/// `expected`, which the caller has already extracted.
pub fn check_allclose(
    actual: &MetricOutput,
    expected: &MetricOutput,
    atol: f64,
    key: Option<&str>,
) -> Result<()> {
    match actual {
        MetricOutput::Tensor(t) => tensor_close(t, expected, atol),
        MetricOutput::Sequence(items) => match expected {
            MetricOutput::Sequence(exp) => {
                if items.len() != exp.len() {
                    return Err(HarnessError::SequenceLength {
                        actual: items.len(),
                        expected: exp.len(),
                    });
                }
                items
                    .iter()
                    .zip(exp)
                    .try_for_each(|(a, e)| check_allclose(a, e, atol, None))
            }
            // A stacked expected value lines up with the sequence along its leading axis.
            MetricOutput::Tensor(exp) => {
                let rows = exp.shape().0.first().copied().unwrap_or(0) as usize;
                if items.len() != rows {
                    return Err(HarnessError::SequenceLength {
                        actual: items.len(),
                        expected: rows,
                    });
                }
                items.iter().enumerate().try_for_each(|(i, a)| {
                    let row = exp.get(i as i64)?;
                    check_allclose(a, &MetricOutput::Tensor(row), atol, None)
                })
            }
            other => Err(HarnessError::UnsupportedShape(other.kind())),
        },
        MetricOutput::Mapping(_) | MetricOutput::Record(_) => {
            let key = key.ok_or(HarnessError::MissingKey(actual.kind()))?;
            let entry = actual
                .get(key)
                .ok_or_else(|| HarnessError::KeyNotFound(key.to_string()))?;
            match &entry {
                MetricOutput::Tensor(t) => tensor_close(t, expected, atol),
                other => Err(HarnessError::UnsupportedShape(other.kind())),
            }
        }
        other => Err(HarnessError::UnsupportedShape(other.kind())),
    }
}

fn tensor_close(actual: &Tensor, expected: &MetricOutput, atol: f64) -> Result<()> {
    let expected = match expected {
        MetricOutput::Tensor(t) => t.cpu(),
        MetricOutput::Scalar(v) => Tensor::scalar(*v, DType::F64, &Device::Cpu),
        other => return Err(HarnessError::UnsupportedShape(other.kind())),
    };
    let actual = actual.detach().cpu().to_dtype(DType::F64);
    let expected = expected.to_dtype(DType::F64);
    let shape = Shape::broadcast_shapes(actual.shape(), expected.shape()).ok_or_else(|| {
        HarnessError::ShapeMismatch {
            actual: actual.shape().0.clone(),
            expected: expected.shape().0.clone(),
        }
    })?;
    let a = actual.broadcast_to(&shape)?;
    let e = expected.broadcast_to(&shape)?;
    for (index, (&x, &y)) in a.as_slice().iter().zip(e.as_slice()).enumerate() {
        if !values_close(x, y, atol) {
            return Err(HarnessError::Mismatch {
                index,
                actual: x,
                expected: y,
                diff: (x - y).abs(),
                atol,
            });
        }
    }
    debug!(elements = a.numel(), atol, "tensors close");
    Ok(())
}

/// Absolute closeness with NaN == NaN and equal infinities.
pub fn values_close(actual: f64, expected: f64, atol: f64) -> bool {
    if actual.is_nan() || expected.is_nan() {
        return actual.is_nan() && expected.is_nan();
    }
    actual == expected || (actual - expected).abs() <= atol
}

/// Per-step comparison: a keyed result is checked key by key against the
/// reference's entries.
pub fn check_step(result: &MetricOutput, reference: &MetricOutput, atol: f64) -> Result<()> {
    if result.is_keyed() {
        for key in result.keys() {
            let expected = reference
                .get(&key)
                .ok_or_else(|| HarnessError::KeyNotFound(key.clone()))?;
            check_allclose(result, &expected, atol, Some(&key))?;
        }
        Ok(())
    } else {
        check_allclose(result, reference, atol, None)
    }
}

/// Aggregate comparison: a keyed reference drives which keys are checked.
pub fn check_aggregate(result: &MetricOutput, reference: &MetricOutput, atol: f64) -> Result<()> {
    if reference.is_keyed() {
        for key in reference.keys() {
            let expected = reference
                .get(&key)
                .ok_or_else(|| HarnessError::KeyNotFound(key.clone()))?;
            check_allclose(result, &expected, atol, Some(&key))?;
        }
        Ok(())
    } else {
        check_allclose(result, reference, atol, None)
    }
}

// ── Leaf checks ─────────────────────────────────────────────────────────

/// Every leaf of `result` must be a tensor.
pub fn check_tensor_leaves(result: &MetricOutput) -> Result<()> {
    walk(result, "result", &mut |_, _| Ok(()))
}

/// Every leaf tensor's `requires_grad` must equal `is_differentiable`.
pub fn check_requires_grad(is_differentiable: bool, result: &MetricOutput) -> Result<()> {
    walk(result, "result", &mut |path, t| {
        if t.requires_grad() == is_differentiable {
            Ok(())
        } else {
            Err(HarnessError::GradFlag {
                path: path.to_string(),
                actual: t.requires_grad(),
                expected: is_differentiable,
            })
        }
    })
}

fn walk(
    node: &MetricOutput,
    path: &str,
    visit: &mut impl FnMut(&str, &Tensor) -> Result<()>,
) -> Result<()> {
    match node {
        MetricOutput::Tensor(t) => visit(path, t),
        MetricOutput::Sequence(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| walk(item, &format!("{path}[{i}]"), visit)),
        MetricOutput::Mapping(map) => map
            .iter()
            .try_for_each(|(k, v)| walk(v, &format!("{path}.{k}"), visit)),
        MetricOutput::Record(record) => record
            .fields()
            .try_for_each(|(k, t)| visit(&format!("{path}.{k}"), t)),
        other => Err(HarnessError::NotATensor {
            path: path.to_string(),
            kind: other.kind(),
        }),
    }
}
