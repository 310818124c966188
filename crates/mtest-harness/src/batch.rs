//! Batched inputs and keyword-argument slicing.

use mtest_core::{Device, Tensor};
use mtest_metric::{ArgValue, Input, Kwargs, TensorMap};

use crate::{HarnessError, Result};

/// A sequence of batches, indexed along the leading axis.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchSeq {
    /// `[num_batches, batch_size, ...]`.
    Stacked(Tensor),
    /// Per batch, a list of dict-shaped items.
    Nested(Vec<Vec<TensorMap>>),
}

impl BatchSeq {
    pub fn len(&self) -> usize {
        match self {
            BatchSeq::Stacked(t) => t.shape().0.first().copied().unwrap_or(0) as usize,
            BatchSeq::Nested(batches) => batches.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, BatchSeq::Stacked(t) if t.is_floating_point())
    }

    /// Batch `i`.
    pub fn batch(&self, i: usize) -> Result<Input> {
        match self {
            BatchSeq::Stacked(t) => Ok(Input::Tensor(t.get(i as i64)?)),
            BatchSeq::Nested(batches) => batches
                .get(i)
                .cloned()
                .map(Input::Items)
                .ok_or_else(|| {
                    HarnessError::Precondition(format!(
                        "batch {i} out of range for {} batches",
                        batches.len()
                    ))
                }),
        }
    }

    /// Batches `indices` joined along the sample axis.
    pub fn union(&self, indices: &[usize]) -> Result<Input> {
        match self {
            BatchSeq::Stacked(t) => {
                let parts = indices
                    .iter()
                    .map(|&i| t.get(i as i64))
                    .collect::<mtest_core::Result<Vec<_>>>()?;
                Ok(Input::Tensor(join(&parts)?))
            }
            BatchSeq::Nested(_) => {
                let mut items = Vec::new();
                for &i in indices {
                    if let Input::Items(batch) = self.batch(i)? {
                        items.extend(batch);
                    }
                }
                Ok(Input::Items(items))
            }
        }
    }

    /// Every batch joined.
    pub fn all(&self) -> Result<Input> {
        let indices: Vec<usize> = (0..self.len()).collect();
        self.union(&indices)
    }

    pub fn to_device(&self, device: &Device) -> BatchSeq {
        match self {
            BatchSeq::Stacked(t) => BatchSeq::Stacked(t.to_device(device)),
            BatchSeq::Nested(batches) => BatchSeq::Nested(
                batches
                    .iter()
                    .map(|b| {
                        b.iter()
                            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.to_device(device))).collect())
                            .collect()
                    })
                    .collect(),
            ),
        }
    }

    pub fn cpu(&self) -> BatchSeq {
        self.to_device(&Device::Cpu)
    }
}

impl From<Tensor> for BatchSeq {
    fn from(t: Tensor) -> Self {
        BatchSeq::Stacked(t)
    }
}

impl From<Vec<Vec<TensorMap>>> for BatchSeq {
    fn from(batches: Vec<Vec<TensorMap>>) -> Self {
        BatchSeq::Nested(batches)
    }
}

/// Concatenate along the leading axis; zero-dimensional batches are stacked.
fn join(parts: &[Tensor]) -> Result<Tensor> {
    let scalar = parts.first().is_some_and(|t| t.shape().ndim() == 0);
    let joined = if scalar {
        Tensor::stack(parts)?
    } else {
        Tensor::cat(parts)?
    };
    Ok(joined)
}

// ── Keyword arguments ───────────────────────────────────────────────────

/// Tensor keywords indexed at batch `i`; other values pass through.
pub fn slice_kwargs(kwargs: &Kwargs, i: usize) -> Result<Kwargs> {
    kwargs
        .iter()
        .map(|(k, v)| {
            let value = match v {
                ArgValue::Tensor(t) => ArgValue::Tensor(t.get(i as i64)?),
                other => other.clone(),
            };
            Ok((k.clone(), value))
        })
        .collect()
}

/// Tensor keywords sliced at each of `indices` and joined.
pub fn union_kwargs(kwargs: &Kwargs, indices: &[usize]) -> Result<Kwargs> {
    kwargs
        .iter()
        .map(|(k, v)| {
            let value = match v {
                ArgValue::Tensor(t) => {
                    let parts = indices
                        .iter()
                        .map(|&i| t.get(i as i64))
                        .collect::<mtest_core::Result<Vec<_>>>()?;
                    ArgValue::Tensor(join(&parts)?)
                }
                other => other.clone(),
            };
            Ok((k.clone(), value))
        })
        .collect()
}

pub fn kwargs_to_device(kwargs: &Kwargs, device: &Device) -> Kwargs {
    kwargs
        .iter()
        .map(|(k, v)| (k.clone(), v.map_tensor(|t| t.to_device(device))))
        .collect()
}

pub fn kwargs_cpu(kwargs: &Kwargs) -> Kwargs {
    kwargs_to_device(kwargs, &Device::Cpu)
}
