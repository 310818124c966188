//! Metric state values and their reductions.

use mtest_core::{Device, Shape, Tensor};
use serde::{Deserialize, Serialize};

use crate::{MetricError, Result};

/// One named state: a single tensor, or a list of tensors appended per update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Tensor(Tensor),
    List(Vec<Tensor>),
}

impl StateValue {
    pub fn to_device(&self, device: &Device) -> StateValue {
        match self {
            StateValue::Tensor(t) => StateValue::Tensor(t.to_device(device)),
            StateValue::List(items) => {
                StateValue::List(items.iter().map(|t| t.to_device(device)).collect())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Tensor(_) => "tensor",
            StateValue::List(_) => "list",
        }
    }
}

/// How a state is combined across ranks (and across forward calls).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reduction {
    Sum,
    Mean,
    Max,
    Min,
    Cat,
    None,
}

/// Registration record for a state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSpec {
    pub default: StateValue,
    pub reduction: Reduction,
    pub persistent: bool,
}

impl StateSpec {
    /// Whether the reduction is meaningful for the state's kind.
    pub fn check_signature(&self, name: &str) -> Result<()> {
        match (&self.default, self.reduction) {
            (StateValue::List(items), _) if !items.is_empty() => Err(MetricError::NotScriptable(
                format!("list state `{name}` must default to an empty list"),
            )),
            (StateValue::List(_), Reduction::Cat | Reduction::None) => Ok(()),
            (StateValue::List(_), r) => Err(MetricError::NotScriptable(format!(
                "list state `{name}` cannot use {r:?} reduction"
            ))),
            (StateValue::Tensor(_), _) => Ok(()),
        }
    }
}

/// Concatenate along the leading axis, lifting 0-d tensors to `[1]` and
/// skipping empty ones. `None` when nothing is left.
pub fn cat_lenient(tensors: &[Tensor]) -> Result<Option<Tensor>> {
    let lifted = tensors
        .iter()
        .filter(|t| t.numel() > 0)
        .map(|t| {
            if t.shape().ndim() == 0 {
                t.reshape(&Shape::new(vec![1]))
            } else {
                Ok(t.clone())
            }
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if lifted.is_empty() {
        return Ok(None);
    }
    Ok(Some(Tensor::cat(&lifted)?))
}

/// Combine one tensor per rank into the synced value of a tensor state.
pub fn reduce_gathered(reduction: Reduction, gathered: Vec<Tensor>) -> Result<StateValue> {
    let fold = |f: fn(&Tensor, &Tensor) -> mtest_core::Result<Tensor>| -> Result<Tensor> {
        let mut iter = gathered.iter();
        let first = iter
            .next()
            .ok_or_else(|| MetricError::InvalidArgument("nothing gathered".into()))?;
        iter.try_fold(first.clone(), |acc, t| f(&acc, t))
            .map_err(MetricError::from)
    };
    Ok(match reduction {
        Reduction::Sum => StateValue::Tensor(fold(Tensor::add)?),
        Reduction::Mean => {
            let n = gathered.len() as f64;
            let sum = fold(Tensor::add)?;
            let denom = Tensor::scalar(n, sum.dtype(), sum.device());
            StateValue::Tensor(sum.div(&denom)?)
        }
        Reduction::Max => StateValue::Tensor(fold(Tensor::maximum)?),
        Reduction::Min => StateValue::Tensor(fold(Tensor::minimum)?),
        Reduction::Cat => match cat_lenient(&gathered)? {
            Some(t) => StateValue::Tensor(t),
            None => StateValue::Tensor(gathered.into_iter().next().ok_or_else(|| {
                MetricError::InvalidArgument("nothing gathered".into())
            })?),
        },
        Reduction::None => StateValue::List(gathered),
    })
}

/// Merge a batch-local state into the accumulated global state.
///
/// `update_count` counts updates including the batch being merged.
pub fn merge(
    name: &str,
    reduction: Reduction,
    global: StateValue,
    local: StateValue,
    update_count: usize,
) -> Result<StateValue> {
    match (global, local) {
        (StateValue::List(mut g), StateValue::List(l)) => {
            g.extend(l);
            Ok(StateValue::List(g))
        }
        (StateValue::Tensor(g), StateValue::Tensor(l)) => Ok(match reduction {
            Reduction::Sum => StateValue::Tensor(g.add(&l)?),
            Reduction::Mean => {
                let prior =
                    Tensor::scalar(update_count.saturating_sub(1) as f64, g.dtype(), g.device());
                let weighted = g.mul(&prior)?.add(&l)?;
                let count = Tensor::scalar(update_count as f64, weighted.dtype(), g.device());
                StateValue::Tensor(weighted.div(&count)?)
            }
            Reduction::Max => StateValue::Tensor(g.maximum(&l)?),
            Reduction::Min => StateValue::Tensor(g.minimum(&l)?),
            Reduction::Cat => match cat_lenient(&[g.clone(), l])? {
                Some(t) => StateValue::Tensor(t),
                None => StateValue::Tensor(g),
            },
            Reduction::None => StateValue::Tensor(Tensor::stack(&[g, l])?),
        }),
        _ => Err(MetricError::StateKind {
            name: name.to_string(),
            expected: "state of a consistent kind",
        }),
    }
}
