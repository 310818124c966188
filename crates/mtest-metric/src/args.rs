//! Call arguments: metric inputs, keyword arguments and constructor arguments.

use std::collections::BTreeMap;

use mtest_core::{DType, Device, Tensor};

use crate::{MetricError, Result};

/// A keyword or constructor argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Tensor(Tensor),
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    None,
}

impl ArgValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            ArgValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ArgValue::None)
    }

    /// Apply `f` if this is a tensor, otherwise clone.
    pub fn map_tensor(&self, f: impl FnOnce(&Tensor) -> Tensor) -> ArgValue {
        match self {
            ArgValue::Tensor(t) => ArgValue::Tensor(f(t)),
            other => other.clone(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ArgValue::Tensor(_) => "tensor",
            ArgValue::Float(_) => "float",
            ArgValue::Int(_) => "int",
            ArgValue::Bool(_) => "bool",
            ArgValue::Str(_) => "str",
            ArgValue::None => "none",
        }
    }
}

impl From<Tensor> for ArgValue {
    fn from(t: Tensor) -> Self {
        ArgValue::Tensor(t)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

/// Keyword arguments passed alongside `preds`/`target`.
pub type Kwargs = BTreeMap<String, ArgValue>;

/// Metric constructor arguments.
pub type MetricArgs = BTreeMap<String, ArgValue>;

/// Typed lookups into an argument map with a fallback when the key is absent.
pub trait ArgsExt {
    fn f64_or(&self, key: &str, default: f64) -> Result<f64>;
    fn i64_opt(&self, key: &str) -> Result<Option<i64>>;
    fn bool_or(&self, key: &str, default: bool) -> Result<bool>;
}

impl ArgsExt for BTreeMap<String, ArgValue> {
    fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| wrong_kind(key, "float", v)),
        }
    }

    fn i64_opt(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None | Some(ArgValue::None) => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| wrong_kind(key, "int", v)),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| wrong_kind(key, "bool", v)),
        }
    }
}

fn wrong_kind(key: &str, expected: &str, got: &ArgValue) -> MetricError {
    MetricError::InvalidArgument(format!(
        "argument `{key}` must be {expected}, got {}",
        got.kind()
    ))
}

/// A dict-shaped input item (e.g. one image's detection boxes and labels).
pub type TensorMap = BTreeMap<String, Tensor>;

/// What a metric receives as `preds` or `target` for one call.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Tensor(Tensor),
    Items(Vec<TensorMap>),
}

impl Input {
    /// The tensor payload, or an error for item lists.
    pub fn tensor(&self) -> Result<&Tensor> {
        match self {
            Input::Tensor(t) => Ok(t),
            Input::Items(_) => Err(MetricError::InvalidArgument(
                "expected a tensor input, got a list of items".into(),
            )),
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, Input::Tensor(t) if t.is_floating_point())
    }

    /// Number of samples along the leading axis (or number of items).
    pub fn len(&self) -> usize {
        match self {
            Input::Tensor(t) => t.shape().0.first().copied().unwrap_or(1) as usize,
            Input::Items(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to every tensor in the input.
    pub fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Input {
        match self {
            Input::Tensor(t) => Input::Tensor(f(t)),
            Input::Items(items) => Input::Items(
                items
                    .iter()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), f(v))).collect())
                    .collect(),
            ),
        }
    }

    pub fn to_device(&self, device: &Device) -> Input {
        self.map(|t| t.to_device(device))
    }

    /// Cast floating tensors to `dtype`; others only move to `device`.
    pub fn to_precision(&self, dtype: DType, device: &Device) -> Input {
        self.map(|t| {
            let moved = t.to_device(device);
            if moved.is_floating_point() {
                moved.to_dtype(dtype)
            } else {
                moved
            }
        })
    }
}

impl From<Tensor> for Input {
    fn from(t: Tensor) -> Self {
        Input::Tensor(t)
    }
}

impl From<Vec<TensorMap>> for Input {
    fn from(items: Vec<TensorMap>) -> Self {
        Input::Items(items)
    }
}
