//! Metric results.

use std::collections::BTreeMap;

use mtest_core::{Device, Tensor};

/// Multi-field detection result (mAP-style): one named tensor per statistic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionRecord {
    fields: BTreeMap<String, Tensor>,
}

impl DetectionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A metric or reference result.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricOutput {
    Tensor(Tensor),
    Sequence(Vec<MetricOutput>),
    Mapping(BTreeMap<String, MetricOutput>),
    Record(DetectionRecord),
    /// A bare number, as reference implementations often return.
    Scalar(f64),
    None,
}

impl MetricOutput {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            MetricOutput::Tensor(_) => "tensor",
            MetricOutput::Sequence(_) => "sequence",
            MetricOutput::Mapping(_) => "mapping",
            MetricOutput::Record(_) => "record",
            MetricOutput::Scalar(_) => "scalar",
            MetricOutput::None => "none",
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            MetricOutput::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Entry `key` of a mapping or record.
    pub fn get(&self, key: &str) -> Option<MetricOutput> {
        match self {
            MetricOutput::Mapping(m) => m.get(key).cloned(),
            MetricOutput::Record(r) => r.get(key).cloned().map(MetricOutput::Tensor),
            _ => None,
        }
    }

    /// Keys of a mapping or record, in order.
    pub fn keys(&self) -> Vec<String> {
        match self {
            MetricOutput::Mapping(m) => m.keys().cloned().collect(),
            MetricOutput::Record(r) => r.fields().map(|(k, _)| k.to_string()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, MetricOutput::Mapping(_) | MetricOutput::Record(_))
    }

    /// Apply `f` to every tensor leaf.
    pub fn map_tensors(&self, f: &impl Fn(&Tensor) -> Tensor) -> MetricOutput {
        match self {
            MetricOutput::Tensor(t) => MetricOutput::Tensor(f(t)),
            MetricOutput::Sequence(items) => {
                MetricOutput::Sequence(items.iter().map(|o| o.map_tensors(f)).collect())
            }
            MetricOutput::Mapping(m) => MetricOutput::Mapping(
                m.iter().map(|(k, v)| (k.clone(), v.map_tensors(f))).collect(),
            ),
            MetricOutput::Record(r) => MetricOutput::Record(DetectionRecord {
                fields: r.fields.iter().map(|(k, v)| (k.clone(), f(v))).collect(),
            }),
            other => other.clone(),
        }
    }

    pub fn cpu(&self) -> MetricOutput {
        self.map_tensors(&|t| t.to_device(&Device::Cpu))
    }
}

impl From<Tensor> for MetricOutput {
    fn from(t: Tensor) -> Self {
        MetricOutput::Tensor(t)
    }
}

impl From<Vec<Tensor>> for MetricOutput {
    fn from(ts: Vec<Tensor>) -> Self {
        MetricOutput::Sequence(ts.into_iter().map(MetricOutput::Tensor).collect())
    }
}

impl From<f64> for MetricOutput {
    fn from(v: f64) -> Self {
        MetricOutput::Scalar(v)
    }
}

impl From<DetectionRecord> for MetricOutput {
    fn from(r: DetectionRecord) -> Self {
        MetricOutput::Record(r)
    }
}
