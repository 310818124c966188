//! Shared metric bookkeeping: state registry, flags, sync and caching.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use mtest_core::{DType, Device, Tensor};
use mtest_dist::current_group;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::args::ArgValue;
use crate::output::MetricOutput;
use crate::state::{self, Reduction, StateSpec, StateValue};
use crate::{MetricError, Result};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Class-level facts about a metric, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricFlags {
    pub is_differentiable: bool,
    pub higher_is_better: Option<bool>,
    /// Whether `forward` must re-run `update` on the global state instead of
    /// merging a batch-local state into it.
    pub full_state_update: bool,
}

impl Default for MetricFlags {
    fn default() -> Self {
        Self {
            is_differentiable: false,
            higher_is_better: None,
            full_state_update: true,
        }
    }
}

/// Saved states plus their update count.
pub(crate) struct Snapshot {
    states: BTreeMap<String, StateValue>,
    update_count: usize,
}

/// State registry embedded in every metric.
///
/// Cloning yields a new instance id; so does deserialising.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricBase {
    name: String,
    flags: MetricFlags,
    dist_sync_on_step: bool,
    device: Device,
    specs: BTreeMap<String, StateSpec>,
    states: BTreeMap<String, StateValue>,
    update_count: usize,
    #[serde(skip)]
    computed: Option<MetricOutput>,
    #[serde(skip)]
    unsynced: Option<BTreeMap<String, StateValue>>,
    #[serde(skip, default = "next_instance_id")]
    instance_id: u64,
}

impl Clone for MetricBase {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            flags: self.flags,
            dist_sync_on_step: self.dist_sync_on_step,
            device: self.device,
            specs: self.specs.clone(),
            states: self.states.clone(),
            update_count: self.update_count,
            computed: self.computed.clone(),
            unsynced: self.unsynced.clone(),
            instance_id: next_instance_id(),
        }
    }
}

impl MetricBase {
    pub fn new(name: impl Into<String>, flags: MetricFlags, dist_sync_on_step: bool) -> Self {
        Self {
            name: name.into(),
            flags,
            dist_sync_on_step,
            device: Device::Cpu,
            specs: BTreeMap::new(),
            states: BTreeMap::new(),
            update_count: 0,
            computed: None,
            unsynced: None,
            instance_id: next_instance_id(),
        }
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Register a state with its default value and cross-rank reduction.
    pub fn add_state(
        &mut self,
        name: &str,
        default: StateValue,
        reduction: Reduction,
        persistent: bool,
    ) -> Result<()> {
        if self.specs.contains_key(name) {
            return Err(MetricError::DuplicateState(name.to_string()));
        }
        if let StateValue::List(items) = &default
            && !items.is_empty()
        {
            return Err(MetricError::InvalidArgument(format!(
                "list state `{name}` must default to an empty list"
            )));
        }
        let default = default.to_device(&self.device);
        self.states.insert(name.to_string(), default.clone());
        self.specs.insert(
            name.to_string(),
            StateSpec {
                default,
                reduction,
                persistent,
            },
        );
        Ok(())
    }

    /// Mark every state persistent (or not) in the state-dict view.
    pub fn persistent(&mut self, mode: bool) {
        for spec in self.specs.values_mut() {
            spec.persistent = mode;
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> MetricFlags {
        self.flags
    }

    pub fn dist_sync_on_step(&self) -> bool {
        self.dist_sync_on_step
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn update_count(&self) -> usize {
        self.update_count
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn state(&self, name: &str) -> Result<&StateValue> {
        self.states
            .get(name)
            .ok_or_else(|| MetricError::UnknownState(name.to_string()))
    }

    pub fn tensor(&self, name: &str) -> Result<&Tensor> {
        match self.state(name)? {
            StateValue::Tensor(t) => Ok(t),
            StateValue::List(_) => Err(kind_error(name, "tensor")),
        }
    }

    pub fn set_tensor(&mut self, name: &str, value: Tensor) -> Result<()> {
        match self.states.get_mut(name) {
            Some(StateValue::Tensor(t)) => {
                *t = value;
                Ok(())
            }
            Some(StateValue::List(_)) => Err(kind_error(name, "tensor")),
            None => Err(MetricError::UnknownState(name.to_string())),
        }
    }

    pub fn list(&self, name: &str) -> Result<&[Tensor]> {
        match self.state(name)? {
            StateValue::List(items) => Ok(items),
            StateValue::Tensor(_) => Err(kind_error(name, "list")),
        }
    }

    /// Append to a list state.
    pub fn push(&mut self, name: &str, value: Tensor) -> Result<()> {
        match self.states.get_mut(name) {
            Some(StateValue::List(items)) => {
                items.push(value);
                Ok(())
            }
            Some(StateValue::Tensor(_)) => Err(kind_error(name, "list")),
            None => Err(MetricError::UnknownState(name.to_string())),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Runtime attribute write. Class-level flags are immutable.
    pub fn set_attr(&mut self, attr: &str, value: &ArgValue) -> Result<()> {
        match attr {
            "is_differentiable" | "higher_is_better" | "full_state_update" => {
                Err(MetricError::ImmutableAttribute(attr.to_string()))
            }
            "dist_sync_on_step" => {
                self.dist_sync_on_step = value.as_bool().ok_or_else(|| {
                    MetricError::InvalidArgument("dist_sync_on_step must be a bool".into())
                })?;
                Ok(())
            }
            other => Err(MetricError::UnknownAttribute(other.to_string())),
        }
    }

    /// Restore every state to its default and forget cached results.
    pub fn reset(&mut self) {
        self.reset_states();
        self.update_count = 0;
        self.unsynced = None;
    }

    pub fn to_device(&mut self, device: &Device) {
        self.device = *device;
        for value in self.states.values_mut() {
            *value = value.to_device(device);
        }
        for spec in self.specs.values_mut() {
            spec.default = spec.default.to_device(device);
        }
        self.computed = None;
    }

    /// Persistent states only.
    pub fn state_dict(&self) -> BTreeMap<String, StateValue> {
        self.states
            .iter()
            .filter(|(name, _)| self.specs.get(*name).is_some_and(|s| s.persistent))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Check that every state has a static, well-formed signature.
    pub fn check_signature(&self) -> Result<()> {
        self.specs
            .iter()
            .try_for_each(|(name, spec)| spec.check_signature(name))
    }

    /// Identity hash over the metric name, instance id and current state.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.name.hash(&mut hasher);
        self.instance_id.hash(&mut hasher);
        for (name, value) in &self.states {
            name.hash(&mut hasher);
            match value {
                StateValue::Tensor(t) => t.hash(&mut hasher),
                StateValue::List(items) => items.iter().for_each(|t| t.hash(&mut hasher)),
            }
        }
        hasher.finish()
    }

    // ── Internals driven by `Metric` ────────────────────────────────────

    pub(crate) fn begin_update(&mut self) {
        self.update_count += 1;
        self.computed = None;
    }

    pub(crate) fn cached(&self) -> Option<&MetricOutput> {
        self.computed.as_ref()
    }

    pub(crate) fn set_cached(&mut self, output: MetricOutput) {
        self.computed = Some(output);
    }

    pub(crate) fn reset_states(&mut self) {
        self.states = self
            .specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.default.clone()))
            .collect();
        self.computed = None;
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            states: self.states.clone(),
            update_count: self.update_count,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.states = snapshot.states;
        self.update_count = snapshot.update_count;
        self.computed = None;
    }

    /// Fold the current (batch-local) states into `global` using each
    /// state's reduction.
    pub(crate) fn merge_into(&mut self, global: Snapshot) -> Result<()> {
        let update_count = global.update_count + 1;
        let mut merged = BTreeMap::new();
        let mut global_states = global.states;
        for (name, local) in std::mem::take(&mut self.states) {
            let spec = self
                .specs
                .get(&name)
                .ok_or_else(|| MetricError::UnknownState(name.clone()))?;
            let g = global_states
                .remove(&name)
                .ok_or_else(|| MetricError::UnknownState(name.clone()))?;
            let value = state::merge(&name, spec.reduction, g, local, update_count)?;
            merged.insert(name, value);
        }
        self.states = merged;
        self.update_count = update_count;
        self.computed = None;
        Ok(())
    }

    /// Replace local states with their cross-rank reductions. Returns whether a
    /// sync happened; call [`MetricBase::unsync`] afterwards when it did.
    pub(crate) fn sync(&mut self) -> Result<bool> {
        let Some(group) = current_group() else {
            return Ok(false);
        };
        if group.world_size() <= 1 || self.unsynced.is_some() {
            return Ok(false);
        }
        let mut synced = BTreeMap::new();
        for (name, value) in &self.states {
            let reduction = self
                .specs
                .get(name)
                .map(|s| s.reduction)
                .ok_or_else(|| MetricError::UnknownState(name.clone()))?;
            let reduced = match value {
                StateValue::Tensor(t) => {
                    state::reduce_gathered(reduction, group.all_gather(t)?)?
                }
                StateValue::List(items) => {
                    let payload = state::cat_lenient(items)?
                        .unwrap_or_else(|| Tensor::empty(DType::F32, &self.device));
                    let gathered = group.all_gather(&payload)?;
                    match reduction {
                        Reduction::Cat => {
                            StateValue::List(state::cat_lenient(&gathered)?.into_iter().collect())
                        }
                        _ => StateValue::List(gathered),
                    }
                }
            };
            synced.insert(name.clone(), reduced);
        }
        debug!(metric = %self.name, rank = group.rank(), states = synced.len(), "synced states");
        self.unsynced = Some(std::mem::replace(&mut self.states, synced));
        Ok(true)
    }

    /// Restore the local states saved by [`MetricBase::sync`].
    pub(crate) fn unsync(&mut self) {
        if let Some(local) = self.unsynced.take() {
            self.states = local;
        }
    }
}

fn kind_error(name: &str, expected: &'static str) -> MetricError {
    MetricError::StateKind {
        name: name.to_string(),
        expected,
    }
}
