//! The `Metric` and `Functional` traits.

use std::collections::BTreeMap;

use mtest_core::Device;
use tracing::debug;

use crate::args::{ArgValue, Input, Kwargs, MetricArgs};
use crate::base::{MetricBase, MetricFlags};
use crate::output::MetricOutput;
use crate::state::StateValue;
use crate::Result;

/// A stateful accumulator metric.
///
/// Implementors embed a [`MetricBase`], register their states in `from_args`
/// and implement `update_state` and `compute_states`. Everything else is
/// provided.
pub trait Metric: Sized {
    /// Construct from keyword-style arguments.
    fn from_args(dist_sync_on_step: bool, args: &MetricArgs) -> Result<Self>;

    fn base(&self) -> &MetricBase;

    fn base_mut(&mut self) -> &mut MetricBase;

    /// Fold one batch into the states.
    fn update_state(&mut self, preds: &Input, target: &Input, kwargs: &Kwargs) -> Result<()>;

    /// Compute the result from the current states.
    fn compute_states(&self) -> Result<MetricOutput>;

    // ── Provided ────────────────────────────────────────────────────────

    fn name(&self) -> &str {
        self.base().name()
    }

    fn flags(&self) -> MetricFlags {
        self.base().flags()
    }

    fn is_differentiable(&self) -> bool {
        self.base().flags().is_differentiable
    }

    fn higher_is_better(&self) -> Option<bool> {
        self.base().flags().higher_is_better
    }

    fn full_state_update(&self) -> bool {
        self.base().flags().full_state_update
    }

    fn dist_sync_on_step(&self) -> bool {
        self.base().dist_sync_on_step()
    }

    fn instance_id(&self) -> u64 {
        self.base().instance_id()
    }

    fn set_attr(&mut self, attr: &str, value: &ArgValue) -> Result<()> {
        self.base_mut().set_attr(attr, value)
    }

    /// Accumulate one batch.
    fn update(&mut self, preds: &Input, target: &Input, kwargs: &Kwargs) -> Result<()> {
        self.base_mut().begin_update();
        self.update_state(preds, target, kwargs)
    }

    /// Accumulate one batch and return the metric over that batch alone.
    ///
    /// With `dist_sync_on_step` the batch value is synced across ranks, so
    /// every rank must call `forward` the same number of times.
    fn forward(&mut self, preds: &Input, target: &Input, kwargs: &Kwargs) -> Result<MetricOutput> {
        if self.full_state_update() {
            self.update(preds, target, kwargs)?;
            let global = self.base().snapshot();
            self.base_mut().reset_states();
            let batch = self
                .update(preds, target, kwargs)
                .and_then(|()| self.compute_batch());
            self.base_mut().restore(global);
            batch
        } else {
            let global = self.base().snapshot();
            self.base_mut().reset_states();
            match self
                .update(preds, target, kwargs)
                .and_then(|()| self.compute_batch())
            {
                Ok(batch) => {
                    self.base_mut().merge_into(global)?;
                    Ok(batch)
                }
                Err(e) => {
                    self.base_mut().restore(global);
                    Err(e)
                }
            }
        }
    }

    #[doc(hidden)]
    fn compute_batch(&mut self) -> Result<MetricOutput> {
        let synced = if self.dist_sync_on_step() {
            self.base_mut().sync()?
        } else {
            false
        };
        let out = self.compute_states();
        if synced {
            self.base_mut().unsync();
        }
        out
    }

    /// Result over everything accumulated, synced across ranks. Cached until
    /// the next update.
    fn compute(&mut self) -> Result<MetricOutput> {
        if let Some(cached) = self.base().cached() {
            return Ok(cached.clone());
        }
        let synced = self.base_mut().sync()?;
        let out = self.compute_states();
        if synced {
            self.base_mut().unsync();
        }
        let out = out?;
        debug!(metric = %self.name(), updates = self.base().update_count(), "computed");
        self.base_mut().set_cached(out.clone());
        Ok(out)
    }

    fn reset(&mut self) {
        self.base_mut().reset();
    }

    fn to_device(&mut self, device: &Device) {
        self.base_mut().to_device(device);
    }

    fn state_dict(&self) -> BTreeMap<String, StateValue> {
        self.base().state_dict()
    }

    /// Static signature check: every state can be expressed with a fixed
    /// type and reduction.
    fn script(&self) -> Result<()> {
        self.base().check_signature()
    }

    fn metric_hash(&self) -> u64 {
        self.base().state_hash()
    }
}

/// A stateless metric function, used both as the functional form of a metric
/// and as the reference oracle.
pub trait Functional: Send + Sync {
    fn call(&self, preds: &Input, target: &Input, kwargs: &Kwargs) -> Result<MetricOutput>;
}

impl<F> Functional for F
where
    F: Fn(&Input, &Input, &Kwargs) -> Result<MetricOutput> + Send + Sync,
{
    fn call(&self, preds: &Input, target: &Input, kwargs: &Kwargs) -> Result<MetricOutput> {
        self(preds, target, kwargs)
    }
}
