//! Accumulator metric contract.
//!
//! A metric owns a set of named states registered through [`MetricBase`],
//! each with a default and a cross-rank reduction. Implementors provide
//! `from_args`, `update_state` and `compute_states`; the [`Metric`] trait
//! supplies the lifecycle on top (`update`, `forward`, `compute`, `reset`,
//! device moves, state-dict view, scriptability and hashing).
//!
//! When the calling thread has joined an `mtest-dist` group with more than one
//! rank, `compute` (and `forward` with `dist_sync_on_step`) gathers every state
//! from all ranks, applies its reduction, computes, then restores the local
//! state.

pub mod args;
pub mod base;
pub mod dummy;
pub mod metric;
pub mod output;
pub mod state;

pub use args::{ArgValue, ArgsExt, Input, Kwargs, MetricArgs, TensorMap};
pub use base::{MetricBase, MetricFlags};
pub use metric::{Functional, Metric};
pub use output::{DetectionRecord, MetricOutput};
pub use state::{Reduction, StateSpec, StateValue};

use mtest_core::TensorError;
use mtest_dist::DistError;

pub type Result<T> = std::result::Result<T, MetricError>;

#[derive(thiserror::Error, Debug)]
pub enum MetricError {
    #[error("attribute `{0}` is immutable after construction")]
    ImmutableAttribute(String),

    #[error("unknown attribute `{0}`")]
    UnknownAttribute(String),

    #[error("unknown state `{0}`")]
    UnknownState(String),

    #[error("state `{name}` is not a {expected}")]
    StateKind { name: String, expected: &'static str },

    #[error("state `{0}` is already registered")]
    DuplicateState(String),

    #[error("metric is not scriptable: {0}")]
    NotScriptable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error(transparent)]
    Dist(#[from] DistError),
}
