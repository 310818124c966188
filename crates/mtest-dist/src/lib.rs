//! In-process process-group substrate.
//!
//! Ranks are threads. A rendezvous is reserved with [`bind`] on an
//! `(addr, port)` endpoint; each worker thread then joins it once with
//! [`init_process_group`], which installs the group as that thread's current
//! group. Metrics find the group through [`current_group`] and exchange state
//! with [`ProcessGroup::all_gather`].
//!
//! Collectives block until every rank arrives. A rank that fails calls
//! [`abort_current`] so its peers return [`DistError::Aborted`] instead of
//! waiting forever; the owner of the [`GroupHandle`] calls
//! [`GroupHandle::recover`] before the next round of work.

mod collective;
pub mod group;

pub use group::{
    DistInit, Endpoint, GroupHandle, ProcessGroup, abort_current, bind, current_group,
    destroy_process_group, init_process_group, is_initialized,
};

pub type Result<T> = std::result::Result<T, DistError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DistError {
    #[error("address already in use: {0}")]
    AddressInUse(Endpoint),

    #[error("no rendezvous bound at {0}")]
    NoRendezvous(Endpoint),

    #[error("world size mismatch: rendezvous expects {expected}, got {got}")]
    WorldSizeMismatch { expected: usize, got: usize },

    #[error("invalid world size {0}")]
    InvalidWorldSize(usize),

    #[error("rank {rank} out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("rank {0} already joined the group")]
    RankTaken(usize),

    #[error("process group already initialized on this thread")]
    AlreadyInitialized,

    #[error("process group not initialized on this thread")]
    NotInitialized,

    #[error("collective aborted by a failing peer")]
    Aborted,
}
