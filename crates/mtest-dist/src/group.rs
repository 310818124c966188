//! Rendezvous registry and per-thread process groups.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use mtest_core::Tensor;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collective::Exchange;
use crate::{DistError, Result};

/// Rendezvous address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// What a worker needs to join a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistInit {
    pub rank: usize,
    pub world_size: usize,
    pub endpoint: Endpoint,
}

struct GroupShared {
    endpoint: Endpoint,
    world_size: usize,
    joined: Mutex<Vec<bool>>,
    exchange: Exchange,
}

static REGISTRY: LazyLock<Mutex<HashMap<Endpoint, Weak<GroupShared>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

thread_local! {
    static CURRENT: RefCell<Option<ProcessGroup>> = const { RefCell::new(None) };
}

// ── Rendezvous ownership ────────────────────────────────────────────────

/// Owner of a bound rendezvous. The endpoint stays reserved while this handle
/// or any joined rank is alive.
pub struct GroupHandle {
    shared: Arc<GroupShared>,
}

/// Reserve `endpoint` for a group of `world_size` ranks.
pub fn bind(endpoint: &Endpoint, world_size: usize) -> Result<GroupHandle> {
    if world_size == 0 {
        return Err(DistError::InvalidWorldSize(world_size));
    }
    let mut registry = REGISTRY.lock();
    if registry
        .get(endpoint)
        .is_some_and(|existing| existing.strong_count() > 0)
    {
        warn!(%endpoint, "rendezvous endpoint already in use");
        return Err(DistError::AddressInUse(endpoint.clone()));
    }
    let shared = Arc::new(GroupShared {
        endpoint: endpoint.clone(),
        world_size,
        joined: Mutex::new(vec![false; world_size]),
        exchange: Exchange::new(world_size),
    });
    registry.insert(endpoint.clone(), Arc::downgrade(&shared));
    info!(%endpoint, world_size, "rendezvous bound");
    Ok(GroupHandle { shared })
}

impl GroupHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    /// Number of ranks currently joined.
    pub fn joined(&self) -> usize {
        self.shared.joined.lock().iter().filter(|&&j| j).count()
    }

    /// Fail every rank blocked in (or entering) a collective.
    pub fn abort(&self) {
        self.shared.exchange.abort();
    }

    /// Clear an abort and any half-finished collective. Only call this when
    /// no rank is inside a collective.
    pub fn recover(&self) {
        if self.shared.exchange.is_aborted() {
            debug!(endpoint = %self.shared.endpoint, "recovering aborted rendezvous");
        }
        self.shared.exchange.reset();
    }
}

impl Drop for GroupHandle {
    fn drop(&mut self) {
        let mut registry = REGISTRY.lock();
        let owned = registry
            .get(&self.shared.endpoint)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(&self.shared)));
        // Workers may still hold the group; only release the endpoint once they are gone.
        if owned && Arc::strong_count(&self.shared) == 1 {
            registry.remove(&self.shared.endpoint);
        }
    }
}

// ── Per-thread group ────────────────────────────────────────────────────

/// A rank's view of a joined group.
#[derive(Clone)]
pub struct ProcessGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.shared.world_size)
            .field("endpoint", &self.shared.endpoint)
            .finish()
    }
}

impl ProcessGroup {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    /// Gather `tensor` from every rank, returned in rank order.
    pub fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        debug!(rank = self.rank, shape = %tensor.shape(), "all_gather");
        self.shared.exchange.exchange(self.rank, tensor.clone())
    }

    /// Block until every rank reaches the barrier.
    pub fn barrier(&self) -> Result<()> {
        let token = Tensor::empty(mtest_core::DType::Bool, &mtest_core::Device::Cpu);
        self.shared.exchange.exchange(self.rank, token).map(|_| ())
    }
}

/// Join the rendezvous described by `init` and make it this thread's group.
pub fn init_process_group(init: &DistInit) -> Result<ProcessGroup> {
    if is_initialized() {
        return Err(DistError::AlreadyInitialized);
    }
    let shared = REGISTRY
        .lock()
        .get(&init.endpoint)
        .and_then(Weak::upgrade)
        .ok_or_else(|| DistError::NoRendezvous(init.endpoint.clone()))?;
    if shared.world_size != init.world_size {
        return Err(DistError::WorldSizeMismatch {
            expected: shared.world_size,
            got: init.world_size,
        });
    }
    if init.rank >= shared.world_size {
        return Err(DistError::RankOutOfRange {
            rank: init.rank,
            world_size: shared.world_size,
        });
    }
    {
        let mut joined = shared.joined.lock();
        if joined[init.rank] {
            return Err(DistError::RankTaken(init.rank));
        }
        joined[init.rank] = true;
    }
    let group = ProcessGroup {
        rank: init.rank,
        shared,
    };
    CURRENT.with(|c| *c.borrow_mut() = Some(group.clone()));
    debug!(rank = init.rank, world_size = init.world_size, endpoint = %init.endpoint, "joined process group");
    Ok(group)
}

/// The group this thread joined, if any.
pub fn current_group() -> Option<ProcessGroup> {
    CURRENT.with(|c| c.borrow().clone())
}

pub fn is_initialized() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Leave the current group. Leaving when not joined is an error.
pub fn destroy_process_group() -> Result<()> {
    let group = CURRENT
        .with(|c| c.borrow_mut().take())
        .ok_or(DistError::NotInitialized)?;
    group.shared.joined.lock()[group.rank] = false;
    Ok(())
}

/// Abort the current group's collectives, if this thread joined one.
pub fn abort_current() {
    if let Some(group) = current_group() {
        warn!(rank = group.rank, "aborting collectives");
        group.shared.exchange.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("unit-test", port)
    }

    #[test]
    fn test_bind_is_exclusive() {
        let ep = endpoint(1);
        let handle = bind(&ep, 2).unwrap();
        assert_eq!(bind(&ep, 2).err(), Some(DistError::AddressInUse(ep.clone())));
        drop(handle);
        assert!(bind(&ep, 2).is_ok());
    }

    #[test]
    fn test_zero_world_rejected() {
        assert_eq!(
            bind(&endpoint(2), 0).err(),
            Some(DistError::InvalidWorldSize(0))
        );
    }

    #[test]
    fn test_single_rank_gather() {
        let ep = endpoint(3);
        let _handle = bind(&ep, 1).unwrap();
        let group = init_process_group(&DistInit {
            rank: 0,
            world_size: 1,
            endpoint: ep,
        })
        .unwrap();
        let t = Tensor::scalar(4.0, mtest_core::DType::F32, &mtest_core::Device::Cpu);
        let out = group.all_gather(&t).unwrap();
        assert_eq!(out, vec![t]);
        assert!(is_initialized());
        destroy_process_group().unwrap();
        assert!(!is_initialized());
        assert_eq!(destroy_process_group(), Err(DistError::NotInitialized));
    }

    #[test]
    fn test_join_validation() {
        let ep = endpoint(4);
        let _handle = bind(&ep, 2).unwrap();
        let init = |rank, world_size| DistInit {
            rank,
            world_size,
            endpoint: ep.clone(),
        };
        assert!(matches!(
            init_process_group(&init(0, 3)),
            Err(DistError::WorldSizeMismatch { expected: 2, got: 3 })
        ));
        assert!(matches!(
            init_process_group(&init(2, 2)),
            Err(DistError::RankOutOfRange { .. })
        ));
        assert!(matches!(
            init_process_group(&DistInit {
                rank: 0,
                world_size: 2,
                endpoint: endpoint(99),
            }),
            Err(DistError::NoRendezvous(_))
        ));
    }
}
