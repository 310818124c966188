//! Rendezvous port allocation.

use mtest_dist::{DistError, Endpoint, GroupHandle};
use tracing::{info, warn};

use crate::{HarnessError, Result};

/// Cycles through `[start, max]`, wrapping back to `start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortAllocator {
    current: u16,
    start: u16,
    max: u16,
}

impl PortAllocator {
    pub fn new(start: u16, max: u16) -> Result<Self> {
        if start > max {
            return Err(HarnessError::Config(format!(
                "start port {start} exceeds max port {max}"
            )));
        }
        Ok(Self {
            current: start,
            start,
            max,
        })
    }

    /// The next port in the cycle.
    pub fn next_port(&mut self) -> u16 {
        let port = self.current;
        self.current = if port >= self.max { self.start } else { port + 1 };
        port
    }

    /// Number of distinct ports in the cycle.
    pub fn span(&self) -> usize {
        usize::from(self.max - self.start) + 1
    }

    /// Bind a rendezvous for `world_size` ranks on the first free port,
    /// trying each port at most once.
    pub fn bind(&mut self, addr: &str, world_size: usize) -> Result<GroupHandle> {
        for _ in 0..self.span() {
            let endpoint = Endpoint::new(addr, self.next_port());
            match mtest_dist::bind(&endpoint, world_size) {
                Ok(handle) => {
                    info!(%endpoint, world_size, "allocated rendezvous port");
                    return Ok(handle);
                }
                Err(DistError::AddressInUse(_)) => {
                    warn!(%endpoint, "port in use, trying the next one");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(HarnessError::NoFreePort {
            start: self.start,
            max: self.max,
        })
    }
}
