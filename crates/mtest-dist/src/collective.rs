//! Generation-based exchange backing `all_gather` and `barrier`.

use std::sync::Arc;

use mtest_core::Tensor;
use parking_lot::{Condvar, Mutex};

use crate::{DistError, Result};

/// Shared exchange state for one rendezvous.
///
/// A round fills one slot per rank. When the last rank arrives the slots are
/// published and the round starts draining; the next round cannot begin until
/// every rank has taken its copy.
pub(crate) struct Exchange {
    world_size: usize,
    state: Mutex<Round>,
    cv: Condvar,
}

struct Round {
    generation: u64,
    slots: Vec<Option<Tensor>>,
    arrived: usize,
    departed: usize,
    published: Option<Arc<Vec<Tensor>>>,
    aborted: bool,
}

impl Round {
    fn fresh(world_size: usize, generation: u64) -> Self {
        Self {
            generation,
            slots: vec![None; world_size],
            arrived: 0,
            departed: 0,
            published: None,
            aborted: false,
        }
    }
}

impl Exchange {
    pub(crate) fn new(world_size: usize) -> Self {
        Self {
            world_size,
            state: Mutex::new(Round::fresh(world_size, 0)),
            cv: Condvar::new(),
        }
    }

    /// Contribute `value` for `rank` and wait for every rank's contribution.
    pub(crate) fn exchange(&self, rank: usize, value: Tensor) -> Result<Vec<Tensor>> {
        let mut round = self.state.lock();

        // A previous round may still be handing out results.
        while round.published.is_some() && !round.aborted {
            self.cv.wait(&mut round);
        }
        if round.aborted {
            return Err(DistError::Aborted);
        }

        let generation = round.generation;
        round.slots[rank] = Some(value);
        round.arrived += 1;

        if round.arrived == self.world_size {
            let gathered = round.slots.iter_mut().filter_map(Option::take).collect();
            round.published = Some(Arc::new(gathered));
            self.cv.notify_all();
        } else {
            while (round.published.is_none() || round.generation != generation) && !round.aborted {
                self.cv.wait(&mut round);
            }
            if round.aborted {
                return Err(DistError::Aborted);
            }
        }

        let gathered = match &round.published {
            Some(values) => values.as_ref().clone(),
            None => return Err(DistError::Aborted),
        };
        round.departed += 1;
        if round.departed == self.world_size {
            *round = Round::fresh(self.world_size, generation + 1);
            self.cv.notify_all();
        }
        Ok(gathered)
    }

    /// Fail every pending and future exchange until [`Exchange::reset`].
    pub(crate) fn abort(&self) {
        let mut round = self.state.lock();
        round.aborted = true;
        self.cv.notify_all();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Discard any half-finished round and clear the abort flag.
    pub(crate) fn reset(&self) {
        let mut round = self.state.lock();
        let generation = round.generation + 1;
        *round = Round::fresh(self.world_size, generation);
        self.cv.notify_all();
    }
}
