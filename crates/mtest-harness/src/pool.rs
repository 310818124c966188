//! Fixed pool of rank-bound worker threads.
//!
//! Each worker owns one rank for its whole life. Work reaches it as a boxed
//! [`WorkerTask`] over the worker's own channel; the caller blocks until every
//! rank has replied. A failing rank aborts the group's collectives so peers
//! blocked in a gather return instead of hanging.

use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use mtest_dist::{DistInit, Endpoint};
use tracing::{debug, info, warn};

use crate::{HarnessError, Result};

/// What a task knows about the rank running it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerContext {
    pub rank: usize,
    pub world_size: usize,
}

/// One rank's share of a fan-out.
pub trait WorkerTask: Send {
    fn run(self: Box<Self>, ctx: &WorkerContext) -> Result<()>;
}

type Reply = Sender<(usize, Result<()>)>;

enum Message {
    Init(DistInit, Reply),
    Run(Box<dyn WorkerTask>, Reply),
    Shutdown,
}

pub struct WorkerPool {
    world_size: usize,
    senders: Vec<Sender<Message>>,
    handles: Vec<JoinHandle<()>>,
    closed: bool,
}

impl WorkerPool {
    /// Start `world_size` workers, ranks `0..world_size`.
    pub fn spawn(world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(HarnessError::Config("worker pool needs at least one rank".into()));
        }
        let mut pool = WorkerPool {
            world_size,
            senders: Vec::with_capacity(world_size),
            handles: Vec::with_capacity(world_size),
            closed: false,
        };
        for rank in 0..world_size {
            let (tx, rx) = unbounded();
            let handle = std::thread::Builder::new()
                .name(format!("mtest-worker-{rank}"))
                .spawn(move || worker_loop(rank, world_size, rx))?;
            pool.senders.push(tx);
            pool.handles.push(handle);
        }
        info!(world_size, "worker pool started");
        Ok(pool)
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Join every worker to the rendezvous at `endpoint`.
    pub fn init(&self, endpoint: &Endpoint) -> Result<()> {
        self.dispatch(|rank, reply| {
            Message::Init(
                DistInit {
                    rank,
                    world_size: self.world_size,
                    endpoint: endpoint.clone(),
                },
                reply,
            )
        })
    }

    /// Run `make(rank)` on every rank and wait for all of them.
    ///
    /// Fails with the first error in rank order that is not merely a peer's
    /// abort.
    pub fn fan_out<F>(&self, mut make: F) -> Result<()>
    where
        F: FnMut(usize) -> Box<dyn WorkerTask>,
    {
        self.dispatch(|rank, reply| Message::Run(make(rank), reply))
    }

    fn dispatch(&self, mut message: impl FnMut(usize, Reply) -> Message) -> Result<()> {
        if self.closed {
            return Err(HarnessError::PoolClosed);
        }
        let (reply_tx, reply_rx) = bounded(self.world_size);
        let mut results: Vec<Option<Result<()>>> = (0..self.world_size).map(|_| None).collect();
        let mut sent = 0;
        for (rank, sender) in self.senders.iter().enumerate() {
            if sender.send(message(rank, reply_tx.clone())).is_err() {
                results[rank] = Some(Err(HarnessError::WorkerPanicked {
                    rank,
                    message: "worker is gone".into(),
                }));
            } else {
                sent += 1;
            }
        }
        drop(reply_tx);
        for _ in 0..sent {
            // Disconnect means a worker died without replying.
            let Ok((rank, result)) = reply_rx.recv() else {
                break;
            };
            results[rank] = Some(result);
        }
        let outcomes: Vec<Result<()>> = results
            .into_iter()
            .enumerate()
            .map(|(rank, r)| {
                r.unwrap_or_else(|| {
                    Err(HarnessError::WorkerPanicked {
                        rank,
                        message: "worker exited without replying".into(),
                    })
                })
            })
            .collect();
        first_failure(outcomes)
    }

    /// Stop accepting work and tell every worker to exit.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for sender in &self.senders {
            let _ = sender.send(Message::Shutdown);
        }
        debug!(world_size = self.world_size, "worker pool closed");
    }

    /// Wait for every worker to exit. Closes the pool first if needed.
    pub fn join(&mut self) {
        self.close();
        if self.handles.is_empty() {
            return;
        }
        for (rank, handle) in self.handles.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(rank, "worker thread panicked outside a task");
            }
        }
        info!(world_size = self.world_size, "worker pool joined");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

fn first_failure(outcomes: Vec<Result<()>>) -> Result<()> {
    let errors: Vec<(usize, HarnessError)> = outcomes
        .into_iter()
        .enumerate()
        .filter_map(|(rank, r)| r.err().map(|e| (rank, e)))
        .collect();
    let pick = errors
        .iter()
        .position(|(_, e)| !e.is_aborted())
        .unwrap_or(0);
    match errors.into_iter().nth(pick) {
        None => Ok(()),
        Some((_, e @ HarnessError::WorkerPanicked { .. })) => Err(e),
        Some((rank, e)) => Err(HarnessError::Worker {
            rank,
            source: Box::new(e),
        }),
    }
}

fn worker_loop(rank: usize, world_size: usize, rx: Receiver<Message>) {
    let ctx = WorkerContext { rank, world_size };
    for message in rx.iter() {
        match message {
            Message::Init(init, reply) => {
                let result = mtest_dist::init_process_group(&init)
                    .map(|_| ())
                    .map_err(HarnessError::from);
                let _ = reply.send((rank, result));
            }
            Message::Run(task, reply) => {
                debug!(rank, "running task");
                let result = match panic::catch_unwind(AssertUnwindSafe(|| task.run(&ctx))) {
                    Ok(result) => result,
                    Err(payload) => Err(HarnessError::WorkerPanicked {
                        rank,
                        message: panic_message(payload.as_ref()),
                    }),
                };
                if let Err(e) = &result {
                    if !e.is_aborted() {
                        warn!(rank, error = %e, "task failed");
                    }
                    mtest_dist::abort_current();
                }
                let _ = reply.send((rank, result));
            }
            Message::Shutdown => break,
        }
    }
    if mtest_dist::is_initialized() {
        let _ = mtest_dist::destroy_process_group();
    }
    debug!(rank, "worker exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
