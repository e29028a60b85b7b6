//! The Waiting Room: priority-ordered job admission.
//!
//! Holds every job submitted to the pool that has not yet been granted a
//! concurrency token. When a token frees up and the queue is non-empty,
//! the front job is popped and its grant callback invoked with the token;
//! the callback posts a promotion message to the owning actor, which then
//! launches the job in the Working Room.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::job::{JobId, WaitingJob};
use super::queue::JobQueue;
use super::{PoolAddress, PoolId, PoolToken, RoomKind};

/// Messages accepted by the Waiting Room.
#[derive(Debug)]
pub enum WaitingRoomMsg {
    /// Enqueue a job.
    Schedule(WaitingJob),
    /// Remove a job still waiting. Idempotent no-op when the job was
    /// already promoted or never scheduled.
    Unschedule(JobId),
}

/// The Waiting Room service of one pool.
pub struct WaitingRoom {
    id: PoolId,
    rx: mpsc::UnboundedReceiver<WaitingRoomMsg>,
    semaphore: Arc<Semaphore>,
    queue: JobQueue,
}

impl WaitingRoom {
    pub(super) fn new(
        id: PoolId,
        rx: mpsc::UnboundedReceiver<WaitingRoomMsg>,
        semaphore: Arc<Semaphore>,
    ) -> Self {
        Self {
            id,
            rx,
            semaphore,
            queue: JobQueue::new(),
        }
    }

    fn address(&self) -> PoolAddress {
        PoolAddress {
            pool: self.id,
            room: RoomKind::Waiting,
        }
    }

    /// Runs the admission loop until shutdown.
    ///
    /// Token grants only race with the mailbox while jobs are actually
    /// waiting; an empty queue parks on the mailbox alone so no token is
    /// held back from other submitters.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(room = %self.address(), "Waiting room starting");
        loop {
            if self.queue.is_empty() {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    msg = self.rx.recv() => match msg {
                        Some(msg) => self.handle(msg),
                        None => break,
                    },
                }
            } else {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    msg = self.rx.recv() => match msg {
                        Some(msg) => self.handle(msg),
                        None => break,
                    },

                    permit = Arc::clone(&self.semaphore).acquire_owned() => {
                        let permit = permit.expect("pool semaphore closed");
                        let job = self
                            .queue
                            .pop()
                            .expect("token granted with an empty waiting queue");
                        trace!(room = %self.address(), job = %job.id, "Granting token");
                        (job.grant)(PoolToken::new(permit));
                    }
                }
            }
        }
        debug!(room = %self.address(), "Waiting room stopped");
    }

    fn handle(&mut self, msg: WaitingRoomMsg) {
        match msg {
            WaitingRoomMsg::Schedule(job) => {
                trace!(room = %self.address(), job = %job.id, priority = %job.priority, "Scheduling job");
                self.queue.push(job);
            }
            WaitingRoomMsg::Unschedule(id) => {
                if self.queue.remove(&id).is_some() {
                    debug!(room = %self.address(), job = %id, "Unscheduled waiting job");
                } else {
                    // Already promoted; the Working Room owns it now.
                    trace!(room = %self.address(), job = %id, "Unschedule no-op");
                }
            }
        }
    }
}
