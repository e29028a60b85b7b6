//! Bounded-concurrency worker pools.
//!
//! A pool is split into two cooperating services addressed as
//! `/Pool<id>/WaitingRoom` and `/Pool<id>/WorkingRoom`:
//!
//! - the [`WaitingRoom`] holds not-yet-scheduled jobs ordered by priority
//!   and hands out concurrency tokens as they free up;
//! - the [`WorkingRoom`] executes a job's payload on a blocking worker
//!   once it holds a token, and routes the result (or a crash, or a
//!   late-result discard after cancellation) back to the owning actor.
//!
//! The `in_place_capable` flag is read once at construction: pools sharing
//! the actors' address space let payloads write straight into the
//! destination production array; marshalling pools return results by value
//! and the owning actor copies them in its own message loop.

pub mod job;
pub mod queue;
pub mod resource;
mod waiting;
mod working;

pub use job::{CompleteFn, GrantFn, JobError, JobId, JobResult, RunFn, WaitingJob, WorkingJob};
pub use queue::{JobQueue, Priority};
pub use resource::{ActivationPool, ResourceId, ResourceLifecycle};
pub use waiting::{WaitingRoom, WaitingRoomMsg};
pub use working::{WorkingRoom, WorkingRoomMsg};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default number of concurrency tokens per pool.
pub const DEFAULT_POOL_WORKERS: usize = 4;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of one pool instance, used in room addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pool{}", self.0)
    }
}

/// The two rooms of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    Waiting,
    Working,
}

/// Address of one room of one pool, rendered `/Pool<id>/<Room>Room`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolAddress {
    pub pool: PoolId,
    pub room: RoomKind,
}

impl std::fmt::Display for PoolAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let room = match self.room {
            RoomKind::Waiting => "WaitingRoom",
            RoomKind::Working => "WorkingRoom",
        };
        write!(f, "/{}/{}", self.pool, room)
    }
}

/// A concurrency token.
///
/// Held by a job from promotion until completion; dropping it returns the
/// token to the pool.
pub struct PoolToken {
    _permit: OwnedSemaphorePermit,
}

impl PoolToken {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: permit }
    }
}

impl std::fmt::Debug for PoolToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolToken").finish()
    }
}

/// Pool configuration, read once at construction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrency tokens (jobs executing at once).
    pub workers: usize,
    /// Whether payloads may write results in place into shared buffers.
    pub in_place_capable: bool,
    /// Human-readable label for logging.
    pub label: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_POOL_WORKERS,
            in_place_capable: true,
            label: "pool".to_string(),
        }
    }
}

/// Cloneable handle to a running pool's two rooms.
#[derive(Clone)]
pub struct PoolHandle {
    id: PoolId,
    waiting_tx: mpsc::UnboundedSender<WaitingRoomMsg>,
    working_tx: mpsc::UnboundedSender<WorkingRoomMsg>,
    in_place_capable: bool,
}

impl PoolHandle {
    /// The pool's identity.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// The Waiting Room's address.
    pub fn waiting_address(&self) -> PoolAddress {
        PoolAddress {
            pool: self.id,
            room: RoomKind::Waiting,
        }
    }

    /// The Working Room's address.
    pub fn working_address(&self) -> PoolAddress {
        PoolAddress {
            pool: self.id,
            room: RoomKind::Working,
        }
    }

    /// Whether payloads on this pool may write results in place.
    pub fn in_place_capable(&self) -> bool {
        self.in_place_capable
    }

    /// Submits a job to the Waiting Room.
    pub fn schedule_job(&self, job: WaitingJob) {
        let _ = self.waiting_tx.send(WaitingRoomMsg::Schedule(job));
    }

    /// Removes a job still waiting; a no-op when already promoted.
    pub fn unschedule_job(&self, id: JobId) {
        let _ = self.waiting_tx.send(WaitingRoomMsg::Unschedule(id));
    }

    /// Begins executing a promoted job with its token.
    pub fn launch_job_with_token(&self, job: WorkingJob, token: PoolToken) {
        let _ = self.working_tx.send(WorkingRoomMsg::Launch(job, token));
    }

    /// Requests cooperative termination of a running job.
    ///
    /// Never blocks: if the payload cannot be interrupted the pool still
    /// reclaims the token when it eventually finishes and discards the
    /// late result.
    pub fn cancel_job(&self, id: JobId) {
        let _ = self.working_tx.send(WorkingRoomMsg::Cancel(id));
    }
}

/// Starts a worker pool: spawns its two room tasks and returns the handle.
pub fn start_pool(config: PoolConfig, shutdown: CancellationToken) -> PoolHandle {
    let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));

    let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
    let (working_tx, working_rx) = mpsc::unbounded_channel();

    info!(
        pool = %id,
        workers = config.workers,
        in_place = config.in_place_capable,
        label = %config.label,
        "Starting worker pool"
    );

    let waiting = WaitingRoom::new(id, waiting_rx, Arc::clone(&semaphore));
    tokio::spawn(waiting.run(shutdown.clone()));

    let working = WorkingRoom::new(id, working_rx);
    tokio::spawn(working.run(shutdown));

    PoolHandle {
        id,
        waiting_tx,
        working_tx,
        in_place_capable: config.in_place_capable,
    }
}
