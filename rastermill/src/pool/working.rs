//! The Working Room: job execution and cancellation.
//!
//! Executes promoted job payloads on blocking workers while their token is
//! held. Cancellation is cooperative: `Cancel` trips the job's
//! cancellation token and records the identity, and if the payload runs to
//! completion anyway the late result is detected by job identity and
//! discarded while the token is still reclaimed. A panicking payload is
//! caught via the blocking-task join error and reported to the owning
//! actor as a job failure.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::job::{CompleteFn, JobError, JobId, JobResult, WorkingJob};
use super::{PoolAddress, PoolId, PoolToken, RoomKind};

/// Messages accepted by the Working Room.
pub enum WorkingRoomMsg {
    /// Begin executing a job; the token is held until the job finishes.
    Launch(WorkingJob, PoolToken),
    /// Request cooperative termination of a running job. Idempotent; a
    /// no-op for unknown or already-finished jobs.
    Cancel(JobId),
}

impl std::fmt::Debug for WorkingRoomMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch(job, _) => f.debug_tuple("Launch").field(&job.id).finish(),
            Self::Cancel(id) => f.debug_tuple("Cancel").field(id).finish(),
        }
    }
}

/// Internal completion record sent back from the worker task.
struct Finished {
    id: JobId,
    complete: CompleteFn,
    result: JobResult,
    token: PoolToken,
}

/// The Working Room service of one pool.
pub struct WorkingRoom {
    id: PoolId,
    rx: mpsc::UnboundedReceiver<WorkingRoomMsg>,
    done_tx: mpsc::UnboundedSender<Finished>,
    done_rx: mpsc::UnboundedReceiver<Finished>,
    /// Cancellation token per running job.
    running: HashMap<JobId, CancellationToken>,
    /// Identities whose results must be discarded when they surface.
    cancelled: HashSet<JobId>,
}

impl WorkingRoom {
    pub(super) fn new(id: PoolId, rx: mpsc::UnboundedReceiver<WorkingRoomMsg>) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            id,
            rx,
            done_tx,
            done_rx,
            running: HashMap::new(),
            cancelled: HashSet::new(),
        }
    }

    fn address(&self) -> PoolAddress {
        PoolAddress {
            pool: self.id,
            room: RoomKind::Working,
        }
    }

    /// Runs the execution loop until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(room = %self.address(), "Working room starting");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },

                finished = self.done_rx.recv() => {
                    // The sender half lives in `self`, so recv never yields None here.
                    if let Some(finished) = finished {
                        self.finish(finished);
                    }
                }
            }
        }
        debug!(room = %self.address(), "Working room stopped");
    }

    fn handle(&mut self, msg: WorkingRoomMsg) {
        match msg {
            WorkingRoomMsg::Launch(job, token) => self.launch(job, token),
            WorkingRoomMsg::Cancel(id) => self.cancel(id),
        }
    }

    fn launch(&mut self, job: WorkingJob, token: PoolToken) {
        let WorkingJob { id, run, complete } = job;
        trace!(room = %self.address(), job = %id, "Launching job");

        let cancel = CancellationToken::new();
        self.running.insert(id, cancel.clone());

        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || run(&cancel)).await;
            let result = match joined {
                Ok(result) => result,
                Err(err) => Err(JobError::WorkerCrashed(err.to_string())),
            };
            let _ = done_tx.send(Finished {
                id,
                complete,
                result,
                token,
            });
        });
    }

    fn cancel(&mut self, id: JobId) {
        if let Some(cancel) = self.running.get(&id) {
            debug!(room = %self.address(), job = %id, "Cancelling running job");
            cancel.cancel();
            self.cancelled.insert(id);
        } else {
            trace!(room = %self.address(), job = %id, "Cancel no-op");
        }
    }

    fn finish(&mut self, finished: Finished) {
        let Finished {
            id,
            complete,
            result,
            token,
        } = finished;

        self.running.remove(&id);
        if self.cancelled.remove(&id) {
            debug!(room = %self.address(), job = %id, "Discarding late result of cancelled job");
        } else {
            if let Err(err) = &result {
                warn!(room = %self.address(), job = %id, error = %err, "Job failed");
            }
            complete(id, result);
        }
        // Token returns to the pool after bookkeeping, even for cancelled
        // or crashed jobs.
        drop(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{ActorAddress, RasterId, Role};
    use crate::footprint::Footprint;
    use crate::query::QueryId;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn job_id(query: u64) -> JobId {
        JobId {
            actor: ActorAddress::new(RasterId(0), Role::Computer),
            query: QueryId(query),
            fp: Footprint::new(0.0, 4.0, 1.0, 2, 2),
        }
    }

    async fn token() -> PoolToken {
        let sem = Arc::new(Semaphore::new(1));
        PoolToken::new(sem.acquire_owned().await.unwrap())
    }

    fn start_room() -> (mpsc::UnboundedSender<WorkingRoomMsg>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let room = WorkingRoom::new(PoolId(42), rx);
        tokio::spawn(room.run(shutdown.clone()));
        (tx, shutdown)
    }

    #[tokio::test]
    async fn test_runs_payload_and_completes() {
        let (tx, shutdown) = start_room();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let job = WorkingJob {
            id: job_id(1),
            run: Box::new(|_cancel| Ok(None)),
            complete: Box::new(move |id, result| {
                let _ = done_tx.send((id, result.is_ok()));
            }),
        };
        tx.send(WorkingRoomMsg::Launch(job, token().await)).unwrap();

        let (id, ok) = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, job_id(1));
        assert!(ok);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_crash_reported_as_failure() {
        let (tx, shutdown) = start_room();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let job = WorkingJob {
            id: job_id(2),
            run: Box::new(|_cancel| panic!("worker exploded")),
            complete: Box::new(move |_id, result| {
                let _ = done_tx.send(result);
            }),
        };
        tx.send(WorkingRoomMsg::Launch(job, token().await)).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(JobError::WorkerCrashed(_))));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_job_result_discarded() {
        let (tx, shutdown) = start_room();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<JobId>();
        // Keep the channel open even after the room drops the discarded
        // job's completion callback (and with it its `done_tx` clone), so
        // the silence assertion observes a timeout, not channel closure.
        let _done_tx = done_tx.clone();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let job = WorkingJob {
            id: job_id(3),
            run: Box::new(move |_cancel| {
                // Uninterruptible payload: ignores its token and blocks
                // until released.
                release_rx.recv().ok();
                Ok(None)
            }),
            complete: Box::new(move |id, _result| {
                let _ = done_tx.send(id);
            }),
        };
        tx.send(WorkingRoomMsg::Launch(job, token().await)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.send(WorkingRoomMsg::Cancel(job_id(3))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(()).unwrap();

        // The late result must be suppressed: no completion callback.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), done_rx.recv())
                .await
                .is_err()
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cooperative_cancellation_observed() {
        let (tx, shutdown) = start_room();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<bool>();

        let job = WorkingJob {
            id: job_id(4),
            run: Box::new(move |cancel| {
                let deadline = std::time::Instant::now() + Duration::from_secs(2);
                while !cancel.is_cancelled() && std::time::Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                let _ = done_tx.send(cancel.is_cancelled());
                Ok(None)
            }),
            complete: Box::new(|_id, _result| {}),
        };
        tx.send(WorkingRoomMsg::Launch(job, token().await)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.send(WorkingRoomMsg::Cancel(job_id(4))).unwrap();

        let observed = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(observed, "payload should observe cooperative cancellation");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_noop() {
        let (tx, shutdown) = start_room();
        tx.send(WorkingRoomMsg::Cancel(job_id(9))).unwrap();
        tx.send(WorkingRoomMsg::Cancel(job_id(9))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
    }
}
