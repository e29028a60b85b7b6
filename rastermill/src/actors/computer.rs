//! The Computer actor: on-demand computation of missing cache tiles.
//!
//! Queries depending on a cache footprint that is not yet stored ask the
//! Computer for it. Requests are deduplicated per footprint: the first one
//! schedules a compute job on the pool, later ones attach to the job in
//! flight, and every attached query receives the same computed array when
//! the job lands. The array is also forwarded to the Writer so the next
//! miss becomes a hit.
//!
//! A failed computation is attributed to every production tile depending
//! on the footprint, per attached query, and surfaces at the Producer as
//! failed tiles rather than aborting anything.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::producer::ProducerMsg;
use super::writer::WriterMsg;
use super::{ActorAddress, RasterId, Role};
use crate::cache::CacheStore;
use crate::footprint::Footprint;
use crate::pool::{JobError, JobId, JobResult, PoolHandle, PoolToken, Priority, WaitingJob, WorkingJob};
use crate::query::{QueryId, QueryInfo};
use crate::source::ComputeArray;
use crate::tile::TileBuffer;

/// Why a requested cache tile could not be produced.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ComputeFailed {
    pub message: String,
}

/// Outcome delivered to each query waiting on a cache tile.
///
/// The sender is dropped without a value when the waiting query is
/// cancelled; requesters treat a closed channel as cancellation.
pub type ComputedTile = Result<Arc<TileBuffer>, ComputeFailed>;

/// Messages accepted by the Computer.
pub enum ComputerMsg {
    /// Ensure the tile for `cache_fp` exists, computing it if missing.
    ComputeThisArray {
        qi: Arc<QueryInfo>,
        cache_fp: Footprint,
        reply: oneshot::Sender<ComputedTile>,
    },
    /// The Waiting Room granted a concurrency token for a compute job.
    TokenGranted { id: JobId, token: PoolToken },
    /// The Working Room finished a compute job.
    JobDone { id: JobId, result: JobResult },
    /// Detach a query from every pending computation.
    CancelThisQuery(QueryId),
    /// Stop, cancelling every computation in flight.
    Die,
}

impl std::fmt::Debug for ComputerMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ComputeThisArray { qi, cache_fp, .. } => f
                .debug_struct("ComputeThisArray")
                .field("query", &qi.id())
                .field("cache_fp", cache_fp)
                .finish(),
            Self::TokenGranted { id, .. } => f.debug_struct("TokenGranted").field("id", id).finish(),
            Self::JobDone { id, .. } => f.debug_struct("JobDone").field("id", id).finish(),
            Self::CancelThisQuery(q) => f.debug_tuple("CancelThisQuery").field(q).finish(),
            Self::Die => write!(f, "Die"),
        }
    }
}

/// One query attached to a computation in flight.
struct Waiter {
    qi: Arc<QueryInfo>,
    reply: oneshot::Sender<ComputedTile>,
}

enum Phase {
    Waiting,
    Working,
}

/// A computation in flight for one cache footprint.
struct ComputeState {
    id: JobId,
    phase: Phase,
    waiters: Vec<Waiter>,
}

/// The Computer actor of one raster's actor group.
pub struct ActorComputer {
    address: ActorAddress,
    rx: mpsc::UnboundedReceiver<ComputerMsg>,
    /// Sender half of our own mailbox, captured by pool callbacks.
    self_tx: mpsc::UnboundedSender<ComputerMsg>,
    pool: PoolHandle,
    store: Arc<dyn CacheStore>,
    compute: Arc<dyn ComputeArray>,
    writer_tx: mpsc::UnboundedSender<WriterMsg>,
    producer_tx: mpsc::UnboundedSender<ProducerMsg>,
    computing: HashMap<Footprint, ComputeState>,
}

impl ActorComputer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raster: RasterId,
        rx: mpsc::UnboundedReceiver<ComputerMsg>,
        self_tx: mpsc::UnboundedSender<ComputerMsg>,
        pool: PoolHandle,
        store: Arc<dyn CacheStore>,
        compute: Arc<dyn ComputeArray>,
        writer_tx: mpsc::UnboundedSender<WriterMsg>,
        producer_tx: mpsc::UnboundedSender<ProducerMsg>,
    ) -> Self {
        Self {
            address: ActorAddress::new(raster, Role::Computer),
            rx,
            self_tx,
            pool,
            store,
            compute,
            writer_tx,
            producer_tx,
            computing: HashMap::new(),
        }
    }

    /// Runs the message loop until `Die`, mailbox closure or shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(actor = %self.address, pool = %self.pool.id(), "Computer starting");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                msg = self.rx.recv() => match msg {
                    Some(ComputerMsg::Die) | None => {
                        self.die();
                        break;
                    }
                    Some(msg) => self.handle(msg).await,
                },
            }
        }
        debug!(actor = %self.address, "Computer stopped");
    }

    async fn handle(&mut self, msg: ComputerMsg) {
        match msg {
            ComputerMsg::ComputeThisArray {
                qi,
                cache_fp,
                reply,
            } => self.compute_this_array(qi, cache_fp, reply).await,
            ComputerMsg::TokenGranted { id, token } => self.token_granted(id, token),
            ComputerMsg::JobDone { id, result } => self.job_done(id, result),
            ComputerMsg::CancelThisQuery(query) => self.cancel(query),
            ComputerMsg::Die => unreachable!("handled in run loop"),
        }
    }

    async fn compute_this_array(
        &mut self,
        qi: Arc<QueryInfo>,
        cache_fp: Footprint,
        reply: oneshot::Sender<ComputedTile>,
    ) {
        // Cache short-circuit: a stored tile answers immediately.
        match self.store.lookup(&cache_fp).await {
            Ok(Some(hit)) => {
                trace!(actor = %self.address, fp = %cache_fp, "Cache hit");
                let _ = reply.send(Ok(hit));
                return;
            }
            Ok(None) => {}
            Err(err) => {
                // A broken lookup is treated as a miss; recomputing is the
                // recovery path either way.
                warn!(actor = %self.address, fp = %cache_fp, error = %err, "Cache lookup failed");
            }
        }

        if let Some(state) = self.computing.get_mut(&cache_fp) {
            trace!(actor = %self.address, fp = %cache_fp, "Attaching to computation in flight");
            state.waiters.push(Waiter { qi, reply });
            return;
        }

        let id = JobId {
            actor: self.address,
            query: qi.id(),
            fp: cache_fp,
        };
        debug!(actor = %self.address, fp = %cache_fp, job = %id, "Scheduling computation");
        self.computing.insert(
            cache_fp,
            ComputeState {
                id,
                phase: Phase::Waiting,
                waiters: vec![Waiter { qi, reply }],
            },
        );
        let self_tx = self.self_tx.clone();
        self.pool.schedule_job(WaitingJob {
            id,
            priority: Priority::COMPUTE,
            grant: Box::new(move |token| {
                let _ = self_tx.send(ComputerMsg::TokenGranted { id, token });
            }),
        });
    }

    fn token_granted(&mut self, id: JobId, token: PoolToken) {
        let Some(state) = self.computing.get_mut(&id.fp) else {
            // Every waiter detached before the grant arrived.
            trace!(actor = %self.address, job = %id, "Token for abandoned computation returned");
            return;
        };
        if state.id != id {
            trace!(actor = %self.address, job = %id, "Token for superseded job returned");
            return;
        }
        state.phase = Phase::Working;

        let channels = state
            .waiters
            .first()
            .map(|w| w.qi.channel_count())
            .unwrap_or(1);
        let compute = Arc::clone(&self.compute);
        let fp = id.fp;
        let self_tx = self.self_tx.clone();
        self.pool.launch_job_with_token(
            WorkingJob {
                id,
                run: Box::new(move |cancel| {
                    compute
                        .compute(&fp, channels, cancel)
                        .map(Some)
                        .map_err(|e| JobError::Failed(e.to_string()))
                }),
                complete: Box::new(move |id, result| {
                    let _ = self_tx.send(ComputerMsg::JobDone { id, result });
                }),
            },
            token,
        );
    }

    fn job_done(&mut self, id: JobId, result: JobResult) {
        let Some(state) = self.computing.get(&id.fp) else {
            trace!(actor = %self.address, job = %id, "Stale completion discarded");
            return;
        };
        if state.id != id {
            trace!(actor = %self.address, job = %id, "Completion of superseded job discarded");
            return;
        }
        let state = self.computing.remove(&id.fp).expect("compute state vanished");

        match result {
            Ok(Some(tile)) => {
                debug!(actor = %self.address, fp = %id.fp, "Computation complete");
                let tile = Arc::new(tile);
                let _ = self.writer_tx.send(WriterMsg::WriteThisArray {
                    cache_fp: id.fp,
                    array: Arc::clone(&tile),
                });
                for waiter in state.waiters {
                    let _ = waiter.reply.send(Ok(Arc::clone(&tile)));
                }
            }
            Ok(None) => panic!("compute job for {} returned no array", id.fp),
            Err(err) => {
                let message = err.to_string();
                for waiter in state.waiters {
                    for &prod_idx in waiter.qi.prod_idxs_of_cache_fp(&id.fp) {
                        let _ = self.producer_tx.send(ProducerMsg::ProductionFailed {
                            query: waiter.qi.id(),
                            prod_idx,
                            message: message.clone(),
                        });
                    }
                    let _ = waiter.reply.send(Err(ComputeFailed {
                        message: message.clone(),
                    }));
                }
            }
        }
    }

    fn cancel(&mut self, query: QueryId) {
        let mut abandoned = Vec::new();
        for (fp, state) in self.computing.iter_mut() {
            state.waiters.retain(|w| w.qi.id() != query);
            if state.waiters.is_empty() {
                abandoned.push(*fp);
            }
        }
        for fp in abandoned {
            let state = self.computing.remove(&fp).expect("compute state vanished");
            debug!(actor = %self.address, fp = %fp, "Abandoning computation with no waiters");
            match state.phase {
                Phase::Waiting => self.pool.unschedule_job(state.id),
                Phase::Working => self.pool.cancel_job(state.id),
            }
        }
    }

    fn die(&mut self) {
        for (_, state) in self.computing.drain() {
            match state.phase {
                Phase::Waiting => self.pool.unschedule_job(state.id),
                Phase::Working => self.pool.cancel_job(state.id),
            }
        }
    }
}
