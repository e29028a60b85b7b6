//! The Resampler actor: accumulates resampled contributions into
//! production arrays.
//!
//! A production array is allocated at most once, on the first contribution
//! that touches its tile, prefilled with the destination nodata so
//! uncovered regions need no further work. Each contribution with sample
//! data becomes a pool job: the actor schedules it in the Waiting Room,
//! receives the concurrency token back in its own mailbox and only then
//! launches the payload in the Working Room. On a pool that is
//! in-place-capable the payload writes straight into the shared array
//! slot; otherwise it returns the resampled region by value and the actor
//! copies it in during completion handling.
//!
//! Every production tile reaches a terminal state here exactly once:
//! made, when its last contribution lands; failed, when a job errors or
//! the tile is abandoned upstream before its contributions were
//! dispatched. Terminal tiles discard any stray late contribution, and
//! cancelled queries are tombstoned so contributions racing the cancel
//! cannot recreate their bookkeeping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::producer::ProducerMsg;
use super::{ActorAddress, RasterId, Role};
use crate::footprint::Footprint;
use crate::pool::{JobId, JobResult, PoolHandle, PoolToken, Priority, WaitingJob, WorkingJob};
use crate::query::{QueryId, QueryInfo};
use crate::resample::{resample, resample_into};
use crate::tile::TileBuffer;

/// Messages accepted by the Resampler.
pub enum ResamplerMsg {
    /// One contribution to a production tile. `sample` is `None` when the
    /// region lies outside the backing raster and stays nodata.
    ResampleAndAccumulate {
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        resample_fp: Footprint,
        sample: Option<Arc<TileBuffer>>,
    },
    /// A production tile failed upstream; account it terminal and discard
    /// whatever was accumulated for it.
    TileAbandoned {
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        message: String,
    },
    /// The Waiting Room granted a concurrency token for a scheduled job.
    TokenGranted { id: JobId, token: PoolToken },
    /// The Working Room finished a job.
    JobDone { id: JobId, result: JobResult },
    /// Drop all of a query's bookkeeping and unschedule its jobs.
    CancelThisQuery(QueryId),
    /// Stop, cancelling everything in flight.
    Die,
}

impl std::fmt::Debug for ResamplerMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResampleAndAccumulate {
                qi,
                prod_idx,
                resample_fp,
                sample,
            } => f
                .debug_struct("ResampleAndAccumulate")
                .field("query", &qi.id())
                .field("prod_idx", prod_idx)
                .field("resample_fp", resample_fp)
                .field("has_sample", &sample.is_some())
                .finish(),
            Self::TileAbandoned { qi, prod_idx, .. } => f
                .debug_struct("TileAbandoned")
                .field("query", &qi.id())
                .field("prod_idx", prod_idx)
                .finish(),
            Self::TokenGranted { id, .. } => f.debug_struct("TokenGranted").field("id", id).finish(),
            Self::JobDone { id, .. } => f.debug_struct("JobDone").field("id", id).finish(),
            Self::CancelThisQuery(q) => f.debug_tuple("CancelThisQuery").field(q).finish(),
            Self::Die => write!(f, "Die"),
        }
    }
}

/// Accumulation state of one production tile.
struct ProdState {
    /// The destination array, shared with in-place pool payloads.
    slot: Arc<Mutex<TileBuffer>>,
    /// Resample footprints not yet accumulated.
    missing: HashSet<Footprint>,
}

struct QueryState {
    qi: Arc<QueryInfo>,
    prods: HashMap<usize, ProdState>,
    /// Production indices already terminal, made or failed.
    terminal: HashSet<usize>,
}

/// A scheduled contribution waiting for its concurrency token.
struct PendingJob {
    qi: Arc<QueryInfo>,
    prod_idx: usize,
    sample: Arc<TileBuffer>,
}

/// The Resampler actor of one raster's actor group.
pub struct ActorResampler {
    address: ActorAddress,
    rx: mpsc::UnboundedReceiver<ResamplerMsg>,
    /// Sender half of our own mailbox, captured by pool callbacks.
    self_tx: mpsc::UnboundedSender<ResamplerMsg>,
    pool: PoolHandle,
    producer_tx: mpsc::UnboundedSender<ProducerMsg>,
    queries: HashMap<QueryId, QueryState>,
    /// Cancelled query ids; contributions for them are discarded.
    cancelled: HashSet<QueryId>,
    waiting: HashMap<JobId, PendingJob>,
    /// Production index per launched job.
    working: HashMap<JobId, usize>,
}

impl ActorResampler {
    pub fn new(
        raster: RasterId,
        rx: mpsc::UnboundedReceiver<ResamplerMsg>,
        self_tx: mpsc::UnboundedSender<ResamplerMsg>,
        pool: PoolHandle,
        producer_tx: mpsc::UnboundedSender<ProducerMsg>,
    ) -> Self {
        Self {
            address: ActorAddress::new(raster, Role::Resampler),
            rx,
            self_tx,
            pool,
            producer_tx,
            queries: HashMap::new(),
            cancelled: HashSet::new(),
            waiting: HashMap::new(),
            working: HashMap::new(),
        }
    }

    /// Runs the message loop until `Die`, mailbox closure or shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(actor = %self.address, pool = %self.pool.id(), "Resampler starting");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                msg = self.rx.recv() => match msg {
                    Some(ResamplerMsg::Die) | None => {
                        let queries: Vec<_> = self.queries.keys().copied().collect();
                        for query in queries {
                            self.cancel(query);
                        }
                        break;
                    }
                    Some(msg) => self.handle(msg),
                },
            }
        }
        debug!(actor = %self.address, "Resampler stopped");
    }

    fn handle(&mut self, msg: ResamplerMsg) {
        match msg {
            ResamplerMsg::ResampleAndAccumulate {
                qi,
                prod_idx,
                resample_fp,
                sample,
            } => self.accumulate(qi, prod_idx, resample_fp, sample),
            ResamplerMsg::TileAbandoned {
                qi,
                prod_idx,
                message,
            } => {
                let query = qi.id();
                if self.cancelled.contains(&query) {
                    trace!(actor = %self.address, query = %query, prod_idx, "Abandonment of cancelled query discarded");
                    return;
                }
                self.queries.entry(query).or_insert_with(|| QueryState {
                    qi,
                    prods: HashMap::new(),
                    terminal: HashSet::new(),
                });
                self.fail_tile(query, prod_idx, message);
            }
            ResamplerMsg::TokenGranted { id, token } => self.token_granted(id, token),
            ResamplerMsg::JobDone { id, result } => self.job_done(id, result),
            ResamplerMsg::CancelThisQuery(query) => self.cancel(query),
            ResamplerMsg::Die => unreachable!("handled in run loop"),
        }
    }

    fn accumulate(
        &mut self,
        qi: Arc<QueryInfo>,
        prod_idx: usize,
        resample_fp: Footprint,
        sample: Option<Arc<TileBuffer>>,
    ) {
        let query = qi.id();
        if self.cancelled.contains(&query) {
            trace!(actor = %self.address, query = %query, prod_idx, "Contribution for cancelled query discarded");
            return;
        }
        let state = self.queries.entry(query).or_insert_with(|| QueryState {
            qi: Arc::clone(&qi),
            prods: HashMap::new(),
            terminal: HashSet::new(),
        });
        if state.terminal.contains(&prod_idx) {
            trace!(actor = %self.address, query = %query, prod_idx, "Contribution to terminal tile discarded");
            return;
        }

        // Allocate the production array on the first contribution only.
        let tile = &state.qi.prod()[prod_idx];
        let prod = state.prods.entry(prod_idx).or_insert_with(|| ProdState {
            slot: Arc::new(Mutex::new(TileBuffer::filled(
                tile.fp,
                qi.channel_count(),
                qi.dst_nodata(),
            ))),
            missing: tile.resample_fps(),
        });
        assert!(
            prod.missing.contains(&resample_fp),
            "unexpected contribution {resample_fp} to tile {prod_idx} of {query}"
        );

        match sample {
            // Outside the backing raster: the nodata prefill is the result.
            None => self.contribution_done(query, prod_idx, resample_fp),
            Some(sample) => {
                let id = JobId {
                    actor: self.address,
                    query,
                    fp: resample_fp,
                };
                self.waiting.insert(
                    id,
                    PendingJob {
                        qi,
                        prod_idx,
                        sample,
                    },
                );
                let self_tx = self.self_tx.clone();
                self.pool.schedule_job(WaitingJob {
                    id,
                    priority: Priority::PRODUCTION,
                    grant: Box::new(move |token| {
                        let _ = self_tx.send(ResamplerMsg::TokenGranted { id, token });
                    }),
                });
            }
        }
    }

    fn token_granted(&mut self, id: JobId, token: PoolToken) {
        let Some(pending) = self.waiting.remove(&id) else {
            // Grant raced with an unschedule; dropping the token frees it.
            trace!(actor = %self.address, job = %id, "Token for unscheduled job returned");
            return;
        };
        let PendingJob {
            qi,
            prod_idx,
            sample,
        } = pending;
        let Some(prod) = self.queries.get(&id.query).and_then(|s| s.prods.get(&prod_idx)) else {
            trace!(actor = %self.address, job = %id, "Token for dropped tile returned");
            return;
        };

        let interpolation = qi.interpolation();
        let nodata = qi.dst_nodata();
        let resample_fp = id.fp;

        let run: Box<dyn FnOnce(&CancellationToken) -> JobResult + Send> =
            if self.pool.in_place_capable() {
                let slot = Arc::clone(&prod.slot);
                Box::new(move |_cancel| {
                    let mut dst = slot.lock();
                    resample_into(&sample, resample_fp, &mut dst, interpolation, nodata);
                    Ok(None)
                })
            } else {
                Box::new(move |_cancel| {
                    Ok(Some(resample(&sample, resample_fp, interpolation, nodata)))
                })
            };

        let self_tx = self.self_tx.clone();
        self.working.insert(id, prod_idx);
        self.pool.launch_job_with_token(
            WorkingJob {
                id,
                run,
                complete: Box::new(move |id, result| {
                    let _ = self_tx.send(ResamplerMsg::JobDone { id, result });
                }),
            },
            token,
        );
    }

    fn job_done(&mut self, id: JobId, result: JobResult) {
        let Some(prod_idx) = self.working.remove(&id) else {
            trace!(actor = %self.address, job = %id, "Stale completion discarded");
            return;
        };
        match result {
            Ok(None) => self.contribution_done(id.query, prod_idx, id.fp),
            Ok(Some(region)) => {
                if let Some(prod) = self
                    .queries
                    .get(&id.query)
                    .and_then(|s| s.prods.get(&prod_idx))
                {
                    let mut dst = prod.slot.lock();
                    let slice = id
                        .fp
                        .slice_in(dst.fp())
                        .expect("resample footprint not contained in production footprint");
                    dst.write_slice(slice, &region);
                    drop(dst);
                    self.contribution_done(id.query, prod_idx, id.fp);
                }
            }
            Err(err) => self.fail_tile(id.query, prod_idx, err.to_string()),
        }
    }

    /// Marks one contribution complete and delivers the array when it was
    /// the last one.
    fn contribution_done(&mut self, query: QueryId, prod_idx: usize, resample_fp: Footprint) {
        let Some(state) = self.queries.get_mut(&query) else {
            return;
        };
        if state.terminal.contains(&prod_idx) {
            return;
        }
        let Some(prod) = state.prods.get_mut(&prod_idx) else {
            return;
        };
        assert!(
            prod.missing.remove(&resample_fp),
            "contribution {resample_fp} to tile {prod_idx} of {query} completed twice"
        );
        if !prod.missing.is_empty() {
            return;
        }

        // Last contribution: reclaim sole ownership of the array and hand
        // it to the Producer.
        let prod = state.prods.remove(&prod_idx).expect("tile state vanished");
        state.terminal.insert(prod_idx);
        let buffer = Arc::try_unwrap(prod.slot)
            .unwrap_or_else(|_| panic!("production array of {query} still shared"))
            .into_inner();
        debug!(actor = %self.address, query = %query, prod_idx, "Production array complete");
        let _ = self.producer_tx.send(ProducerMsg::MadeThisArray {
            query,
            prod_idx,
            buffer,
        });
        self.drop_if_done(query);
    }

    fn fail_tile(&mut self, query: QueryId, prod_idx: usize, message: String) {
        let Some(state) = self.queries.get_mut(&query) else {
            return;
        };
        if !state.terminal.insert(prod_idx) {
            return;
        }
        state.prods.remove(&prod_idx);
        debug!(actor = %self.address, query = %query, prod_idx, %message, "Production tile failed");
        let _ = self.producer_tx.send(ProducerMsg::ProductionFailed {
            query,
            prod_idx,
            message,
        });

        // Outstanding jobs for the failed tile only waste workers now.
        let doomed_waiting: Vec<JobId> = self
            .waiting
            .iter()
            .filter(|(id, p)| id.query == query && p.prod_idx == prod_idx)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed_waiting {
            self.waiting.remove(&id);
            self.pool.unschedule_job(id);
        }
        let doomed_working: Vec<JobId> = self
            .working
            .iter()
            .filter(|(id, idx)| id.query == query && **idx == prod_idx)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed_working {
            self.working.remove(&id);
            self.pool.cancel_job(id);
        }
        self.drop_if_done(query);
    }

    fn drop_if_done(&mut self, query: QueryId) {
        let done = self
            .queries
            .get(&query)
            .map(|s| s.terminal.len() == s.qi.produce_count())
            .unwrap_or(false);
        if done {
            trace!(actor = %self.address, query = %query, "All tiles terminal");
            self.queries.remove(&query);
        }
    }

    fn cancel(&mut self, query: QueryId) {
        // Tombstone first: a contribution racing the cancel must not
        // recreate the query's state.
        self.cancelled.insert(query);
        if self.queries.remove(&query).is_none() {
            trace!(actor = %self.address, query = %query, "Cancel no-op");
            return;
        }
        debug!(actor = %self.address, query = %query, "Cancelling query");

        let waiting_ids: Vec<JobId> = self
            .waiting
            .keys()
            .filter(|id| id.query == query)
            .copied()
            .collect();
        for id in waiting_ids {
            self.waiting.remove(&id);
            self.pool.unschedule_job(id);
        }
        let working_ids: Vec<JobId> = self
            .working
            .keys()
            .filter(|id| id.query == query)
            .copied()
            .collect();
        for id in working_ids {
            self.working.remove(&id);
            self.pool.cancel_job(id);
        }
    }
}
