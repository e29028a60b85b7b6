//! The Producer actor: per-query delivery bookkeeping.
//!
//! Tracks every registered query until all of its production tiles reach a
//! terminal state. A tile becomes terminal exactly once, either made (the
//! Resampler accumulated every contribution) or failed (a read or compute
//! error was attributed to it). Finished tiles are delivered on the
//! query's output channel in production order; delivery of tile `n` waits
//! for tiles `0..n` to be terminal first. When every tile is terminal the
//! query's state is dropped, which closes the output channel.
//!
//! A duplicate `made` event for the same tile is bookkeeping corruption
//! and aborts the actor; a `made` arriving after a `failed` for the same
//! tile is a benign race and is discarded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{ActorAddress, RasterId, Role};
use crate::footprint::Footprint;
use crate::query::{QueryId, QueryInfo};
use crate::tile::{ArrayData, TileBuffer};

/// A finished production tile as delivered to the consumer.
#[derive(Debug)]
pub struct ProducedArray {
    /// Index of the tile within the query's production order.
    pub prod_idx: usize,
    /// Footprint the array covers.
    pub fp: Footprint,
    /// Channels per pixel.
    pub channels: usize,
    /// Pixel data, cast to the query's destination dtype.
    pub data: ArrayData,
}

/// Why a production tile failed.
#[derive(Debug, Clone, Error)]
#[error("production of tile {prod_idx} failed for {query}: {message}")]
pub struct ProduceError {
    pub query: QueryId,
    pub prod_idx: usize,
    pub message: String,
}

/// One item of a query's output stream.
pub type ProducedResult = Result<ProducedArray, ProduceError>;

/// Messages accepted by the Producer.
pub enum ProducerMsg {
    /// Start tracking a submitted query.
    RegisterQuery {
        qi: Arc<QueryInfo>,
        output_tx: mpsc::UnboundedSender<ProducedResult>,
    },
    /// A production array is fully accumulated.
    MadeThisArray {
        query: QueryId,
        prod_idx: usize,
        buffer: TileBuffer,
    },
    /// A production array can never be completed.
    ProductionFailed {
        query: QueryId,
        prod_idx: usize,
        message: String,
    },
    /// Drop a query's bookkeeping; its output channel closes silently.
    CancelThisQuery(QueryId),
    /// Stop, dropping every tracked query.
    Die,
}

impl std::fmt::Debug for ProducerMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RegisterQuery { qi, .. } => {
                f.debug_struct("RegisterQuery").field("query", &qi.id()).finish()
            }
            Self::MadeThisArray { query, prod_idx, .. } => f
                .debug_struct("MadeThisArray")
                .field("query", query)
                .field("prod_idx", prod_idx)
                .finish(),
            Self::ProductionFailed { query, prod_idx, .. } => f
                .debug_struct("ProductionFailed")
                .field("query", query)
                .field("prod_idx", prod_idx)
                .finish(),
            Self::CancelThisQuery(q) => f.debug_tuple("CancelThisQuery").field(q).finish(),
            Self::Die => write!(f, "Die"),
        }
    }
}

/// Terminal state of one production tile.
enum Terminal {
    Made,
    Failed,
}

/// Delivery bookkeeping of one registered query.
struct QueryState {
    qi: Arc<QueryInfo>,
    output_tx: mpsc::UnboundedSender<ProducedResult>,
    /// Terminal state per production index, set exactly once.
    terminal: HashMap<usize, Terminal>,
    /// Finished results not yet released in production order.
    pending: BTreeMap<usize, ProducedResult>,
    /// Next production index to deliver.
    next_idx: usize,
}

/// The Producer actor of one raster's actor group.
pub struct ActorProducer {
    address: ActorAddress,
    rx: mpsc::UnboundedReceiver<ProducerMsg>,
    queries: HashMap<QueryId, QueryState>,
}

impl ActorProducer {
    pub fn new(raster: RasterId, rx: mpsc::UnboundedReceiver<ProducerMsg>) -> Self {
        Self {
            address: ActorAddress::new(raster, Role::Producer),
            rx,
            queries: HashMap::new(),
        }
    }

    /// Runs the message loop until `Die`, mailbox closure or shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(actor = %self.address, "Producer starting");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                msg = self.rx.recv() => match msg {
                    Some(ProducerMsg::Die) | None => break,
                    Some(msg) => self.handle(msg),
                },
            }
        }
        debug!(actor = %self.address, "Producer stopped");
    }

    fn handle(&mut self, msg: ProducerMsg) {
        match msg {
            ProducerMsg::RegisterQuery { qi, output_tx } => self.register(qi, output_tx),
            ProducerMsg::MadeThisArray {
                query,
                prod_idx,
                buffer,
            } => self.made(query, prod_idx, buffer),
            ProducerMsg::ProductionFailed {
                query,
                prod_idx,
                message,
            } => self.failed(query, prod_idx, message),
            ProducerMsg::CancelThisQuery(query) => self.cancel(query),
            ProducerMsg::Die => unreachable!("handled in run loop"),
        }
    }

    fn register(&mut self, qi: Arc<QueryInfo>, output_tx: mpsc::UnboundedSender<ProducedResult>) {
        let id = qi.id();
        debug!(actor = %self.address, query = %id, tiles = qi.produce_count(), "Registering query");
        let prior = self.queries.insert(
            id,
            QueryState {
                qi,
                output_tx,
                terminal: HashMap::new(),
                pending: BTreeMap::new(),
                next_idx: 0,
            },
        );
        assert!(prior.is_none(), "query {id} registered twice");
    }

    fn made(&mut self, query: QueryId, prod_idx: usize, buffer: TileBuffer) {
        let Some(state) = self.queries.get_mut(&query) else {
            // Cancelled while the last contribution was in flight.
            trace!(actor = %self.address, query = %query, prod_idx, "Made array for unknown query");
            return;
        };
        match state.terminal.get(&prod_idx) {
            Some(Terminal::Made) => {
                panic!("production tile {prod_idx} of {query} completed twice")
            }
            Some(Terminal::Failed) => {
                // Failure already delivered; the late array loses the race.
                trace!(actor = %self.address, query = %query, prod_idx, "Discarding array made after failure");
                return;
            }
            None => {}
        }
        state.terminal.insert(prod_idx, Terminal::Made);

        let array = ProducedArray {
            prod_idx,
            fp: *buffer.fp(),
            channels: buffer.channels(),
            data: buffer.cast(state.qi.dst_dtype()),
        };
        trace!(actor = %self.address, query = %query, prod_idx, "Array made");
        state.pending.insert(prod_idx, Ok(array));
        Self::flush(&self.address, state);
        self.drop_if_done(query);
    }

    fn failed(&mut self, query: QueryId, prod_idx: usize, message: String) {
        let Some(state) = self.queries.get_mut(&query) else {
            trace!(actor = %self.address, query = %query, prod_idx, "Failure for unknown query");
            return;
        };
        if state.terminal.contains_key(&prod_idx) {
            // Several collaborators may attribute a failure to the same
            // tile; only the first one is delivered.
            trace!(actor = %self.address, query = %query, prod_idx, "Duplicate failure discarded");
            return;
        }
        state.terminal.insert(prod_idx, Terminal::Failed);

        warn!(actor = %self.address, query = %query, prod_idx, %message, "Production tile failed");
        state.pending.insert(
            prod_idx,
            Err(ProduceError {
                query,
                prod_idx,
                message,
            }),
        );
        Self::flush(&self.address, state);
        self.drop_if_done(query);
    }

    /// Releases finished results in production order.
    fn flush(address: &ActorAddress, state: &mut QueryState) {
        while let Some(result) = state.pending.remove(&state.next_idx) {
            trace!(actor = %address, query = %state.qi.id(), prod_idx = state.next_idx, "Delivering");
            state.next_idx += 1;
            if state.output_tx.send(result).is_err() {
                // Consumer dropped its receiver; keep accounting so the
                // query still reaches the done state and gets dropped.
                trace!(actor = %address, query = %state.qi.id(), "Consumer gone");
            }
        }
    }

    fn drop_if_done(&mut self, query: QueryId) {
        let done = self
            .queries
            .get(&query)
            .map(|s| s.terminal.len() == s.qi.produce_count())
            .unwrap_or(false);
        if done {
            debug!(actor = %self.address, query = %query, "Query fully delivered");
            self.queries.remove(&query);
        }
    }

    fn cancel(&mut self, query: QueryId) {
        if self.queries.remove(&query).is_some() {
            debug!(actor = %self.address, query = %query, "Query cancelled");
        } else {
            trace!(actor = %self.address, query = %query, "Cancel no-op");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ChannelId, Interpolation, ProdTileInfo, QueryPlan, ResampleStep};
    use crate::tile::DstDtype;
    use std::time::Duration;

    fn fp(x: f64) -> Footprint {
        Footprint::new(x, 2.0, 1.0, 2, 2)
    }

    fn query_info(id: u64, tiles: usize) -> Arc<QueryInfo> {
        let prod = (0..tiles)
            .map(|i| {
                let tile_fp = fp(i as f64 * 2.0);
                ProdTileInfo {
                    fp: tile_fp,
                    cache_fps: vec![],
                    resamples: vec![ResampleStep {
                        resample_fp: tile_fp,
                        sample_fp: Some(tile_fp),
                    }],
                }
            })
            .collect();
        Arc::new(QueryInfo::new(
            QueryId(id),
            QueryPlan {
                channels: vec![ChannelId(0)],
                dst_dtype: DstDtype::F32,
                dst_nodata: -1.0,
                interpolation: Interpolation::Nearest,
                prod,
            },
        ))
    }

    struct Fixture {
        tx: mpsc::UnboundedSender<ProducerMsg>,
        shutdown: CancellationToken,
    }

    fn start() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let producer = ActorProducer::new(RasterId(0), rx);
        tokio::spawn(producer.run(shutdown.clone()));
        Fixture { tx, shutdown }
    }

    fn register(f: &Fixture, qi: Arc<QueryInfo>) -> mpsc::UnboundedReceiver<ProducedResult> {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        f.tx.send(ProducerMsg::RegisterQuery { qi, output_tx }).unwrap();
        output_rx
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ProducedResult>) -> Option<ProducedResult> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for delivery")
    }

    #[tokio::test]
    async fn test_delivers_in_production_order() {
        let f = start();
        let qi = query_info(1, 2);
        let mut out = register(&f, qi.clone());

        // Second tile finishes first; delivery must still start at idx 0.
        f.tx.send(ProducerMsg::MadeThisArray {
            query: QueryId(1),
            prod_idx: 1,
            buffer: TileBuffer::filled(qi.prod()[1].fp, 1, 2.0),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.tx.send(ProducerMsg::MadeThisArray {
            query: QueryId(1),
            prod_idx: 0,
            buffer: TileBuffer::filled(qi.prod()[0].fp, 1, 1.0),
        })
        .unwrap();

        let first = recv(&mut out).await.unwrap().unwrap();
        assert_eq!(first.prod_idx, 0);
        let second = recv(&mut out).await.unwrap().unwrap();
        assert_eq!(second.prod_idx, 1);

        // All tiles delivered: the stream closes.
        assert!(recv(&mut out).await.is_none());

        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failure_delivered_and_late_array_discarded() {
        let f = start();
        let qi = query_info(2, 1);
        let mut out = register(&f, qi.clone());

        f.tx.send(ProducerMsg::ProductionFailed {
            query: QueryId(2),
            prod_idx: 0,
            message: "backend unavailable".into(),
        })
        .unwrap();

        let err = recv(&mut out).await.unwrap().unwrap_err();
        assert_eq!(err.prod_idx, 0);
        assert_eq!(err.query, QueryId(2));

        // An array surfacing after the failure is discarded silently.
        f.tx.send(ProducerMsg::MadeThisArray {
            query: QueryId(2),
            prod_idx: 0,
            buffer: TileBuffer::filled(qi.prod()[0].fp, 1, 1.0),
        })
        .unwrap();
        assert!(recv(&mut out).await.is_none());

        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cast_to_destination_dtype() {
        let f = start();
        let qi = query_info(3, 1);
        let mut out = register(&f, qi.clone());

        f.tx.send(ProducerMsg::MadeThisArray {
            query: QueryId(3),
            prod_idx: 0,
            buffer: TileBuffer::filled(qi.prod()[0].fp, 1, 4.5),
        })
        .unwrap();

        let array = recv(&mut out).await.unwrap().unwrap();
        match array.data {
            ArrayData::F32(values) => assert_eq!(values[0], 4.5),
            other => panic!("expected F32 data, got {:?}", other.dtype()),
        }

        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancel_closes_stream_without_results() {
        let f = start();
        let qi = query_info(4, 1);
        let mut out = register(&f, qi.clone());

        f.tx.send(ProducerMsg::CancelThisQuery(QueryId(4))).unwrap();
        // Cancelling twice is a no-op.
        f.tx.send(ProducerMsg::CancelThisQuery(QueryId(4))).unwrap();
        assert!(recv(&mut out).await.is_none());

        // A contribution landing after the cancel is dropped.
        f.tx.send(ProducerMsg::MadeThisArray {
            query: QueryId(4),
            prod_idx: 0,
            buffer: TileBuffer::filled(qi.prod()[0].fp, 1, 1.0),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.shutdown.cancel();
    }
}
