//! The engine facade: actor wiring, query drivers and cancellation.
//!
//! [`TileEngine::start`] spawns one actor group (Computer, Resampler,
//! Producer, Writer) and two worker pools, then hands out a cheap facade.
//! Each submitted query gets its own driver task that walks the frozen
//! plan: it activates the backing resource, ensures every cache
//! dependency exists (computing misses through the Computer), resolves
//! each sample array cache-first (computed dependencies and stored tiles
//! satisfy the read, the backing resource serves the rest) and feeds
//! contributions to the Resampler, then deactivates the resource. Results
//! stream back through the Producer on the query's own channel.
//!
//! Cancellation is per query and idempotent: it trips the driver's token
//! and broadcasts `CancelThisQuery` to every actor; whichever in-flight
//! work cannot be unscheduled finishes and has its result discarded.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::actors::computer::ComputedTile;
use crate::actors::{
    ActorComputer, ActorProducer, ActorResampler, ActorWriter, ComputerMsg, ProducedResult,
    ProducerMsg, RasterId, ResamplerMsg, WriterMsg,
};
use crate::cache::CacheStore;
use crate::footprint::Footprint;
use crate::pool::{start_pool, ActivationPool, PoolConfig, ResourceId, ResourceLifecycle};
use crate::query::{QueryId, QueryInfo, QueryPlan};
use crate::source::{ComputeArray, ResourceReader};
use crate::tile::TileBuffer;

static NEXT_RASTER_ID: AtomicU64 = AtomicU64::new(0);

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrency tokens of the resampling pool.
    pub resample_workers: usize,
    /// Concurrency tokens of the computation pool.
    pub compute_workers: usize,
    /// Whether resample payloads write straight into production arrays.
    pub resample_in_place: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resample_workers: crate::pool::DEFAULT_POOL_WORKERS,
            compute_workers: crate::pool::DEFAULT_POOL_WORKERS,
            resample_in_place: true,
        }
    }
}

/// Consumer side of one submitted query.
///
/// Yields one [`ProducedResult`] per production tile, in production
/// order, then ends. Ends without further items when the query is
/// cancelled.
pub struct QueryStream {
    id: QueryId,
    rx: mpsc::UnboundedReceiver<ProducedResult>,
}

impl QueryStream {
    /// The engine-assigned identity of the query.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Receives the next finished tile.
    pub async fn next_tile(&mut self) -> Option<ProducedResult> {
        self.rx.recv().await
    }
}

impl Stream for QueryStream {
    type Item = ProducedResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A running tile production engine for one raster.
pub struct TileEngine {
    raster: RasterId,
    resource: ResourceId,
    computer_tx: mpsc::UnboundedSender<ComputerMsg>,
    resampler_tx: mpsc::UnboundedSender<ResamplerMsg>,
    producer_tx: mpsc::UnboundedSender<ProducerMsg>,
    writer_tx: mpsc::UnboundedSender<WriterMsg>,
    activation: Arc<ActivationPool>,
    reader: Arc<dyn ResourceReader>,
    store: Arc<dyn CacheStore>,
    shutdown: CancellationToken,
    next_query: AtomicU64,
    /// Driver cancellation token per in-flight query.
    cancels: Arc<DashMap<QueryId, CancellationToken>>,
}

impl TileEngine {
    /// Starts the actor group and worker pools.
    pub fn start(
        config: EngineConfig,
        reader: Arc<dyn ResourceReader>,
        compute: Arc<dyn ComputeArray>,
        store: Arc<dyn CacheStore>,
        lifecycle: Arc<dyn ResourceLifecycle>,
    ) -> Self {
        let raster = RasterId(NEXT_RASTER_ID.fetch_add(1, Ordering::Relaxed));
        let resource = ResourceId(raster.0);
        let shutdown = CancellationToken::new();

        let resample_pool = start_pool(
            PoolConfig {
                workers: config.resample_workers,
                in_place_capable: config.resample_in_place,
                label: format!("{raster}-resample"),
            },
            shutdown.clone(),
        );
        let compute_pool = start_pool(
            PoolConfig {
                workers: config.compute_workers,
                in_place_capable: false,
                label: format!("{raster}-compute"),
            },
            shutdown.clone(),
        );

        let (computer_tx, computer_rx) = mpsc::unbounded_channel();
        let (resampler_tx, resampler_rx) = mpsc::unbounded_channel();
        let (producer_tx, producer_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let producer = ActorProducer::new(raster, producer_rx);
        tokio::spawn(producer.run(shutdown.clone()));

        let writer = ActorWriter::new(raster, writer_rx, Arc::clone(&store));
        tokio::spawn(writer.run(shutdown.clone()));

        let resampler = ActorResampler::new(
            raster,
            resampler_rx,
            resampler_tx.clone(),
            resample_pool,
            producer_tx.clone(),
        );
        tokio::spawn(resampler.run(shutdown.clone()));

        let computer = ActorComputer::new(
            raster,
            computer_rx,
            computer_tx.clone(),
            compute_pool,
            Arc::clone(&store),
            compute,
            writer_tx.clone(),
            producer_tx.clone(),
        );
        tokio::spawn(computer.run(shutdown.clone()));

        info!(raster = %raster, "Tile engine started");

        Self {
            raster,
            resource,
            computer_tx,
            resampler_tx,
            producer_tx,
            writer_tx,
            activation: Arc::new(ActivationPool::new(lifecycle)),
            reader,
            store,
            shutdown,
            next_query: AtomicU64::new(0),
            cancels: Arc::new(DashMap::new()),
        }
    }

    /// The raster this engine serves.
    pub fn raster(&self) -> RasterId {
        self.raster
    }

    /// Net outstanding activations of the backing resource.
    pub fn active_count(&self) -> usize {
        self.activation.active_count(self.resource)
    }

    /// Submits a query and returns its result stream.
    ///
    /// The plan is frozen immediately; mutating the caller's copy
    /// afterwards has no effect on the running query.
    pub fn submit(&self, plan: QueryPlan) -> QueryStream {
        let id = QueryId(self.next_query.fetch_add(1, Ordering::Relaxed));
        let qi = Arc::new(QueryInfo::new(id, plan));
        debug!(raster = %self.raster, query = %id, tiles = qi.produce_count(), "Query submitted");

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let _ = self.producer_tx.send(ProducerMsg::RegisterQuery {
            qi: Arc::clone(&qi),
            output_tx,
        });

        let cancel = CancellationToken::new();
        self.cancels.insert(id, cancel.clone());

        let driver = QueryDriver {
            qi,
            cancel,
            resource: self.resource,
            activation: Arc::clone(&self.activation),
            reader: Arc::clone(&self.reader),
            store: Arc::clone(&self.store),
            computer_tx: self.computer_tx.clone(),
            resampler_tx: self.resampler_tx.clone(),
            cancels: Arc::clone(&self.cancels),
        };
        tokio::spawn(driver.run());

        QueryStream { id, rx: output_rx }
    }

    /// Cancels a query. Idempotent; a no-op for finished or unknown ids.
    pub fn cancel(&self, query: QueryId) {
        if let Some((_, token)) = self.cancels.remove(&query) {
            debug!(raster = %self.raster, query = %query, "Cancelling query");
            token.cancel();
        } else {
            trace!(raster = %self.raster, query = %query, "Cancel no-op");
        }
        let _ = self.computer_tx.send(ComputerMsg::CancelThisQuery(query));
        let _ = self.resampler_tx.send(ResamplerMsg::CancelThisQuery(query));
        let _ = self.producer_tx.send(ProducerMsg::CancelThisQuery(query));
    }

    /// Stops every actor, pool and driver, and releases the backing
    /// resource regardless of outstanding activations.
    pub fn shutdown(&self) {
        info!(raster = %self.raster, "Tile engine shutting down");
        let _ = self.computer_tx.send(ComputerMsg::Die);
        let _ = self.resampler_tx.send(ResamplerMsg::Die);
        let _ = self.producer_tx.send(ProducerMsg::Die);
        let _ = self.writer_tx.send(WriterMsg::Die);
        self.shutdown.cancel();
        for entry in self.cancels.iter() {
            entry.value().cancel();
        }
        self.cancels.clear();
        self.activation.close(self.resource);
    }
}

/// Per-query driver task state.
struct QueryDriver {
    qi: Arc<QueryInfo>,
    cancel: CancellationToken,
    resource: ResourceId,
    activation: Arc<ActivationPool>,
    reader: Arc<dyn ResourceReader>,
    store: Arc<dyn CacheStore>,
    computer_tx: mpsc::UnboundedSender<ComputerMsg>,
    resampler_tx: mpsc::UnboundedSender<ResamplerMsg>,
    cancels: Arc<DashMap<QueryId, CancellationToken>>,
}

impl QueryDriver {
    async fn run(self) {
        let query = self.qi.id();
        self.activation.activate(self.resource);
        self.drive().await;
        self.activation.deactivate(self.resource);
        self.cancels.remove(&query);
        trace!(query = %query, "Driver finished");
    }

    async fn drive(&self) {
        let query = self.qi.id();

        // Phase 1: every cache dependency must exist before sampling.
        let mut failed_idxs: HashSet<usize> = HashSet::new();
        let mut computed: HashMap<Footprint, Arc<TileBuffer>> = HashMap::new();
        let cache_fps: Vec<Footprint> = self.qi.cache_fps().copied().collect();
        let mut replies = Vec::with_capacity(cache_fps.len());
        for fp in &cache_fps {
            let (reply_tx, reply_rx) = oneshot::channel::<ComputedTile>();
            if self
                .computer_tx
                .send(ComputerMsg::ComputeThisArray {
                    qi: Arc::clone(&self.qi),
                    cache_fp: *fp,
                    reply: reply_tx,
                })
                .is_err()
            {
                return;
            }
            replies.push((*fp, reply_rx));
        }
        for (fp, reply_rx) in replies {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                outcome = reply_rx => match outcome {
                    Ok(Ok(tile)) => {
                        // Sample reads over this footprint are served from
                        // the reply instead of the backing resource.
                        computed.insert(fp, tile);
                    }
                    Ok(Err(failed)) => {
                        // The Computer already attributed the failure to
                        // the Producer; remember the tiles to abandon.
                        warn!(query = %query, fp = %fp, error = %failed, "Cache dependency failed");
                        failed_idxs.extend(self.qi.prod_idxs_of_cache_fp(&fp));
                    }
                    // Reply dropped: the query was cancelled at the Computer.
                    Err(_) => return,
                },
            }
        }

        // Phase 2: dispatch the resampling contributions tile by tile.
        for (prod_idx, tile) in self.qi.prod().iter().enumerate() {
            if self.cancel.is_cancelled() {
                return;
            }
            if failed_idxs.contains(&prod_idx) {
                let _ = self.resampler_tx.send(ResamplerMsg::TileAbandoned {
                    qi: Arc::clone(&self.qi),
                    prod_idx,
                    message: "cache dependency failed".to_string(),
                });
                continue;
            }
            for step in &tile.resamples {
                if self.cancel.is_cancelled() {
                    return;
                }
                let sample = match step.sample_fp {
                    None => None,
                    Some(sample_fp) => {
                        // Cache-first: a tile computed in phase 1 or already
                        // stored satisfies the read without touching the
                        // backing resource.
                        let mut hit = computed.get(&sample_fp).cloned();
                        if hit.is_none() {
                            let looked = tokio::select! {
                                _ = self.cancel.cancelled() => return,
                                looked = self.store.lookup(&sample_fp) => looked,
                            };
                            match looked {
                                Ok(found) => hit = found,
                                Err(err) => {
                                    warn!(query = %query, fp = %sample_fp, error = %err, "Cache lookup failed; reading from resource");
                                }
                            }
                        }
                        match hit {
                            Some(tile) => Some(tile),
                            None => {
                                let read = tokio::select! {
                                    _ = self.cancel.cancelled() => return,
                                    read = self.reader.read(&sample_fp, self.qi.channel_count()) => read,
                                };
                                match read {
                                    Ok(sample) => {
                                        assert_eq!(
                                            *sample.fp(),
                                            sample_fp,
                                            "reader returned wrong footprint for {query}"
                                        );
                                        assert_eq!(
                                            sample.channels(),
                                            self.qi.channel_count(),
                                            "reader returned wrong channel count for {query}"
                                        );
                                        Some(Arc::new(sample))
                                    }
                                    Err(err) => {
                                        let _ = self.resampler_tx.send(ResamplerMsg::TileAbandoned {
                                            qi: Arc::clone(&self.qi),
                                            prod_idx,
                                            message: err.to_string(),
                                        });
                                        break;
                                    }
                                }
                            }
                        }
                    }
                };
                let _ = self.resampler_tx.send(ResamplerMsg::ResampleAndAccumulate {
                    qi: Arc::clone(&self.qi),
                    prod_idx,
                    resample_fp: step.resample_fp,
                    sample,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BoxFuture, MemoryCacheStore};
    use crate::query::{ChannelId, Interpolation, ProdTileInfo, ResampleStep};
    use crate::source::{ComputeError, ReadError};
    use crate::tile::{ArrayData, DstDtype, TileBuffer};
    use std::time::Duration;

    struct NoopLifecycle;
    impl ResourceLifecycle for NoopLifecycle {
        fn acquire(&self, _id: ResourceId) {}
        fn release(&self, _id: ResourceId) {}
    }

    /// Reads a constant value everywhere.
    struct ConstantReader(f64);
    impl ResourceReader for ConstantReader {
        fn read(
            &self,
            fp: &Footprint,
            channels: usize,
        ) -> BoxFuture<'_, Result<TileBuffer, ReadError>> {
            let fp = *fp;
            let value = self.0;
            Box::pin(async move { Ok(TileBuffer::filled(fp, channels, value)) })
        }
    }

    struct ConstantCompute(f64);
    impl ComputeArray for ConstantCompute {
        fn compute(
            &self,
            fp: &Footprint,
            channels: usize,
            _cancel: &CancellationToken,
        ) -> Result<TileBuffer, ComputeError> {
            Ok(TileBuffer::filled(*fp, channels, self.0))
        }
    }

    fn engine() -> TileEngine {
        TileEngine::start(
            EngineConfig::default(),
            Arc::new(ConstantReader(6.0)),
            Arc::new(ConstantCompute(2.0)),
            Arc::new(MemoryCacheStore::new(1 << 20)),
            Arc::new(NoopLifecycle),
        )
    }

    fn simple_plan(tiles: usize) -> QueryPlan {
        let prod = (0..tiles)
            .map(|i| {
                let fp = Footprint::new(i as f64 * 4.0, 4.0, 1.0, 4, 4);
                ProdTileInfo {
                    fp,
                    cache_fps: vec![],
                    resamples: vec![ResampleStep {
                        resample_fp: fp,
                        sample_fp: Some(fp),
                    }],
                }
            })
            .collect();
        QueryPlan {
            channels: vec![ChannelId(0)],
            dst_dtype: DstDtype::F64,
            dst_nodata: -1.0,
            interpolation: Interpolation::Nearest,
            prod,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let engine = engine();
        let mut stream = engine.submit(simple_plan(2));

        for expected_idx in 0..2 {
            let tile = tokio::time::timeout(Duration::from_secs(2), stream.next_tile())
                .await
                .expect("timed out")
                .expect("stream ended early")
                .expect("tile failed");
            assert_eq!(tile.prod_idx, expected_idx);
            match tile.data {
                ArrayData::F64(values) => assert!(values.iter().all(|&v| v == 6.0)),
                other => panic!("unexpected dtype {:?}", other.dtype()),
            }
        }
        assert!(tokio::time::timeout(Duration::from_secs(1), stream.next_tile())
            .await
            .expect("timed out")
            .is_none());

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_activation_released_after_query() {
        let engine = engine();
        let mut stream = engine.submit(simple_plan(1));
        while tokio::time::timeout(Duration::from_secs(2), stream.next_tile())
            .await
            .expect("timed out")
            .is_some()
        {}

        // The driver deactivates when it finishes.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while engine.active_count() != 0 {
            assert!(tokio::time::Instant::now() < deadline, "activation leaked");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let engine = engine();
        let stream = engine.submit(simple_plan(1));
        let id = stream.id();

        engine.cancel(id);
        engine.cancel(id);
        engine.cancel(QueryId(9999));

        engine.shutdown();
    }
}
