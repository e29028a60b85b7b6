//! The Writer actor: persists computed cache tiles.
//!
//! Sits between the Computer and the cache store so that store latency
//! never stalls the Computer's message loop. A write failure is logged and
//! dropped; the tile was already delivered to its waiters in memory, so
//! losing the cached copy only costs a recomputation later.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ActorAddress, RasterId, Role};
use crate::cache::CacheStore;
use crate::footprint::Footprint;
use crate::tile::TileBuffer;

/// Messages accepted by the Writer.
pub enum WriterMsg {
    /// Persist a computed cache tile.
    WriteThisArray {
        cache_fp: Footprint,
        array: Arc<TileBuffer>,
    },
    /// Stop after draining nothing further.
    Die,
}

impl std::fmt::Debug for WriterMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WriteThisArray { cache_fp, .. } => f
                .debug_struct("WriteThisArray")
                .field("cache_fp", cache_fp)
                .finish(),
            Self::Die => write!(f, "Die"),
        }
    }
}

/// The Writer actor of one raster's actor group.
pub struct ActorWriter {
    address: ActorAddress,
    rx: mpsc::UnboundedReceiver<WriterMsg>,
    store: Arc<dyn CacheStore>,
}

impl ActorWriter {
    pub fn new(
        raster: RasterId,
        rx: mpsc::UnboundedReceiver<WriterMsg>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            address: ActorAddress::new(raster, Role::Writer),
            rx,
            store,
        }
    }

    /// Runs the message loop until `Die`, mailbox closure or shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!(actor = %self.address, "Writer starting");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                msg = self.rx.recv() => match msg {
                    Some(WriterMsg::WriteThisArray { cache_fp, array }) => {
                        self.write(cache_fp, array).await;
                    }
                    Some(WriterMsg::Die) | None => break,
                },
            }
        }
        debug!(actor = %self.address, "Writer stopped");
    }

    async fn write(&self, cache_fp: Footprint, array: Arc<TileBuffer>) {
        if let Err(err) = self.store.write(&cache_fp, array).await {
            warn!(
                actor = %self.address,
                fp = %cache_fp,
                error = %err,
                "Cache write failed; tile will be recomputed on next miss"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_writes_land_in_store() {
        let store = Arc::new(MemoryCacheStore::new(1 << 20));
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let writer = ActorWriter::new(RasterId(0), rx, store.clone());
        tokio::spawn(writer.run(shutdown.clone()));

        let fp = Footprint::new(0.0, 4.0, 1.0, 4, 4);
        tx.send(WriterMsg::WriteThisArray {
            cache_fp: fp,
            array: Arc::new(TileBuffer::filled(fp, 1, 9.0)),
        })
        .unwrap();

        // The write is async; poll until it lands.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if store.contains(&fp).await.unwrap() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "write never landed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_die_stops_loop() {
        let store = Arc::new(MemoryCacheStore::new(1 << 20));
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = ActorWriter::new(RasterId(0), rx, store);
        let handle = tokio::spawn(writer.run(CancellationToken::new()));

        tx.send(WriterMsg::Die).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("writer did not stop")
            .unwrap();
    }
}
