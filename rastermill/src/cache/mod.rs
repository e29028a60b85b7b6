//! Cache-file storage behind the Computer and the production read path.
//!
//! The [`CacheStore`] trait is the narrow interface the engine needs: look
//! up a full-resolution tile by footprint, write a freshly computed one,
//! and check existence. It is dyn-compatible (`Pin<Box<dyn Future>>`
//! methods) so collaborators can hold an `Arc<dyn CacheStore>` regardless
//! of backend.
//!
//! Keys are derived from the footprint's grid identity, so two footprints
//! covering the same cells at the same resolution hit the same entry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use moka::future::Cache as MokaCache;
use thiserror::Error;
use tracing::trace;

use crate::footprint::Footprint;
use crate::tile::TileBuffer;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors surfaced by cache backends.
///
/// A cache error never aborts the engine; the owning actor converts it
/// into a failed production tile for the affected queries.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O failure in a disk-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store is shutting down and no longer accepts operations.
    #[error("cache store is shutting down")]
    ShuttingDown,

    /// Backend-specific failure.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Storage interface for computed cache tiles.
///
/// All implementations must be `Send + Sync` for use across async tasks.
pub trait CacheStore: Send + Sync {
    /// Looks up the tile stored for `fp`.
    ///
    /// Returns `Ok(None)` when no tile is cached for that footprint.
    fn lookup(&self, fp: &Footprint) -> BoxFuture<'_, Result<Option<Arc<TileBuffer>>, CacheError>>;

    /// Stores `array` as the tile for `fp`, replacing any prior entry.
    fn write(&self, fp: &Footprint, array: Arc<TileBuffer>) -> BoxFuture<'_, Result<(), CacheError>>;

    /// Checks existence without retrieving the value.
    fn contains(&self, fp: &Footprint) -> BoxFuture<'_, Result<bool, CacheError>>;
}

/// In-memory cache store backed by moka.
///
/// Moka gives lock-free reads, concurrent writes and automatic
/// size-bounded eviction, which fits the access pattern here: many
/// concurrent queries hitting a shared set of cache tiles.
pub struct MemoryCacheStore {
    cache: MokaCache<String, Arc<TileBuffer>>,
}

impl MemoryCacheStore {
    /// Creates a store evicting past `max_size_bytes` of tile data.
    pub fn new(max_size_bytes: u64) -> Self {
        let cache = MokaCache::builder()
            .weigher(|_key: &String, value: &Arc<TileBuffer>| -> u32 {
                value.size_bytes().min(u32::MAX as usize) as u32
            })
            .max_capacity(max_size_bytes)
            .build();
        Self { cache }
    }

    /// Current weighted size of all entries in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.cache.weighted_size()
    }

    /// Current number of cached tiles.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl CacheStore for MemoryCacheStore {
    fn lookup(&self, fp: &Footprint) -> BoxFuture<'_, Result<Option<Arc<TileBuffer>>, CacheError>> {
        let key = fp.grid_key();
        Box::pin(async move {
            let hit = self.cache.get(&key).await;
            trace!(key = %key, hit = hit.is_some(), "Cache lookup");
            Ok(hit)
        })
    }

    fn write(&self, fp: &Footprint, array: Arc<TileBuffer>) -> BoxFuture<'_, Result<(), CacheError>> {
        let key = fp.grid_key();
        Box::pin(async move {
            trace!(key = %key, bytes = array.size_bytes(), "Cache write");
            self.cache.insert(key, array).await;
            Ok(())
        })
    }

    fn contains(&self, fp: &Footprint) -> BoxFuture<'_, Result<bool, CacheError>> {
        let key = fp.grid_key();
        Box::pin(async move { Ok(self.cache.contains_key(&key)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> Footprint {
        Footprint::new(0.0, 4.0, 1.0, 4, 4)
    }

    fn tile(value: f64) -> Arc<TileBuffer> {
        Arc::new(TileBuffer::filled(fp(), 1, value))
    }

    #[tokio::test]
    async fn test_lookup_miss_then_hit() {
        let store = MemoryCacheStore::new(1 << 20);
        assert!(store.lookup(&fp()).await.unwrap().is_none());
        assert!(!store.contains(&fp()).await.unwrap());

        store.write(&fp(), tile(3.0)).await.unwrap();

        let hit = store.lookup(&fp()).await.unwrap().unwrap();
        assert_eq!(hit.get(0, 0, 0), 3.0);
        assert!(store.contains(&fp()).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_grid_footprints_share_entry() {
        let store = MemoryCacheStore::new(1 << 20);
        store.write(&fp(), tile(7.0)).await.unwrap();

        // A footprint nudged within grid tolerance resolves to the same key.
        let nudged = Footprint::new(1e-12, 4.0, 1.0, 4, 4);
        let hit = store.lookup(&nudged).await.unwrap().unwrap();
        assert_eq!(hit.get(0, 0, 0), 7.0);
    }

    #[tokio::test]
    async fn test_write_replaces() {
        let store = MemoryCacheStore::new(1 << 20);
        store.write(&fp(), tile(1.0)).await.unwrap();
        store.write(&fp(), tile(2.0)).await.unwrap();

        let hit = store.lookup(&fp()).await.unwrap().unwrap();
        assert_eq!(hit.get(0, 0, 0), 2.0);
    }

    #[tokio::test]
    async fn test_usable_as_trait_object() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new(1 << 20));
        store.write(&fp(), tile(5.0)).await.unwrap();
        assert!(store.contains(&fp()).await.unwrap());
    }
}
