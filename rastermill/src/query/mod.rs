//! Immutable per-query execution plans.
//!
//! A client decomposes its read request into production tiles before
//! submission; the engine freezes that decomposition into a [`QueryInfo`]
//! which is shared as `Arc<QueryInfo>` across every actor touching the
//! query and never mutated afterwards. The [`QueryId`] is the hashable
//! identity used in all actor bookkeeping.

use std::collections::{HashMap, HashSet};

use crate::footprint::Footprint;
use crate::tile::DstDtype;

/// Engine-assigned identity of one submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query{}", self.0)
    }
}

/// Channel identifier in the backing store's channel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u16);

/// Interpolation method used when a resample footprint is not on the
/// backing store's grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpolation {
    /// Nearest-neighbour lookup.
    Nearest,
    /// Bilinear interpolation with post-interpolation nodata masking.
    Bilinear,
}

/// One resampling contribution to a production tile.
///
/// `sample_fp` is `None` when the destination region lies entirely outside
/// the backing raster; the region then stays filled with the destination
/// nodata and no read is performed.
#[derive(Debug, Clone)]
pub struct ResampleStep {
    /// Destination footprint within the production tile's grid.
    pub resample_fp: Footprint,
    /// Source footprint to sample from, in the backing store's grid.
    pub sample_fp: Option<Footprint>,
}

/// Everything needed to produce one production tile.
#[derive(Debug, Clone)]
pub struct ProdTileInfo {
    /// Destination footprint of the production array.
    pub fp: Footprint,
    /// Cache footprints this tile depends on (missing ones are computed).
    pub cache_fps: Vec<Footprint>,
    /// Resampling steps; always at least one.
    pub resamples: Vec<ResampleStep>,
}

impl ProdTileInfo {
    /// The set of resample footprints still outstanding when a production
    /// array is first allocated.
    pub fn resample_fps(&self) -> HashSet<Footprint> {
        self.resamples.iter().map(|s| s.resample_fp).collect()
    }
}

/// A client's read request, before the engine assigns a [`QueryId`].
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// Ordered channel identifiers to read.
    pub channels: Vec<ChannelId>,
    /// Destination element type of delivered arrays.
    pub dst_dtype: DstDtype,
    /// Destination nodata value.
    pub dst_nodata: f64,
    /// Interpolation method for off-grid resampling.
    pub interpolation: Interpolation,
    /// Production tiles, one per delivered array.
    pub prod: Vec<ProdTileInfo>,
}

/// Immutable execution plan of one in-flight query.
///
/// Created once per incoming query, read-only thereafter, shared by
/// reference across all actors processing the query.
#[derive(Debug)]
pub struct QueryInfo {
    id: QueryId,
    channels: Vec<ChannelId>,
    dst_dtype: DstDtype,
    dst_nodata: f64,
    interpolation: Interpolation,
    prod: Vec<ProdTileInfo>,
    /// Production indices depending on each cache footprint, used to
    /// surface a failed computation as failed production tiles.
    prod_idxs_of_cache_fp: HashMap<Footprint, Vec<usize>>,
}

impl QueryInfo {
    /// Freezes a plan under the given query id.
    ///
    /// # Panics
    ///
    /// Panics when the plan has no production tiles, no channels, or a
    /// production tile without resampling steps.
    pub fn new(id: QueryId, plan: QueryPlan) -> Self {
        assert!(!plan.prod.is_empty(), "query plan has no production tiles");
        assert!(!plan.channels.is_empty(), "query plan has no channels");

        let mut prod_idxs_of_cache_fp: HashMap<Footprint, Vec<usize>> = HashMap::new();
        for (idx, tile) in plan.prod.iter().enumerate() {
            assert!(
                !tile.resamples.is_empty(),
                "production tile without resampling steps"
            );
            for cache_fp in &tile.cache_fps {
                prod_idxs_of_cache_fp.entry(*cache_fp).or_default().push(idx);
            }
        }

        Self {
            id,
            channels: plan.channels,
            dst_dtype: plan.dst_dtype,
            dst_nodata: plan.dst_nodata,
            interpolation: plan.interpolation,
            prod: plan.prod,
            prod_idxs_of_cache_fp,
        }
    }

    /// The query's identity.
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Ordered channel identifiers.
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Number of channels per pixel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Destination element type.
    pub fn dst_dtype(&self) -> DstDtype {
        self.dst_dtype
    }

    /// Destination nodata value.
    pub fn dst_nodata(&self) -> f64 {
        self.dst_nodata
    }

    /// Interpolation method.
    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    /// Production tiles.
    pub fn prod(&self) -> &[ProdTileInfo] {
        &self.prod
    }

    /// Number of production tiles (arrays the consumer will receive).
    pub fn produce_count(&self) -> usize {
        self.prod.len()
    }

    /// Every cache footprint the query depends on, deduplicated.
    pub fn cache_fps(&self) -> impl Iterator<Item = &Footprint> {
        self.prod_idxs_of_cache_fp.keys()
    }

    /// Production indices depending on a cache footprint.
    pub fn prod_idxs_of_cache_fp(&self, fp: &Footprint) -> &[usize] {
        self.prod_idxs_of_cache_fp
            .get(fp)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
