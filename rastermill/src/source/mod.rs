//! Sample data ingestion.
//!
//! Two collaborator traits feed the engine with pixels:
//!
//! - [`ResourceReader`] reads a sample array for a footprint from a pooled
//!   backing resource (a driver handle, a file descriptor). Async and
//!   dyn-compatible so the engine can hold `Arc<dyn ResourceReader>`.
//! - [`ComputeArray`] produces a cache tile from scratch. Synchronous by
//!   contract: the Computer runs it on a blocking pool worker under a
//!   concurrency token, with a cancellation token the payload should poll
//!   at convenient points.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::BoxFuture;
use crate::footprint::Footprint;
use crate::tile::TileBuffer;

/// Errors raised while reading sample data.
#[derive(Debug, Error)]
pub enum ReadError {
    /// I/O failure in the backing resource.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested footprint lies outside the resource's extent.
    #[error("footprint {fp} outside resource extent")]
    OutOfExtent { fp: Footprint },

    /// Backend-specific failure.
    #[error("read error: {0}")]
    Backend(String),
}

/// Errors raised while computing a cache tile.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// The user compute function failed.
    #[error("compute function failed: {0}")]
    Function(String),

    /// The payload observed cancellation and stopped early.
    #[error("computation cancelled")]
    Cancelled,
}

/// Reads sample arrays from a pooled backing resource.
///
/// The returned buffer must cover exactly `fp` with `channels` channels;
/// the engine panics on a shape mismatch because it indicates a broken
/// reader, not a data problem.
pub trait ResourceReader: Send + Sync {
    fn read(&self, fp: &Footprint, channels: usize) -> BoxFuture<'_, Result<TileBuffer, ReadError>>;
}

/// Computes a cache tile from scratch.
///
/// Runs on a blocking worker while a concurrency token is held. Long
/// computations should check `cancel.is_cancelled()` between stages and
/// return [`ComputeError::Cancelled`] to free their worker early; the
/// result of a cancelled job is discarded either way.
pub trait ComputeArray: Send + Sync {
    fn compute(
        &self,
        fp: &Footprint,
        channels: usize,
        cancel: &CancellationToken,
    ) -> Result<TileBuffer, ComputeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct GradientCompute;

    impl ComputeArray for GradientCompute {
        fn compute(
            &self,
            fp: &Footprint,
            channels: usize,
            cancel: &CancellationToken,
        ) -> Result<TileBuffer, ComputeError> {
            if cancel.is_cancelled() {
                return Err(ComputeError::Cancelled);
            }
            let mut tile = TileBuffer::filled(*fp, channels, 0.0);
            for row in 0..fp.height() as usize {
                for col in 0..fp.width() as usize {
                    for ch in 0..channels {
                        tile.set(row, col, ch, (row + col) as f64);
                    }
                }
            }
            Ok(tile)
        }
    }

    #[test]
    fn test_compute_fills_footprint() {
        let fp = Footprint::new(0.0, 4.0, 1.0, 3, 3);
        let tile = GradientCompute
            .compute(&fp, 2, &CancellationToken::new())
            .unwrap();
        assert_eq!(tile.get(1, 2, 0), 3.0);
        assert_eq!(tile.get(1, 2, 1), 3.0);
    }

    #[test]
    fn test_compute_observes_cancellation() {
        let fp = Footprint::new(0.0, 4.0, 1.0, 3, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = GradientCompute.compute(&fp, 1, &cancel);
        assert!(matches!(result, Err(ComputeError::Cancelled)));
    }

    #[test]
    fn test_reader_usable_as_trait_object() {
        struct ConstantReader;
        impl ResourceReader for ConstantReader {
            fn read(
                &self,
                fp: &Footprint,
                channels: usize,
            ) -> BoxFuture<'_, Result<TileBuffer, ReadError>> {
                let fp = *fp;
                Box::pin(async move { Ok(TileBuffer::filled(fp, channels, 1.0)) })
            }
        }

        let _reader: Arc<dyn ResourceReader> = Arc::new(ConstantReader);
    }
}
