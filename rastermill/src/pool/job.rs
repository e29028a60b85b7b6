//! Pool job types.
//!
//! A job is a unit of schedulable work bound to one actor, one query, and
//! one footprint. Its [`JobId`] is stable and hashable: it is the key the
//! Waiting Room uses for unscheduling and the Working Room uses for
//! cancellation and late-result detection.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::actors::ActorAddress;
use crate::footprint::Footprint;
use crate::pool::PoolToken;
use crate::query::QueryId;
use crate::tile::TileBuffer;

/// Stable identity of a pool job: owning actor + query + footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId {
    /// The actor that created the job and receives its results.
    pub actor: ActorAddress,
    /// The query the job belongs to; cancellation is keyed on this.
    pub query: QueryId,
    /// The footprint the job operates on.
    pub fp: Footprint,
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}@{}", self.actor, self.query, self.fp)
    }
}

/// Errors a working job can produce.
#[derive(Debug, Error)]
pub enum JobError {
    /// The payload itself failed (backing-store read, compute callback).
    #[error("job failed: {0}")]
    Failed(String),

    /// The worker executing the payload crashed (payload panicked).
    ///
    /// Detected by the pool from the blocking-task join error and reported
    /// to the owning actor like any other job failure.
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
}

/// Result delivered to the owning actor when a working job finishes.
///
/// `Ok(None)` means the payload wrote its output in place (shared address
/// space); `Ok(Some(_))` carries a result marshalled back by value.
pub type JobResult = Result<Option<TileBuffer>, JobError>;

/// Callback invoked by the Waiting Room when a concurrency token is free.
///
/// Posts a token-granted message into the owning actor's mailbox.
pub type GrantFn = Box<dyn FnOnce(PoolToken) + Send>;

/// The payload of a working job, executed on a blocking worker.
pub type RunFn = Box<dyn FnOnce(&CancellationToken) -> JobResult + Send>;

/// Callback invoked by the Working Room when a job finishes and has not
/// been cancelled in the meantime.
pub type CompleteFn = Box<dyn FnOnce(JobId, JobResult) + Send>;

/// A job submitted to the Waiting Room, not yet granted a token.
pub struct WaitingJob {
    pub id: JobId,
    pub priority: super::Priority,
    pub grant: GrantFn,
}

impl std::fmt::Debug for WaitingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitingJob")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A job granted a token, ready to execute in the Working Room.
pub struct WorkingJob {
    pub id: JobId,
    pub run: RunFn,
    pub complete: CompleteFn,
}

impl std::fmt::Debug for WorkingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingJob").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{RasterId, Role};
    use std::collections::HashSet;

    fn job_id(query: u64, x: f64) -> JobId {
        JobId {
            actor: ActorAddress::new(RasterId(1), Role::Resampler),
            query: QueryId(query),
            fp: Footprint::new(x, 10.0, 1.0, 4, 4),
        }
    }

    #[test]
    fn test_job_id_hashable() {
        let mut set = HashSet::new();
        set.insert(job_id(1, 0.0));
        set.insert(job_id(1, 0.0));
        set.insert(job_id(1, 4.0));
        set.insert(job_id(2, 0.0));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_job_id_display() {
        let id = job_id(5, 0.0);
        let s = id.to_string();
        assert!(s.contains("/Raster1/Resampler"));
        assert!(s.contains("Query5"));
    }

    #[test]
    fn test_job_error_display() {
        let err = JobError::Failed("read timed out".into());
        assert!(err.to_string().contains("read timed out"));
        let err = JobError::WorkerCrashed("panicked".into());
        assert!(err.to_string().contains("worker crashed"));
    }
}
