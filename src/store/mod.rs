use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::job::{Job, JobStatus, StageError};
use crate::models::payload::StageRecord;
use crate::models::stage::Stage;

pub mod memory;

/// Partial update merged atomically into a job document.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub current_stage: Option<Stage>,

    /// Clamped so a job's progress never decreases.
    pub progress: Option<u8>,

    pub error: Option<StageError>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Write-once: refused if the stage already has a recorded result.
    pub stage_result: Option<(Stage, StageRecord)>,
}

/// Result of a compare-and-set update.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The patch was applied; carries the updated document.
    Applied(Job),
    /// The guard no longer held; nothing changed. Carries the stored document.
    Stale(Job),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    AlreadyExists(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} is terminal and cannot be updated")]
    TerminalJob(String),

    #[error("job {job_id} already has a result for stage {stage}")]
    StageResultExists { job_id: String, stage: Stage },
}

/// Durable, keyed storage of job documents.
///
/// Implementations must make every committed mutation immediately visible to
/// subsequent `get` calls and must support concurrent callers without lost
/// updates: `update_if_current` is the compare-and-set primitive the
/// coordinator uses to reject stale completion callbacks.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job document. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, job: Job) -> Result<(), StoreError>;

    /// Fetch a job by id.
    async fn get(&self, job_id: &str) -> Result<Job, StoreError>;

    /// Atomically merge `patch` into the job, bumping `updated_at`.
    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<Job, StoreError>;

    /// Merge `patch` only if the job is non-terminal, its current stage is
    /// `expected`, and no result is recorded for that stage yet.
    async fn update_if_current(
        &self,
        job_id: &str,
        expected: Stage,
        patch: JobPatch,
    ) -> Result<CasOutcome, StoreError>;
}
