use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::job::Job;
use crate::models::stage::Stage;

use super::{CasOutcome, JobPatch, JobStore, StoreError};

/// In-memory job store: the reference implementation of [`JobStore`].
/// Deployments that need durability plug in a database-backed one.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_patch(job: &mut Job, patch: JobPatch) -> Result<(), StoreError> {
    if job.status.is_terminal() {
        return Err(StoreError::TerminalJob(job.job_id.clone()));
    }
    if let Some((stage, _)) = &patch.stage_result {
        if job.stage_results.contains_key(stage) {
            return Err(StoreError::StageResultExists {
                job_id: job.job_id.clone(),
                stage: *stage,
            });
        }
    }

    if let Some((stage, record)) = patch.stage_result {
        job.stage_results.insert(stage, record);
    }
    if let Some(status) = patch.status {
        job.status = status;
    }
    if let Some(stage) = patch.current_stage {
        job.current_stage = Some(stage);
    }
    if let Some(progress) = patch.progress {
        job.progress = job.progress.max(progress);
    }
    if let Some(error) = patch.error {
        job.error = Some(error);
    }
    if let Some(at) = patch.completed_at {
        job.completed_at = Some(at);
    }
    job.updated_at = Utc::now();
    Ok(())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::AlreadyExists(job.job_id));
        }
        jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        apply_patch(job, patch)?;
        Ok(job.clone())
    }

    async fn update_if_current(
        &self,
        job_id: &str,
        expected: Stage,
        patch: JobPatch,
    ) -> Result<CasOutcome, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        let stale = job.status.is_terminal()
            || job.current_stage != Some(expected)
            || job.stage_results.contains_key(&expected);
        if stale {
            return Ok(CasOutcome::Stale(job.clone()));
        }

        apply_patch(job, patch)?;
        Ok(CasOutcome::Applied(job.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobStatus, StageError, TranscriptionParams};
    use crate::models::payload::{PreprocessingOutput, StageOutput, StageRecord};

    fn sample_job() -> Job {
        Job::new("uploads/a.wav", TranscriptionParams::default())
    }

    fn preprocessing_record() -> StageRecord {
        StageRecord::Completed {
            output: StageOutput::Preprocessing(PreprocessingOutput {
                normalized_audio_ref: "norm/a.wav".to_string(),
                sample_rate: 44_100,
                duration: 3.0,
            }),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = MemoryJobStore::new();
        let job = sample_job();
        store.create(job.clone()).await.unwrap();
        let err = store.create(job).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_get_unknown_job_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_is_visible_to_get() {
        let store = MemoryJobStore::new();
        let job = sample_job();
        store.create(job.clone()).await.unwrap();

        store
            .update(
                &job.job_id,
                JobPatch {
                    status: Some(JobStatus::Processing),
                    current_stage: Some(Stage::Preprocessing),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let stored = store.get(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.current_stage, Some(Stage::Preprocessing));
        assert!(stored.updated_at >= job.updated_at);
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let store = MemoryJobStore::new();
        let job = sample_job();
        store.create(job.clone()).await.unwrap();

        let patch = |p: u8| JobPatch {
            progress: Some(p),
            ..JobPatch::default()
        };
        store.update(&job.job_id, patch(60)).await.unwrap();
        let stored = store.update(&job.job_id, patch(20)).await.unwrap();
        assert_eq!(stored.progress, 60);
    }

    #[tokio::test]
    async fn test_stage_results_are_write_once() {
        let store = MemoryJobStore::new();
        let job = sample_job();
        store.create(job.clone()).await.unwrap();

        let patch = || JobPatch {
            stage_result: Some((Stage::Preprocessing, preprocessing_record())),
            ..JobPatch::default()
        };
        store.update(&job.job_id, patch()).await.unwrap();
        let err = store.update(&job.job_id, patch()).await.unwrap_err();
        assert!(matches!(err, StoreError::StageResultExists { .. }));
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_immutable() {
        let store = MemoryJobStore::new();
        let job = sample_job();
        store.create(job.clone()).await.unwrap();

        store
            .update(
                &job.job_id,
                JobPatch {
                    status: Some(JobStatus::Error),
                    error: Some(StageError {
                        stage: Stage::Preprocessing,
                        message: "decode failed".to_string(),
                    }),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .update(
                &job.job_id,
                JobPatch {
                    progress: Some(100),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalJob(_)));

        let stored = store.get(&job.job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.progress, 0);
    }

    #[tokio::test]
    async fn test_cas_rejects_mismatched_stage() {
        let store = MemoryJobStore::new();
        let job = sample_job();
        store.create(job.clone()).await.unwrap();
        store
            .update(
                &job.job_id,
                JobPatch {
                    status: Some(JobStatus::Processing),
                    current_stage: Some(Stage::Preprocessing),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let outcome = store
            .update_if_current(
                &job.job_id,
                Stage::NoteMapping,
                JobPatch {
                    progress: Some(80),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Stale(_)));
        assert_eq!(store.get(&job.job_id).await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn test_cas_rejects_already_recorded_stage() {
        let store = MemoryJobStore::new();
        let job = sample_job();
        store.create(job.clone()).await.unwrap();
        store
            .update(
                &job.job_id,
                JobPatch {
                    status: Some(JobStatus::Processing),
                    current_stage: Some(Stage::Preprocessing),
                    stage_result: Some((Stage::Preprocessing, preprocessing_record())),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();

        let outcome = store
            .update_if_current(
                &job.job_id,
                Stage::Preprocessing,
                JobPatch {
                    progress: Some(20),
                    ..JobPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Stale(_)));
    }
}
