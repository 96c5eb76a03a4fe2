use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::models::job::{Job, JobStatus, StageError, StatusReport, TranscriptionParams};
use crate::models::payload::{
    FeatureExtractionOutput, NoteMappingOutput, PreprocessingOutput, StageInput, StageOutput,
    StageRecord, StemSeparationOutput,
};
use crate::models::stage::Stage;
use crate::services::dispatch::{DispatchError, StageDispatcher, StageTask};
use crate::services::fanout::{self, FanOutController, FanOutOutcome};
use crate::services::progress;
use crate::store::{CasOutcome, JobPatch, JobStore, StoreError};

/// Outcome of a stage completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Result persisted; the job moved on to `next`.
    Advanced { next: Stage },
    /// The final stage completed; the job is COMPLETED.
    Completed,
    /// Stem separation branched into child jobs; the parent stops here.
    FannedOut { child_job_ids: Vec<String> },
    /// Stale or duplicate delivery; nothing changed.
    Stale,
    /// The payload failed validation; the job is now ERROR.
    Failed { stage: Stage, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Drives jobs through the stage pipeline.
///
/// The coordinator holds no lock across a stage's execution. Completion
/// callbacks are accepted at least once: staleness is detected by comparing
/// the callback's stage against the job's current stage (and the write-once
/// stage results), and every state transition goes through a compare-and-set
/// update so racing duplicates lose cleanly.
pub struct PipelineCoordinator {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn StageDispatcher>,
    fanout: FanOutController,
    stage_deadline: Duration,
}

impl PipelineCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn StageDispatcher>,
        stage_deadline: Duration,
    ) -> Self {
        let fanout = FanOutController::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            stage_deadline,
        );
        Self {
            store,
            dispatcher,
            fanout,
            stage_deadline,
        }
    }

    /// Create a PENDING job record for an uploaded source artifact.
    pub async fn submit(
        &self,
        source_audio_ref: impl Into<String>,
        params: TranscriptionParams,
    ) -> Result<Job, PipelineError> {
        let job = Job::new(source_audio_ref, params);
        self.store.create(job.clone()).await?;
        metrics::counter!("pipeline_jobs_submitted").increment(1);
        tracing::info!(
            job_id = %job.job_id,
            source = %job.source_audio_ref,
            instrument = %job.params.instrument_type,
            "job submitted"
        );
        Ok(job)
    }

    /// PENDING → PROCESSING: mark preprocessing current and dispatch it.
    /// Starting a job that already left PENDING is a no-op.
    pub async fn start(&self, job_id: &str) -> Result<(), PipelineError> {
        let job = self.store.get(job_id).await?;
        if job.status != JobStatus::Pending {
            tracing::warn!(job_id, status = %job.status, "start ignored for non-pending job");
            return Ok(());
        }

        let job = self
            .store
            .update(
                job_id,
                JobPatch {
                    status: Some(JobStatus::Processing),
                    current_stage: Some(Stage::Preprocessing),
                    ..JobPatch::default()
                },
            )
            .await?;

        let input = StageInput::Preprocessing {
            source_audio_ref: job.source_audio_ref.clone(),
        };
        self.dispatch_stage(&job.job_id, Stage::Preprocessing, input)
            .await?;
        tracing::info!(job_id, "job started");
        Ok(())
    }

    /// Handle a stage completion callback.
    ///
    /// Stale deliveries — current stage mismatch, result already recorded,
    /// or a terminal job — return [`AdvanceOutcome::Stale`] without mutating
    /// anything. That check is the idempotence mechanism for at-least-once
    /// delivery, not an error path.
    pub async fn advance(
        &self,
        job_id: &str,
        completed: Stage,
        output: StageOutput,
    ) -> Result<AdvanceOutcome, PipelineError> {
        let job = self.store.get(job_id).await?;
        if is_stale(&job, completed) {
            tracing::debug!(job_id, stage = %completed, "stale completion callback ignored");
            return Ok(AdvanceOutcome::Stale);
        }

        // Boundary validation: the payload must match the completed stage's
        // schema before anything is persisted.
        if output.stage() != completed {
            let message = format!("expected {completed} output, got {}", output.stage());
            return self.reject(job_id, completed, message).await;
        }
        if let Err(report) = output.validate() {
            let message = format!("invalid {completed} output: {report}");
            return self.reject(job_id, completed, message).await;
        }

        match output {
            StageOutput::StemSeparation(sep) => self.route_stem_separation(&job, sep).await,
            output => self.advance_to_next(&job, completed, output).await,
        }
    }

    /// Record a terminal stage failure. The dispatch layer calls this only
    /// after exhausting its retry budget; the coordinator never retries.
    /// Failing an already-terminal job is a no-op.
    pub async fn fail(
        &self,
        job_id: &str,
        stage: Stage,
        message: &str,
    ) -> Result<(), PipelineError> {
        let job = self.store.get(job_id).await?;
        if job.status.is_terminal() {
            tracing::warn!(job_id, stage = %stage, "failure reported for terminal job, ignoring");
            return Ok(());
        }

        let patch = JobPatch {
            status: Some(JobStatus::Error),
            error: Some(StageError {
                stage,
                message: message.to_string(),
            }),
            ..JobPatch::default()
        };
        match self.store.update(job_id, patch).await {
            Ok(_) => {}
            // Lost a race against another terminal transition; the job is
            // already settled.
            Err(StoreError::TerminalJob(_)) => {
                tracing::warn!(job_id, stage = %stage, "job reached terminal state concurrently");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        metrics::counter!("pipeline_jobs_failed", "stage" => stage.to_string()).increment(1);
        tracing::error!(job_id, stage = %stage, message, "job failed");
        Ok(())
    }

    /// Client polling contract for a job.
    pub async fn status_report(&self, job_id: &str) -> Result<StatusReport, PipelineError> {
        Ok(self.store.get(job_id).await?.status_report())
    }

    // ── Routing ──────────────────────────────────────────────────────

    async fn route_stem_separation(
        &self,
        job: &Job,
        sep: StemSeparationOutput,
    ) -> Result<AdvanceOutcome, PipelineError> {
        let sample_rate = match preprocessing_output(job) {
            Ok(pre) => pre.sample_rate,
            Err(message) => return self.reject(&job.job_id, Stage::StemSeparation, message).await,
        };

        let usable: Vec<_> = fanout::usable_stems(job, &sep.stems)
            .into_iter()
            .cloned()
            .collect();

        if usable.len() >= 2 {
            return match self.fanout.fan_out(job, &usable, sample_rate).await? {
                FanOutOutcome::Created(child_job_ids) => {
                    Ok(AdvanceOutcome::FannedOut { child_job_ids })
                }
                FanOutOutcome::Stale => Ok(AdvanceOutcome::Stale),
            };
        }

        // Zero or one usable stem: the same job continues, on the single
        // stem's audio or falling back to the normalized mix.
        let record = match usable.into_iter().next() {
            Some(stem) => {
                tracing::info!(job_id = %job.job_id, stem = %stem.stem_name, "continuing on single stem");
                StemSeparationOutput {
                    stems: vec![stem],
                    is_stem: true,
                }
            }
            None => {
                tracing::info!(job_id = %job.job_id, "no usable stems, falling back to normalized audio");
                StemSeparationOutput {
                    stems: Vec::new(),
                    is_stem: false,
                }
            }
        };
        self.advance_to_next(job, Stage::StemSeparation, StageOutput::StemSeparation(record))
            .await
    }

    async fn advance_to_next(
        &self,
        job: &Job,
        completed: Stage,
        output: StageOutput,
    ) -> Result<AdvanceOutcome, PipelineError> {
        let Some(next) = completed.next() else {
            return self.finish(&job.job_id, output).await;
        };

        let outcome = self
            .store
            .update_if_current(
                &job.job_id,
                completed,
                JobPatch {
                    current_stage: Some(next),
                    progress: Some(progress::checkpoint(completed)),
                    stage_result: Some((completed, StageRecord::Completed { output })),
                    ..JobPatch::default()
                },
            )
            .await?;
        let CasOutcome::Applied(mut job) = outcome else {
            tracing::debug!(job_id = %job.job_id, stage = %completed, "lost completion race, duplicate ignored");
            return Ok(AdvanceOutcome::Stale);
        };
        metrics::counter!("pipeline_stage_completed", "stage" => completed.to_string())
            .increment(1);

        // Skip predicate: hop straight over stem separation when the job
        // did not request it, forwarding the preprocessing output.
        let mut next = next;
        if next.skipped_for(&job.params) {
            job = self
                .store
                .update(
                    &job.job_id,
                    JobPatch {
                        current_stage: Some(Stage::FeatureExtraction),
                        progress: Some(progress::checkpoint(Stage::StemSeparation)),
                        stage_result: Some((Stage::StemSeparation, StageRecord::Skipped)),
                        ..JobPatch::default()
                    },
                )
                .await?;
            tracing::info!(job_id = %job.job_id, "stem separation skipped, forwarding normalized audio");
            next = Stage::FeatureExtraction;
        }

        let input = match build_input(&job, next) {
            Ok(input) => input,
            Err(message) => return self.reject(&job.job_id, next, message).await,
        };
        self.dispatch_stage(&job.job_id, next, input).await?;
        Ok(AdvanceOutcome::Advanced { next })
    }

    async fn finish(
        &self,
        job_id: &str,
        output: StageOutput,
    ) -> Result<AdvanceOutcome, PipelineError> {
        let outcome = self
            .store
            .update_if_current(
                job_id,
                Stage::OutputFormatting,
                JobPatch {
                    status: Some(JobStatus::Completed),
                    progress: Some(progress::checkpoint(Stage::OutputFormatting)),
                    completed_at: Some(Utc::now()),
                    stage_result: Some((Stage::OutputFormatting, StageRecord::Completed { output })),
                    ..JobPatch::default()
                },
            )
            .await?;

        match outcome {
            CasOutcome::Applied(_) => {
                metrics::counter!("pipeline_jobs_completed").increment(1);
                tracing::info!(job_id, "job completed");
                Ok(AdvanceOutcome::Completed)
            }
            CasOutcome::Stale(_) => Ok(AdvanceOutcome::Stale),
        }
    }

    async fn reject(
        &self,
        job_id: &str,
        stage: Stage,
        message: String,
    ) -> Result<AdvanceOutcome, PipelineError> {
        tracing::warn!(job_id, stage = %stage, message = %message, "stage output rejected");
        self.fail(job_id, stage, &message).await?;
        Ok(AdvanceOutcome::Failed { stage, message })
    }

    async fn dispatch_stage(
        &self,
        job_id: &str,
        stage: Stage,
        input: StageInput,
    ) -> Result<(), PipelineError> {
        self.dispatcher
            .dispatch(StageTask {
                job_id: job_id.to_string(),
                stage,
                input,
                deadline: self.stage_deadline,
            })
            .await?;
        tracing::debug!(job_id, stage = %stage, "stage dispatched");
        Ok(())
    }
}

fn is_stale(job: &Job, completed: Stage) -> bool {
    job.status.is_terminal()
        || job.current_stage != Some(completed)
        || job.stage_results.contains_key(&completed)
}

/// Build the next stage's input from the job document. A missing or
/// malformed prior result is a validation failure for that stage.
fn build_input(job: &Job, stage: Stage) -> Result<StageInput, String> {
    match stage {
        Stage::Preprocessing => Ok(StageInput::Preprocessing {
            source_audio_ref: job.source_audio_ref.clone(),
        }),
        Stage::StemSeparation => {
            let pre = preprocessing_output(job)?;
            Ok(StageInput::StemSeparation {
                normalized_audio_ref: pre.normalized_audio_ref.clone(),
                sample_rate: pre.sample_rate,
            })
        }
        Stage::FeatureExtraction => {
            let pre = preprocessing_output(job)?;
            let audio_ref = if job.parent_job_id.is_some() {
                // Child jobs transcribe their own stem artifact.
                job.source_audio_ref.clone()
            } else {
                match job.stage_results.get(&Stage::StemSeparation) {
                    Some(StageRecord::Completed {
                        output: StageOutput::StemSeparation(sep),
                    }) => sep
                        .stems
                        .first()
                        .map(|s| s.stem_audio_ref.clone())
                        .unwrap_or_else(|| pre.normalized_audio_ref.clone()),
                    Some(StageRecord::Skipped) => pre.normalized_audio_ref.clone(),
                    _ => return Err("missing stem separation result".to_string()),
                }
            };
            Ok(StageInput::FeatureExtraction {
                audio_ref,
                sample_rate: pre.sample_rate,
            })
        }
        Stage::NoteMapping => {
            let features = feature_output(job)?;
            let tuning = job
                .params
                .tuning
                .clone()
                .or_else(|| job.params.instrument_type.default_tuning().map(str::to_string));
            Ok(StageInput::NoteMapping {
                features: features.clone(),
                instrument_type: job.params.instrument_type,
                tuning,
            })
        }
        Stage::OutputFormatting => {
            let features = feature_output(job)?;
            let notes = note_mapping_output(job)?;
            Ok(StageInput::OutputFormatting {
                notes: notes.notes.clone(),
                tempo: features.tempo,
                key: features.key.clone(),
                instrument_type: job.params.instrument_type,
            })
        }
    }
}

fn preprocessing_output(job: &Job) -> Result<&PreprocessingOutput, String> {
    match job.stage_results.get(&Stage::Preprocessing) {
        Some(StageRecord::Completed {
            output: StageOutput::Preprocessing(out),
        }) => Ok(out),
        _ => Err("missing preprocessing result".to_string()),
    }
}

fn feature_output(job: &Job) -> Result<&FeatureExtractionOutput, String> {
    match job.stage_results.get(&Stage::FeatureExtraction) {
        Some(StageRecord::Completed {
            output: StageOutput::FeatureExtraction(out),
        }) => Ok(out),
        _ => Err("missing feature extraction result".to_string()),
    }
}

fn note_mapping_output(job: &Job) -> Result<&NoteMappingOutput, String> {
    match job.stage_results.get(&Stage::NoteMapping) {
        Some(StageRecord::Completed {
            output: StageOutput::NoteMapping(out),
        }) => Ok(out),
        _ => Err("missing note mapping result".to_string()),
    }
}
