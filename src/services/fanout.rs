use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::models::job::{InstrumentType, Job, JobStatus};
use crate::models::payload::{StageInput, StageRecord, StemInfo};
use crate::models::stage::Stage;
use crate::services::coordinator::PipelineError;
use crate::services::dispatch::{StageDispatcher, StageTask};
use crate::services::progress;
use crate::store::{CasOutcome, JobPatch, JobStore, StoreError};

const VOCALS_STEM: &str = "vocals";

/// Deterministic child id. Top-level ids are UUIDs, so the
/// `{parent}_{stem}` form cannot collide with them.
pub fn child_job_id(parent_job_id: &str, stem_name: &str) -> String {
    format!("{parent_job_id}_{stem_name}")
}

/// Stems eligible for fan-out: a vocals stem is dropped unless the job
/// explicitly asked for it.
pub fn usable_stems<'a>(job: &Job, stems: &'a [StemInfo]) -> Vec<&'a StemInfo> {
    stems
        .iter()
        .filter(|s| s.stem_name != VOCALS_STEM || job.params.include_vocals)
        .collect()
}

/// Result of a fan-out request.
#[derive(Debug, Clone)]
pub enum FanOutOutcome {
    /// Children exist and were dispatched; carries their ids in stem order.
    Created(Vec<String>),
    /// Another delivery already recorded the fan-out; nothing dispatched.
    Stale,
}

/// Creates independent child jobs from a stem separation result.
///
/// The parent does not block on its children: its stem separation record
/// becomes a `fanned_out` bookkeeping entry and it stops advancing, while
/// each child runs the remaining stages under its own job id.
pub struct FanOutController {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn StageDispatcher>,
    stage_deadline: Duration,
}

impl FanOutController {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn StageDispatcher>,
        stage_deadline: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            stage_deadline,
        }
    }

    /// Create one child job per usable stem and dispatch each into feature
    /// extraction. Idempotent under duplicate delivery: existing children
    /// are reused and the parent record is guarded by compare-and-set.
    pub async fn fan_out(
        &self,
        parent: &Job,
        stems: &[StemInfo],
        sample_rate: u32,
    ) -> Result<FanOutOutcome, PipelineError> {
        let mut child_job_ids = Vec::with_capacity(stems.len());
        for stem in stems {
            let child = child_job(parent, stem);
            let child_id = child.job_id.clone();
            match self.store.create(child).await {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(_)) => {
                    tracing::debug!(
                        parent_job_id = %parent.job_id,
                        child_job_id = %child_id,
                        "child job already exists, reusing"
                    );
                }
                Err(e) => return Err(e.into()),
            }
            child_job_ids.push(child_id);
        }

        let outcome = self
            .store
            .update_if_current(
                &parent.job_id,
                Stage::StemSeparation,
                JobPatch {
                    progress: Some(progress::checkpoint(Stage::StemSeparation)),
                    stage_result: Some((
                        Stage::StemSeparation,
                        StageRecord::FannedOut {
                            child_job_ids: child_job_ids.clone(),
                        },
                    )),
                    ..JobPatch::default()
                },
            )
            .await?;

        if let CasOutcome::Stale(_) = outcome {
            tracing::debug!(parent_job_id = %parent.job_id, "fan-out already recorded, ignoring duplicate");
            return Ok(FanOutOutcome::Stale);
        }

        // The CAS winner dispatches every child, created here or by an
        // earlier delivery that died before dispatching.
        for stem in stems {
            let child_id = child_job_id(&parent.job_id, &stem.stem_name);
            self.dispatcher
                .dispatch(StageTask {
                    job_id: child_id.clone(),
                    stage: Stage::child_entry(),
                    input: StageInput::FeatureExtraction {
                        audio_ref: stem.stem_audio_ref.clone(),
                        sample_rate,
                    },
                    deadline: self.stage_deadline,
                })
                .await?;
            tracing::info!(
                parent_job_id = %parent.job_id,
                child_job_id = %child_id,
                stem = %stem.stem_name,
                "dispatched child job"
            );
        }
        metrics::counter!("pipeline_children_created").increment(child_job_ids.len() as u64);

        Ok(FanOutOutcome::Created(child_job_ids))
    }
}

fn child_job(parent: &Job, stem: &StemInfo) -> Job {
    let now = Utc::now();

    // Children carry the parent's preprocessing record so the feature
    // extraction input can be built uniformly.
    let mut stage_results = BTreeMap::new();
    if let Some(pre) = parent.stage_results.get(&Stage::Preprocessing) {
        stage_results.insert(Stage::Preprocessing, pre.clone());
    }

    let mut params = parent.params.clone();
    params.instrument_type = InstrumentType::from_stem(&stem.stem_name);
    params.tuning = None;
    params.use_stem_separation = false;

    Job {
        job_id: child_job_id(&parent.job_id, &stem.stem_name),
        status: JobStatus::Processing,
        current_stage: Some(Stage::child_entry()),
        progress: progress::checkpoint(Stage::StemSeparation),
        created_at: now,
        updated_at: now,
        completed_at: None,
        error: None,
        parent_job_id: Some(parent.job_id.clone()),
        stage_results,
        source_audio_ref: stem.stem_audio_ref.clone(),
        params,
    }
}
