use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::payload::StageRecord;
use crate::models::stage::Stage;

/// Status of a transcription job.
///
/// Transitions are PENDING → PROCESSING → {COMPLETED | ERROR}; the two
/// terminal statuses are immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Instruments the note mapper can target. Fan-out children derive theirs
/// from the separated stem's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstrumentType {
    Bass,
    Guitar,
    Drums,
    Piano,
    Vocals,
}

impl InstrumentType {
    /// Standard tuning applied when the request does not name one.
    pub fn default_tuning(self) -> Option<&'static str> {
        match self {
            InstrumentType::Bass => Some("E A D G"),
            InstrumentType::Guitar => Some("E A D G B E"),
            InstrumentType::Drums | InstrumentType::Piano | InstrumentType::Vocals => None,
        }
    }

    /// The instrument a separated stem maps to. Guitars land in the
    /// separator's "other" stem, so unrecognized stem names map to guitar.
    pub fn from_stem(stem_name: &str) -> InstrumentType {
        match stem_name {
            "bass" => InstrumentType::Bass,
            "drums" => InstrumentType::Drums,
            "piano" => InstrumentType::Piano,
            "vocals" => InstrumentType::Vocals,
            _ => InstrumentType::Guitar,
        }
    }
}

/// Per-job transcription parameters captured at upload time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionParams {
    pub instrument_type: InstrumentType,

    /// Tuning override; the instrument's standard tuning applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuning: Option<String>,

    /// Input to the stem separation skip predicate.
    pub use_stem_separation: bool,

    /// Vocals stems are dropped from fan-out unless explicitly requested.
    pub include_vocals: bool,
}

impl Default for TranscriptionParams {
    fn default() -> Self {
        Self {
            instrument_type: InstrumentType::Bass,
            tuning: None,
            use_stem_separation: false,
            include_vocals: false,
        }
    }
}

/// Terminal failure details: the stage that failed and its message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

/// A transcription job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,

    /// The stage currently dispatched or just completed. Never regresses
    /// along pipeline order once set.
    pub current_stage: Option<Stage>,

    /// 0-100, monotonically non-decreasing.
    pub progress: u8,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set only when the job reaches COMPLETED.
    pub completed_at: Option<DateTime<Utc>>,

    pub error: Option<StageError>,

    /// Set on jobs created by fan-out from a stem separation result.
    pub parent_job_id: Option<String>,

    /// Recorded stage outcomes, append-only and write-once per stage.
    pub stage_results: BTreeMap<Stage, StageRecord>,

    /// The source audio artifact; for a child job, the stem's audio.
    pub source_audio_ref: String,

    pub params: TranscriptionParams,
}

impl Job {
    /// New top-level job in PENDING, awaiting `start()`.
    pub fn new(source_audio_ref: impl Into<String>, params: TranscriptionParams) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            current_stage: None,
            progress: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            parent_job_id: None,
            stage_results: BTreeMap::new(),
            source_audio_ref: source_audio_ref.into(),
            params,
        }
    }

    /// Snapshot for the client polling contract.
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            job_id: self.job_id.clone(),
            status: self.status,
            current_stage: self.current_stage,
            progress: self.progress,
            error: self.error.clone(),
        }
    }
}

/// The externally visible slice of a job, returned to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}
