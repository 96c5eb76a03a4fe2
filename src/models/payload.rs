use std::collections::BTreeMap;

use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::job::InstrumentType;
use crate::models::stage::Stage;

/// Output of audio preprocessing: a normalized artifact plus basic signal info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PreprocessingOutput {
    #[garde(length(min = 1))]
    pub normalized_audio_ref: String,

    #[garde(range(min = 8_000, max = 192_000))]
    pub sample_rate: u32,

    /// Duration of the normalized audio in seconds.
    #[garde(range(min = 0.0))]
    pub duration: f64,
}

/// One isolated instrument track produced by stem separation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StemInfo {
    #[garde(length(min = 1, max = 64))]
    pub stem_name: String,

    #[garde(length(min = 1))]
    pub stem_audio_ref: String,
}

/// Output of stem separation. `is_stem` is false when the pipeline continues
/// on the original normalized audio instead of an isolated stem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StemSeparationOutput {
    #[garde(dive)]
    pub stems: Vec<StemInfo>,

    #[garde(skip)]
    pub is_stem: bool,
}

/// Frame-aligned pitch estimates over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchTrack {
    pub time: Vec<f64>,
    pub freq: Vec<f64>,
    pub confidence: Vec<f64>,
}

fn pitch_track_lengths(track: &PitchTrack, _ctx: &()) -> garde::Result {
    if track.freq.len() != track.time.len() || track.confidence.len() != track.time.len() {
        return Err(garde::Error::new(
            "pitch track time/freq/confidence arrays must have equal lengths",
        ));
    }
    Ok(())
}

/// Musical features detected in one audio artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct FeatureExtractionOutput {
    /// Note onset times in seconds.
    #[garde(skip)]
    pub onsets: Vec<f64>,

    #[garde(custom(pitch_track_lengths))]
    pub pitch_track: PitchTrack,

    #[garde(range(min = 0.0, max = 400.0))]
    pub tempo: f64,

    #[garde(length(min = 1, max = 16))]
    pub key: String,

    #[garde(skip)]
    pub is_polyphonic: bool,
}

/// One transcribed note. String and fret are present only for fretted
/// instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MappedNote {
    #[garde(range(min = 0.0))]
    pub onset: f64,

    #[garde(range(min = 0.0))]
    pub duration: f64,

    /// Scientific pitch name, e.g. "E1".
    #[garde(length(min = 1, max = 8))]
    pub pitch: String,

    #[garde(range(max = 127))]
    pub midi: u8,

    #[garde(inner(range(max = 7)))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string: Option<u8>,

    #[garde(inner(range(max = 24)))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fret: Option<u8>,
}

/// Output of note mapping: the transcription as an ordered note list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct NoteMappingOutput {
    #[garde(dive)]
    pub notes: Vec<MappedNote>,
}

/// Rendered artifact formats.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputFormat {
    #[serde(rename = "musicxml")]
    #[strum(serialize = "musicxml")]
    MusicXml,
    Midi,
    Pdf,
    Tablature,
}

fn at_least_one_artifact(paths: &BTreeMap<OutputFormat, String>, _ctx: &()) -> garde::Result {
    if paths.is_empty() {
        return Err(garde::Error::new("at least one output artifact is required"));
    }
    Ok(())
}

/// Output of the final stage: rendered artifact references per format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct OutputFormattingOutput {
    #[garde(custom(at_least_one_artifact))]
    pub artifact_paths: BTreeMap<OutputFormat, String>,
}

/// Typed input handed to a stage executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageInput {
    Preprocessing {
        source_audio_ref: String,
    },
    StemSeparation {
        normalized_audio_ref: String,
        sample_rate: u32,
    },
    FeatureExtraction {
        audio_ref: String,
        sample_rate: u32,
    },
    NoteMapping {
        features: FeatureExtractionOutput,
        instrument_type: InstrumentType,
        tuning: Option<String>,
    },
    OutputFormatting {
        notes: Vec<MappedNote>,
        tempo: f64,
        key: String,
        instrument_type: InstrumentType,
    },
}

impl StageInput {
    /// The stage this input belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            StageInput::Preprocessing { .. } => Stage::Preprocessing,
            StageInput::StemSeparation { .. } => Stage::StemSeparation,
            StageInput::FeatureExtraction { .. } => Stage::FeatureExtraction,
            StageInput::NoteMapping { .. } => Stage::NoteMapping,
            StageInput::OutputFormatting { .. } => Stage::OutputFormatting,
        }
    }
}

/// Tagged union of the per-stage output payloads, validated at the stage
/// boundary before anything is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "output", rename_all = "snake_case")]
pub enum StageOutput {
    Preprocessing(PreprocessingOutput),
    StemSeparation(StemSeparationOutput),
    FeatureExtraction(FeatureExtractionOutput),
    NoteMapping(NoteMappingOutput),
    OutputFormatting(OutputFormattingOutput),
}

impl StageOutput {
    /// The stage this payload belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Preprocessing(_) => Stage::Preprocessing,
            StageOutput::StemSeparation(_) => Stage::StemSeparation,
            StageOutput::FeatureExtraction(_) => Stage::FeatureExtraction,
            StageOutput::NoteMapping(_) => Stage::NoteMapping,
            StageOutput::OutputFormatting(_) => Stage::OutputFormatting,
        }
    }

    /// Validate the payload fields against the stage schema.
    pub fn validate(&self) -> Result<(), garde::Report> {
        match self {
            StageOutput::Preprocessing(out) => out.validate(),
            StageOutput::StemSeparation(out) => out.validate(),
            StageOutput::FeatureExtraction(out) => out.validate(),
            StageOutput::NoteMapping(out) => out.validate(),
            StageOutput::OutputFormatting(out) => out.validate(),
        }
    }
}

/// A recorded stage outcome on the job document. Entries are write-once:
/// a later stage never overwrites an earlier stage's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageRecord {
    /// The stage ran and produced its output payload.
    Completed { output: StageOutput },
    /// Stem separation was bypassed by the skip predicate; its input was
    /// forwarded unchanged.
    Skipped,
    /// Stem separation branched into independent child jobs. The parent
    /// stops advancing once this bookkeeping record is written.
    FannedOut { child_job_ids: Vec<String> },
}
