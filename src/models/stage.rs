use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::models::job::TranscriptionParams;

/// The five pipeline stages. Declaration order is execution order.
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
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Preprocessing,
    StemSeparation,
    FeatureExtraction,
    NoteMapping,
    OutputFormatting,
}

impl Stage {
    /// The stage dispatched after this one completes, or `None` after the final stage.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Preprocessing => Some(Stage::StemSeparation),
            Stage::StemSeparation => Some(Stage::FeatureExtraction),
            Stage::FeatureExtraction => Some(Stage::NoteMapping),
            Stage::NoteMapping => Some(Stage::OutputFormatting),
            Stage::OutputFormatting => None,
        }
    }

    /// Stage at which separated-stem child jobs enter the pipeline.
    /// Children never re-enter stem separation.
    pub fn child_entry() -> Stage {
        Stage::FeatureExtraction
    }

    /// Skip predicate: stem separation is bypassed when the job did not
    /// request it, forwarding its input unchanged to the next stage.
    pub fn skipped_for(self, params: &TranscriptionParams) -> bool {
        self == Stage::StemSeparation && !params.use_stem_separation
    }
}
