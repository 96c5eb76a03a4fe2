use crate::models::stage::Stage;

/// Fixed progress checkpoint reached when a stage completes. Child jobs
/// start at the stem separation checkpoint; their progress is independent
/// of the parent's.
pub fn checkpoint(stage: Stage) -> u8 {
    match stage {
        Stage::Preprocessing => 20,
        Stage::StemSeparation => 40,
        Stage::FeatureExtraction => 60,
        Stage::NoteMapping => 80,
        Stage::OutputFormatting => 100,
    }
}
