//! Staged pipeline coordinator for audio-to-score transcription.
//!
//! Converts an uploaded audio recording into notation/tablature through five
//! ordered, asynchronously executed stages: preprocessing, optional stem
//! separation (which may fan out into one child job per separated stem),
//! feature extraction, note mapping, and output formatting.
//!
//! This crate owns the job state machine: stage sequencing, persisted
//! intermediate results, per-stage failure, and idempotent handling of
//! at-least-once completion callbacks. The DSP/ML algorithms, rendering,
//! HTTP surface, and concrete storage/broker technology are external
//! collaborators behind the `services::worker::StageExecutor`,
//! `store::JobStore`, and `services::dispatch::StageDispatcher` seams.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;
pub mod store;
