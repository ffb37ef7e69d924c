//! Core types for duet-daemon.
//!
//! - [`DialogueTurn`]: one parsed utterance with its speaker
//! - [`VoiceProfile`] / [`AudioSegment`]: per-speaker voice configuration and audio
//! - [`GenerationRequest`]: the unit of work submitted to the coordinator
//! - [`GenerationJob`]: a queued request with status tracking

mod dialogue;
mod job;
mod request;
mod voice;

pub use dialogue::{distinct_speakers, DialogueTurn};
pub use job::{compute_run_id, DialogueInput, GenerationJob, JobPriority, JobStatus};
pub use request::{
    EmbeddingTensor, GenerationParams, GenerationRequest, Resolution, FPS, MAX_FRAME_COUNT,
    MAX_SAMPLE_STEPS, MAX_SIDE, MIN_FRAME_COUNT, MIN_SIDE, SPATIAL_STRIDE, TEMPORAL_STRIDE,
};
pub use voice::{AudioSegment, VoiceProfile};
