//! Dialogue video generation: the staged pipeline and the job queue that
//! serializes requests in front of it.

pub mod pipeline;
pub mod queue;

pub use pipeline::{
    staging_path, write_atomically, DialogueAudio, Pipeline, PipelineOutput, PipelineStage,
};
pub use queue::{run_job, JobResult, QueueFullError, QueueProcessor, MAX_QUEUE_SIZE};
