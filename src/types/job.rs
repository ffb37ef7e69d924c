//! GenerationJob type for tracking video generation requests.
//!
//! A job carries one dialogue video request from submission until the queue
//! worker picks it up; the outcome is reported as a `JobResult`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::request::GenerationParams;
use super::voice::VoiceProfile;

/// Priority level for generation jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Normal priority - processed in FIFO order.
    #[default]
    Normal,
    /// High priority - processed before normal priority jobs.
    High,
}

/// Where a job is before it has an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet in the queue.
    #[default]
    Pending,
    /// Waiting in the queue.
    Queued,
    /// Pipeline running.
    Generating,
}

/// Everything a caller submits for one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueInput {
    /// Raw dialogue script in any supported format.
    pub script: String,
    /// Portrait placed on the left (speaker 1).
    pub portrait1: PathBuf,
    /// Portrait placed on the right (speaker 2).
    pub portrait2: PathBuf,
    /// One voice per speaker.
    pub voices: Vec<VoiceProfile>,
    /// Scene description.
    #[serde(default)]
    pub prompt: String,
    /// Numeric parameters.
    #[serde(default)]
    pub params: GenerationParams,
    /// Final video path.
    pub output_path: PathBuf,
}

impl DialogueInput {
    /// Looks up the voice configured for a speaker.
    pub fn voice_for(&self, speaker_id: u8) -> Option<&VoiceProfile> {
        self.voices.iter().find(|v| v.speaker_id == speaker_id)
    }
}

/// A video generation request on its way through the queue.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    /// Unique job identifier.
    pub job_id: String,

    /// Deterministic identifier of the request content.
    pub run_id: String,

    /// What to generate.
    pub input: DialogueInput,

    /// Queue priority for this job.
    pub priority: JobPriority,

    /// Current job state.
    pub status: JobStatus,

    created_at: Instant,
    started_at: Option<Instant>,
}

impl GenerationJob {
    /// Creates a new pending GenerationJob.
    pub fn new(input: DialogueInput, priority: JobPriority) -> Self {
        Self {
            job_id: generate_job_id(),
            run_id: compute_run_id(&input),
            input,
            priority,
            status: JobStatus::Pending,
            created_at: Instant::now(),
            started_at: None,
        }
    }

    pub fn set_queued(&mut self) {
        self.status = JobStatus::Queued;
    }

    pub fn set_generating(&mut self) {
        self.status = JobStatus::Generating;
        self.started_at = Some(Instant::now());
    }

    /// Time spent waiting before generation started, or so far if it has not.
    pub fn queue_wait(&self) -> Duration {
        match self.started_at {
            Some(started) => started.duration_since(self.created_at),
            None => self.created_at.elapsed(),
        }
    }
}

/// Computes the run id: first 16 hex chars of SHA-256 over the request content.
///
/// The output path is excluded so the same request written elsewhere keeps
/// its id.
pub fn compute_run_id(input: &DialogueInput) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.script.as_bytes());
    hasher.update(b"\0");
    hasher.update(input.portrait1.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(input.portrait2.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    for voice in &input.voices {
        hasher.update(format!("{}:{}:{}", voice.speaker_id, voice.voice_key, voice.sample_rate));
        hasher.update(b"\0");
    }
    hasher.update(input.prompt.as_bytes());
    hasher.update(b"\0");
    let p = &input.params;
    hasher.update(format!(
        "{}:{}:{}:{}:{}:{}:{}:{:?}",
        p.sample_steps,
        p.frame_count,
        p.resolution,
        p.text_guidance_scale,
        p.audio_guidance_scale,
        p.seed,
        p.sample_shift,
        p.scheduler
    ));
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn generate_job_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    let h = hex::encode(bytes);
    format!("{}-{}-{}-{}-{}", &h[..8], &h[8..12], &h[12..16], &h[16..20], &h[20..])
}
