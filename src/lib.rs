//! duet-daemon: two-speaker talking-head video generation.
//!
//! A dialogue script and two portraits go through speech synthesis, audio
//! embedding and frame compositing, then a diffusion transformer denoises the
//! video latent across a process group using sequence parallelism (Ulysses
//! and ring) with fully sharded parameters. Rank 0 gathers the latent,
//! decodes frames and muxes the video.
//!
//! # Modules
//!
//! - [`types`]: Core data types (DialogueTurn, GenerationRequest, GenerationJob)
//! - [`config`]: Runtime configuration (RuntimeConfig, CoordinatorConfig)
//! - [`error`]: Error types and codes (TalkError, ErrorCode)
//! - [`dist`]: Transports, process group, sharding and the coordinators
//! - [`models`]: Text encoder, diffusion transformer, guidance and schedulers
//! - [`generation`]: The end-to-end pipeline and the job queue
//!
//! # Example
//!
//! ```rust,ignore
//! use duet_daemon::{
//!     config::RuntimeConfig,
//!     dist::SingleDeviceCoordinator,
//!     generation::Pipeline,
//!     types::{DialogueInput, VoiceProfile},
//! };
//!
//! let config = RuntimeConfig::from_env();
//! let coordinator = SingleDeviceCoordinator::new(config.coordinator.clone())?;
//! let mut pipeline = Pipeline::from_config(&config, Box::new(coordinator))?;
//!
//! let input = DialogueInput {
//!     script: "(s1) 你好 (s2) 你好呀".to_string(),
//!     portrait1: "left.png".into(),
//!     portrait2: "right.png".into(),
//!     voices: vec![VoiceProfile::new(1, "alice", 24000), VoiceProfile::new(2, "bob", 24000)],
//!     prompt: "two friends chatting in a cafe".to_string(),
//!     params: config.coordinator.sampling.clone(),
//!     output_path: "talk.mp4".into(),
//! };
//! let output = pipeline.run(&input)?;
//! ```

pub mod audio;
pub mod cli;
pub mod config;
pub mod dist;
pub mod error;
pub mod frame;
pub mod generation;
pub mod models;
pub mod rpc;
pub mod script;
pub mod types;
pub mod video;

// Re-export commonly used types at crate root for convenience
pub use config::{CoordinatorConfig, RuntimeConfig};
pub use error::{ErrorCode, Result, TalkError};
pub use types::{
    DialogueInput, DialogueTurn, GenerationJob, GenerationParams, GenerationRequest, JobPriority,
    JobStatus,
};
