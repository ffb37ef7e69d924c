//! Runtime configuration.
//!
//! Every rank must run with identical coordinator options; the launcher
//! reads them once (environment, then an optional JSON file, then CLI flags)
//! and rank 0 broadcasts the per-request parameters with each command.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::scheduler::SchedulerType;
use crate::types::{GenerationParams, Resolution};

/// Parallel layout and parameter placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Sequence-parallel (Ulysses) degree.
    pub ulysses_size: usize,
    /// Ring-attention degree.
    pub ring_size: usize,
    /// Shard the text encoder's parameters across ranks.
    pub shard_text_encoder: bool,
    /// Shard the diffusion transformer's parameters across ranks.
    pub shard_transformer: bool,
    /// Parameter elements kept whole on every rank (0 = fully sharded).
    pub persistent_param_count: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            ulysses_size: 1,
            ring_size: 1,
            shard_text_encoder: true,
            shard_transformer: true,
            persistent_param_count: 0,
        }
    }
}

/// Bounded waits of the process group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Rendezvous deadline at startup.
    pub rendezvous_ms: u64,
    /// Barriers, broadcasts and exchanges.
    pub collective_ms: u64,
    /// Final gather of latent shards on rank 0.
    pub gather_ms: u64,
}

impl TimeoutConfig {
    pub fn rendezvous(&self) -> Duration {
        Duration::from_millis(self.rendezvous_ms)
    }

    pub fn collective(&self) -> Duration {
        Duration::from_millis(self.collective_ms)
    }

    pub fn gather(&self) -> Duration {
        Duration::from_millis(self.gather_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rendezvous_ms: 60_000,
            collective_ms: 120_000,
            gather_ms: 120_000,
        }
    }
}

/// Shape of the reference text encoder and diffusion transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DitConfig {
    /// Transformer width.
    pub hidden_dim: usize,
    /// Attention heads; must be divisible by the Ulysses degree.
    pub num_heads: usize,
    /// Channels per latent token.
    pub latent_channels: usize,
    /// Hashed-token vocabulary of the text encoder.
    pub text_vocab: usize,
    /// Text embedding width.
    pub text_dim: usize,
    /// Audio embedding width per video frame.
    pub audio_dim: usize,
    /// Canvas pixels per latent token along each axis.
    pub patch_size: u32,
    /// Seed the checkpoint is initialized from; identical on every rank.
    pub weight_seed: u64,
}

impl Default for DitConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 32,
            num_heads: 8,
            latent_channels: 4,
            text_vocab: 4096,
            text_dim: 16,
            audio_dim: 16,
            patch_size: 80,
            weight_seed: 0x5eed_d1e7,
        }
    }
}

/// Options consumed by the inference coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub parallel: ParallelConfig,
    /// Parameters used when a request does not override them.
    pub sampling: GenerationParams,
    pub timeouts: TimeoutConfig,
    pub model: DitConfig,
}

/// Process launch environment (torchrun convention).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl LaunchConfig {
    /// Rendezvous address as `host:port`.
    pub fn rendezvous_addr(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
        }
    }
}

/// External text-to-speech program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Command template with `{text}`, `{voice}` and `{output}` placeholders.
    /// None selects the built-in tone synthesizer.
    pub command: Option<String>,
    /// Sample rate of synthesized speech.
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            command: None,
            sample_rate: 24_000,
        }
    }
}

/// Runtime configuration for one rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub coordinator: CoordinatorConfig,
    pub launch: LaunchConfig,
    pub tts: TtsConfig,
    /// Path to the ffmpeg executable.
    pub ffmpeg: Option<PathBuf>,
    /// Directory for finished videos.
    pub output_dir: Option<PathBuf>,
    /// Directory for intermediate audio.
    pub work_dir: Option<PathBuf>,
    /// Use the tone synthesizer and small defaults for quick local runs.
    pub debug: bool,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Creates a RuntimeConfig from environment variables.
    ///
    /// Reads:
    /// - `RANK`, `WORLD_SIZE`, `MASTER_ADDR`, `MASTER_PORT` - launch environment
    /// - `DUET_ULYSSES_SIZE`, `DUET_RING_SIZE` - parallel layout
    /// - `DUET_PERSISTENT_PARAMS` - elements kept resident per rank
    /// - `DUET_SAMPLE_STEPS`, `DUET_FRAME_COUNT`, `DUET_SEED`, `DUET_SIZE`
    /// - `DUET_TEXT_GUIDANCE`, `DUET_AUDIO_GUIDANCE`, `DUET_SCHEDULER`
    /// - `DUET_TTS_COMMAND`, `DUET_FFMPEG`, `DUET_OUTPUT_DIR`, `DUET_WORK_DIR`
    /// - `DUET_DEBUG` - debug mode
    ///
    /// Unset or unparseable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlays environment variables onto this configuration.
    pub fn apply_env(&mut self) {
        if let Some(rank) = env_parse("RANK") {
            self.launch.rank = rank;
        }
        if let Some(world) = env_parse::<usize>("WORLD_SIZE") {
            if world > 0 {
                self.launch.world_size = world;
            }
        }
        if let Ok(addr) = std::env::var("MASTER_ADDR") {
            self.launch.master_addr = addr;
        }
        if let Some(port) = env_parse("MASTER_PORT") {
            self.launch.master_port = port;
        }

        let parallel = &mut self.coordinator.parallel;
        if let Some(n) = env_parse::<usize>("DUET_ULYSSES_SIZE") {
            if n > 0 {
                parallel.ulysses_size = n;
            }
        }
        if let Some(n) = env_parse::<usize>("DUET_RING_SIZE") {
            if n > 0 {
                parallel.ring_size = n;
            }
        }
        if let Some(n) = env_parse("DUET_PERSISTENT_PARAMS") {
            parallel.persistent_param_count = n;
        }
        if let Some(b) = env_flag("DUET_SHARD_TEXT_ENCODER") {
            parallel.shard_text_encoder = b;
        }
        if let Some(b) = env_flag("DUET_SHARD_TRANSFORMER") {
            parallel.shard_transformer = b;
        }

        let sampling = &mut self.coordinator.sampling;
        if let Some(n) = env_parse("DUET_SAMPLE_STEPS") {
            sampling.sample_steps = n;
        }
        if let Some(n) = env_parse("DUET_FRAME_COUNT") {
            sampling.frame_count = n;
        }
        if let Some(n) = env_parse("DUET_SEED") {
            sampling.seed = n;
        }
        if let Some(res) = std::env::var("DUET_SIZE").ok().and_then(|s| Resolution::parse(&s)) {
            sampling.resolution = res;
        }
        if let Some(g) = env_parse("DUET_TEXT_GUIDANCE") {
            sampling.text_guidance_scale = g;
        }
        if let Some(g) = env_parse("DUET_AUDIO_GUIDANCE") {
            sampling.audio_guidance_scale = g;
        }
        if let Some(s) = std::env::var("DUET_SCHEDULER").ok().and_then(|s| SchedulerType::parse(&s)) {
            sampling.scheduler = s;
        }

        if let Ok(cmd) = std::env::var("DUET_TTS_COMMAND") {
            if !cmd.trim().is_empty() {
                self.tts.command = Some(cmd);
            }
        }
        if let Ok(path) = std::env::var("DUET_FFMPEG") {
            self.ffmpeg = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("DUET_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("DUET_WORK_DIR") {
            self.work_dir = Some(PathBuf::from(path));
        }
        if let Some(b) = env_flag("DUET_DEBUG") {
            self.debug = b;
        }
    }

    /// Returns the effective output directory, using platform defaults if not specified.
    pub fn effective_output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(default_output_dir)
    }

    /// Returns the effective work directory, using platform defaults if not specified.
    pub fn effective_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(default_work_dir)
    }

    /// Returns the ffmpeg executable to run.
    pub fn effective_ffmpeg(&self) -> PathBuf {
        self.ffmpeg.clone().unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }

    /// Validates the configuration.
    ///
    /// Returns an error message if validation fails, None otherwise. The
    /// ulysses * ring == world_size check happens when the model is sharded.
    pub fn validate(&self) -> Option<String> {
        let parallel = &self.coordinator.parallel;
        if parallel.ulysses_size == 0 || parallel.ring_size == 0 {
            return Some("ulysses_size and ring_size must be > 0".to_string());
        }
        if self.launch.world_size == 0 {
            return Some("world_size must be > 0".to_string());
        }
        if self.launch.rank >= self.launch.world_size {
            return Some(format!(
                "rank {} outside world of {}",
                self.launch.rank, self.launch.world_size
            ));
        }

        let t = &self.coordinator.timeouts;
        if t.rendezvous_ms == 0 || t.collective_ms == 0 || t.gather_ms == 0 {
            return Some("timeouts must be > 0".to_string());
        }

        let m = &self.coordinator.model;
        if m.num_heads == 0 || m.hidden_dim % m.num_heads != 0 {
            return Some(format!(
                "hidden_dim {} must be a multiple of num_heads {}",
                m.hidden_dim, m.num_heads
            ));
        }
        if m.latent_channels == 0 || m.text_dim == 0 || m.audio_dim == 0 || m.text_vocab == 0 {
            return Some("model dimensions must be > 0".to_string());
        }
        if m.patch_size == 0 {
            return Some("patch_size must be > 0".to_string());
        }

        if self.tts.sample_rate == 0 {
            return Some("tts sample_rate must be > 0".to_string());
        }

        self.coordinator.sampling.validate().err().map(|e| e.message)
    }
}

/// Returns the platform-specific default output directory.
///
/// - Linux: ~/.local/share/duet-daemon/videos
/// - macOS: ~/Library/Application Support/duet-daemon/videos
fn default_output_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "duet-daemon") {
        proj_dirs.data_dir().join("videos")
    } else {
        PathBuf::from("./videos")
    }
}

/// Returns the platform-specific default work directory.
fn default_work_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "duet-daemon") {
        proj_dirs.cache_dir().join("work")
    } else {
        PathBuf::from("./work")
    }
}
