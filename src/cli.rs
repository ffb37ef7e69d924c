//! Command-line interface.
//!
//! One binary covers every role: a one-shot generation, the JSON-RPC job
//! server, an in-process rank group, and follower ranks started by a
//! launcher that sets `RANK`/`WORLD_SIZE`.

use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};

use crate::config::RuntimeConfig;
use crate::error::{ErrorCode, Result, TalkError};
use crate::models::SchedulerType;
use crate::types::{DialogueInput, Resolution, VoiceProfile};

/// Scheduler choice on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchedulerArg {
    /// Deterministic flow-matching Euler steps
    Euler,
    /// Re-noises every step from the shared seed
    Pingpong,
}

impl From<SchedulerArg> for SchedulerType {
    fn from(arg: SchedulerArg) -> Self {
        match arg {
            SchedulerArg::Euler => SchedulerType::Euler,
            SchedulerArg::Pingpong => SchedulerType::PingPong,
        }
    }
}

/// What this process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Generate one video and exit.
    Generate,
    /// JSON-RPC job server on stdin/stdout.
    Serve,
    /// Non-zero rank: follow rank 0 until it shuts down.
    Follower,
    /// Nothing to do.
    Usage,
}

/// duet-daemon: two-speaker talking-head video generation
#[derive(Parser, Debug)]
#[command(name = "duet-daemon")]
#[command(about = "Two-speaker talking-head video generation with sequence-parallel denoising")]
#[command(version)]
pub struct Cli {
    /// Dialogue script file ("-" reads stdin)
    #[arg(short, long)]
    pub script: Option<PathBuf>,

    /// Portrait of speaker 1 (left)
    #[arg(long)]
    pub portrait1: Option<PathBuf>,

    /// Portrait of speaker 2 (right)
    #[arg(long)]
    pub portrait2: Option<PathBuf>,

    /// Voice key for speaker 1
    #[arg(long, default_value = "speaker1")]
    pub voice1: String,

    /// Voice key for speaker 2
    #[arg(long, default_value = "speaker2")]
    pub voice2: String,

    /// Scene description
    #[arg(short, long, default_value = "")]
    pub prompt: String,

    /// Output video path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Denoising steps
    #[arg(long)]
    pub steps: Option<u32>,

    /// Number of video frames (4k+1)
    #[arg(long)]
    pub frames: Option<u32>,

    /// Output size as WIDTHxHEIGHT
    #[arg(long)]
    pub size: Option<String>,

    /// Seed shared by every rank
    #[arg(long)]
    pub seed: Option<u64>,

    /// Text guidance scale
    #[arg(long)]
    pub text_guidance: Option<f32>,

    /// Audio guidance scale
    #[arg(long)]
    pub audio_guidance: Option<f32>,

    /// Scheduler
    #[arg(long, value_enum)]
    pub scheduler: Option<SchedulerArg>,

    /// Sequence-parallel degree
    #[arg(long)]
    pub ulysses_size: Option<usize>,

    /// Ring-attention degree
    #[arg(long)]
    pub ring_size: Option<usize>,

    /// This process's rank (overrides RANK)
    #[arg(long)]
    pub rank: Option<usize>,

    /// Number of ranks in the group (overrides WORLD_SIZE)
    #[arg(long)]
    pub world_size: Option<usize>,

    /// Rendezvous host of rank 0 (overrides MASTER_ADDR)
    #[arg(long)]
    pub master_addr: Option<String>,

    /// Rendezvous port of rank 0 (overrides MASTER_PORT)
    #[arg(long)]
    pub master_port: Option<u16>,

    /// Run N ranks as threads in this process
    #[arg(long)]
    pub local_ranks: Option<usize>,

    /// TTS command template with {text}, {voice} and {output} placeholders
    #[arg(long)]
    pub tts_command: Option<String>,

    /// Run the JSON-RPC job server on stdin/stdout
    #[arg(long)]
    pub serve: bool,

    /// Verbose logging on every rank
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Builds the runtime configuration: file, then environment, then flags.
    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path).map_err(|e| {
                TalkError::with_source(
                    ErrorCode::UnsupportedParameter,
                    format!("Cannot load config {}", path.display()),
                    e,
                )
            })?,
            None => RuntimeConfig::new(),
        };
        config.apply_env();
        self.apply_flags(&mut config)?;

        if let Some(reason) = config.validate() {
            return Err(TalkError::unsupported_parameter(reason));
        }
        Ok(config)
    }

    fn apply_flags(&self, config: &mut RuntimeConfig) -> Result<()> {
        let sampling = &mut config.coordinator.sampling;
        if let Some(steps) = self.steps {
            sampling.sample_steps = steps;
        }
        if let Some(frames) = self.frames {
            sampling.frame_count = frames;
        }
        if let Some(size) = &self.size {
            sampling.resolution = Resolution::parse(size).ok_or_else(|| {
                TalkError::unsupported_parameter(format!("size '{}' is not WIDTHxHEIGHT", size))
            })?;
        }
        if let Some(seed) = self.seed {
            sampling.seed = seed;
        }
        if let Some(g) = self.text_guidance {
            sampling.text_guidance_scale = g;
        }
        if let Some(g) = self.audio_guidance {
            sampling.audio_guidance_scale = g;
        }
        if let Some(s) = self.scheduler {
            sampling.scheduler = s.into();
        }

        let parallel = &mut config.coordinator.parallel;
        if let Some(n) = self.ulysses_size {
            parallel.ulysses_size = n;
        }
        if let Some(n) = self.ring_size {
            parallel.ring_size = n;
        }

        let launch = &mut config.launch;
        if let Some(rank) = self.rank {
            launch.rank = rank;
        }
        if let Some(world) = self.world_size {
            launch.world_size = world;
        }
        if let Some(addr) = &self.master_addr {
            launch.master_addr = addr.clone();
        }
        if let Some(port) = self.master_port {
            launch.master_port = port;
        }

        if let Some(cmd) = &self.tts_command {
            config.tts.command = Some(cmd.clone());
        }
        if self.debug {
            config.debug = true;
        }
        Ok(())
    }

    /// Decides the process role.
    pub fn mode(&self, config: &RuntimeConfig) -> Mode {
        if config.launch.rank != 0 {
            Mode::Follower
        } else if self.serve {
            Mode::Serve
        } else if self.script.is_some() {
            Mode::Generate
        } else {
            Mode::Usage
        }
    }

    /// Returns the effective output path.
    ///
    /// Defaults to "output.mp4" in the current directory if not specified.
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| PathBuf::from("output.mp4"))
    }

    /// Reads the script and assembles the input for one generation.
    pub fn dialogue_input(&self, config: &RuntimeConfig) -> Result<DialogueInput> {
        let script_path = self
            .script
            .as_ref()
            .ok_or_else(|| TalkError::speaker_count(0))?;
        let script = read_script(script_path)?;

        let portrait = |p: &Option<PathBuf>, n: u8| {
            p.clone().ok_or_else(|| {
                TalkError::invalid_image(format!("--portrait{} is required", n))
            })
        };

        let sample_rate = config.tts.sample_rate;
        Ok(DialogueInput {
            script,
            portrait1: portrait(&self.portrait1, 1)?,
            portrait2: portrait(&self.portrait2, 2)?,
            voices: vec![
                VoiceProfile::new(1, self.voice1.clone(), sample_rate),
                VoiceProfile::new(2, self.voice2.clone(), sample_rate),
            ],
            prompt: self.prompt.clone(),
            params: config.coordinator.sampling.clone(),
            output_path: self.output_path(),
        })
    }
}

fn read_script(path: &Path) -> Result<String> {
    let read_err = |e: std::io::Error| {
        TalkError::with_source(
            ErrorCode::SpeakerCount,
            format!("Cannot read script {}", path.display()),
            e,
        )
    };
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).map_err(read_err)?;
        Ok(text)
    } else {
        std::fs::read_to_string(path).map_err(read_err)
    }
}
