//! Generation request submitted to the inference coordinator.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TalkError};
use crate::frame::CompositeFrame;
use crate::models::scheduler::SchedulerType;

/// Output video frame rate.
pub const FPS: u32 = 25;

/// Smallest supported frame count.
pub const MIN_FRAME_COUNT: u32 = 5;

/// Largest supported frame count.
pub const MAX_FRAME_COUNT: u32 = 201;

/// Smallest supported canvas side in pixels.
pub const MIN_SIDE: u32 = 64;

/// Largest supported canvas side in pixels.
pub const MAX_SIDE: u32 = 1280;

/// Largest supported number of sampling steps.
pub const MAX_SAMPLE_STEPS: u32 = 100;

/// Frames are grouped by this many into one latent frame (after the first).
pub const TEMPORAL_STRIDE: u32 = 4;

/// Pixels per latent token along each spatial axis.
pub const SPATIAL_STRIDE: u32 = 16;

/// Output canvas size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parses "WIDTHxHEIGHT" (e.g. "1280x720").
    pub fn parse(s: &str) -> Option<Self> {
        let (w, h) = s.trim().split_once(['x', 'X', '*'])?;
        Some(Self::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Numeric parameters of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Number of denoising iterations.
    pub sample_steps: u32,
    /// Number of output video frames (4k+1).
    pub frame_count: u32,
    /// Output canvas size.
    pub resolution: Resolution,
    /// Guidance scale for the text-conditioning term.
    pub text_guidance_scale: f32,
    /// Guidance scale for the audio-conditioning term.
    pub audio_guidance_scale: f32,
    /// Seed shared by every rank.
    pub seed: u64,
    /// Shift applied to the flow-matching sigma schedule.
    pub sample_shift: f32,
    /// Scheduler used for the step update.
    pub scheduler: SchedulerType,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            sample_steps: 8,
            frame_count: 81,
            resolution: Resolution::default(),
            text_guidance_scale: 5.0,
            audio_guidance_scale: 4.0,
            seed: 42,
            sample_shift: 11.0,
            scheduler: SchedulerType::Euler,
        }
    }
}

impl GenerationParams {
    /// Checks the parameters against the statically supported range.
    ///
    /// Guidance scales are deliberately not range checked: 0 disables a term.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_FRAME_COUNT..=MAX_FRAME_COUNT).contains(&self.frame_count) {
            return Err(TalkError::unsupported_parameter(format!(
                "frame_count {} outside {}..={}",
                self.frame_count, MIN_FRAME_COUNT, MAX_FRAME_COUNT
            )));
        }
        if (self.frame_count - 1) % TEMPORAL_STRIDE != 0 {
            return Err(TalkError::unsupported_parameter(format!(
                "frame_count {} is not of the form {}k+1",
                self.frame_count, TEMPORAL_STRIDE
            )));
        }
        let Resolution { width, height } = self.resolution;
        for (name, side) in [("width", width), ("height", height)] {
            if !(MIN_SIDE..=MAX_SIDE).contains(&side) {
                return Err(TalkError::unsupported_parameter(format!(
                    "{} {} outside {}..={}",
                    name, side, MIN_SIDE, MAX_SIDE
                )));
            }
            if side % SPATIAL_STRIDE != 0 {
                return Err(TalkError::unsupported_parameter(format!(
                    "{} {} is not a multiple of {}",
                    name, side, SPATIAL_STRIDE
                )));
            }
        }
        if !(1..=MAX_SAMPLE_STEPS).contains(&self.sample_steps) {
            return Err(TalkError::unsupported_parameter(format!(
                "sample_steps {} outside 1..={}",
                self.sample_steps, MAX_SAMPLE_STEPS
            )));
        }
        Ok(())
    }

    /// Duration of the output video in seconds.
    pub fn duration_sec(&self) -> f32 {
        self.frame_count as f32 / FPS as f32
    }
}

/// Fixed-shape audio conditioning for one speaker: (frame_count, audio_dim).
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTensor {
    pub speaker_id: u8,
    pub values: Array2<f32>,
}

impl EmbeddingTensor {
    pub fn new(speaker_id: u8, values: Array2<f32>) -> Self {
        Self { speaker_id, values }
    }

    /// (frames, dim)
    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }
}

/// Everything the coordinator needs to denoise one video.
///
/// Exactly one request is in flight per coordinator at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Conditioning image and speaker regions.
    pub composite: CompositeFrame,
    /// Per-speaker audio conditioning, ordered by speaker id.
    pub embeddings: Vec<EmbeddingTensor>,
    /// Scene description used for text conditioning.
    pub prompt: String,
    /// Numeric parameters.
    pub params: GenerationParams,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn default_params_are_supported() {
        assert!(GenerationParams::default().validate().is_ok());
    }

    #[test]
    fn frame_count_above_max_rejected() {
        let params = GenerationParams {
            frame_count: MAX_FRAME_COUNT + 4,
            ..Default::default()
        };
        let err = params.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedParameter);
    }

    #[test]
    fn frame_count_must_be_4k_plus_1() {
        let params = GenerationParams {
            frame_count: 80,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn resolution_must_align() {
        let params = GenerationParams {
            resolution: Resolution::new(1000, 720),
            ..Default::default()
        };
        assert!(params.validate().is_err());
        let params = GenerationParams {
            resolution: Resolution::new(2048, 720),
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn guidance_scales_unbounded() {
        let params = GenerationParams {
            text_guidance_scale: 0.0,
            audio_guidance_scale: -3.0,
            ..Default::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn resolution_parse() {
        assert_eq!(Resolution::parse("1280x720"), Some(Resolution::new(1280, 720)));
        assert_eq!(Resolution::parse("64*32"), Some(Resolution::new(64, 32)));
        assert_eq!(Resolution::parse("garbage"), None);
    }

    #[test]
    fn duration_from_frames() {
        let params = GenerationParams {
            frame_count: 25,
            ..Default::default()
        };
        assert_eq!(params.duration_sec(), 1.0);
    }
}
