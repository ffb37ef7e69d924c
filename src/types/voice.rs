//! Voice configuration and synthesized audio.

use serde::{Deserialize, Serialize};

/// Voice assigned to one speaker for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Speaker this voice belongs to.
    pub speaker_id: u8,
    /// Key understood by the TTS adapter (voice name or voice file).
    pub voice_key: String,
    /// Rate this voice's turns are resampled to after synthesis.
    pub sample_rate: u32,
}

impl VoiceProfile {
    /// Creates a voice profile.
    pub fn new(speaker_id: u8, voice_key: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            speaker_id,
            voice_key: voice_key.into(),
            sample_rate,
        }
    }
}

/// Mono audio synthesized for one turn.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Speaker who said this segment.
    pub speaker_id: u8,
    /// Mono samples.
    pub waveform: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioSegment {
    /// Creates a new segment.
    pub fn new(speaker_id: u8, waveform: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            speaker_id,
            waveform,
            sample_rate,
        }
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.waveform.len() as f32 / self.sample_rate as f32
    }
}
