//! Text-to-speech adapters.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use super::wav::read_wav;
use crate::error::{ErrorCode, Result, TalkError};

/// Turns one utterance into a mono waveform.
pub trait TtsAdapter: Send + Sync {
    /// Returns `(waveform, sample_rate)`.
    ///
    /// Fails with SYNTHESIS on empty text or an unknown voice key.
    fn synthesize(&self, text: &str, voice_key: &str) -> Result<(Vec<f32>, u32)>;
}

fn check_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(TalkError::synthesis("empty utterance"));
    }
    Ok(())
}

/// Deterministic tone generator for offline runs and tests.
///
/// Duration is 0.1 s per character, clamped to 1..=10 s. Pitch is derived
/// from the voice key and the amplitude pulses once per character.
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    sample_rate: u32,
    voices: Option<HashSet<String>>,
}

impl ToneSynthesizer {
    /// Accepts any non-empty voice key.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            voices: None,
        }
    }

    /// Accepts only the listed voice keys.
    pub fn with_voices<I, S>(sample_rate: u32, voices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sample_rate,
            voices: Some(voices.into_iter().map(Into::into).collect()),
        }
    }

    /// Seconds of audio produced for `text`.
    pub fn duration_for(text: &str) -> f32 {
        (text.chars().count() as f32 * 0.1).clamp(1.0, 10.0)
    }
}

impl TtsAdapter for ToneSynthesizer {
    fn synthesize(&self, text: &str, voice_key: &str) -> Result<(Vec<f32>, u32)> {
        check_text(text)?;
        let known = match &self.voices {
            Some(voices) => voices.contains(voice_key),
            None => !voice_key.is_empty(),
        };
        if !known {
            return Err(TalkError::synthesis(format!("unknown voice '{}'", voice_key)));
        }

        let key_hash = voice_key
            .bytes()
            .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
        let pitch = 110.0 + (key_hash % 220) as f32;
        let duration = Self::duration_for(text);
        let sr = self.sample_rate as f32;
        let n = (duration * sr) as usize;
        let syllable = (0.1 * sr).max(1.0);
        let waveform = (0..n)
            .map(|i| {
                let t = i as f32 / sr;
                let phase = (i as f32 % syllable) / syllable;
                let envelope = (std::f32::consts::PI * phase).sin();
                0.3 * envelope * (2.0 * std::f32::consts::PI * pitch * t).sin()
            })
            .collect();
        Ok((waveform, self.sample_rate))
    }
}

/// Runs an external TTS program that writes a WAV file.
///
/// The command template is split on whitespace; `{text}`, `{voice}` and
/// `{output}` are substituted per argument.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    template: Vec<String>,
    work_dir: PathBuf,
}

impl CommandSynthesizer {
    pub fn new(template: &str, work_dir: PathBuf) -> Result<Self> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            return Err(TalkError::synthesis("empty TTS command"));
        }
        Ok(Self { template, work_dir })
    }
}

impl TtsAdapter for CommandSynthesizer {
    fn synthesize(&self, text: &str, voice_key: &str) -> Result<(Vec<f32>, u32)> {
        check_text(text)?;
        std::fs::create_dir_all(&self.work_dir).map_err(|e| {
            TalkError::with_source(ErrorCode::Synthesis, "Cannot create TTS work directory", e)
        })?;
        let output = self.work_dir.join(format!(
            "tts-{}-{}.wav",
            std::process::id(),
            hex::encode(&rand::random::<[u8; 6]>())
        ));
        let output_str = output.to_string_lossy().to_string();

        let args: Vec<String> = self
            .template
            .iter()
            .map(|a| {
                a.replace("{text}", text)
                    .replace("{voice}", voice_key)
                    .replace("{output}", &output_str)
            })
            .collect();
        debug!("Running TTS: {}", args.join(" "));

        let result = Command::new(&args[0]).args(&args[1..]).output();
        let run = match result {
            Ok(out) if out.status.success() => read_wav(&output),
            Ok(out) => Err(TalkError::synthesis(format!(
                "TTS for voice '{}' exited with {}: {}",
                voice_key,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
            Err(e) => Err(TalkError::with_source(
                ErrorCode::Synthesis,
                format!("Cannot start TTS program '{}'", args[0]),
                e,
            )),
        };
        let _ = std::fs::remove_file(&output);
        run
    }
}
