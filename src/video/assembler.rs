//! Muxing decoded frames and the dialogue audio into a video file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use image::RgbImage;
use tracing::{debug, info};

use crate::audio::write_wav;
use crate::error::{ErrorCode, Result, TalkError};

/// Mono audio for the whole video.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioTrack {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Writes a playable video. On failure nothing is left at `output`.
pub trait VideoAssembler: Send + Sync {
    fn encode(&self, frames: &[RgbImage], audio: &AudioTrack, fps: u32, output: &Path) -> Result<()>;
}

/// Checks frames are non-empty and share one size.
pub fn frame_size(frames: &[RgbImage]) -> Result<(u32, u32)> {
    let first = frames
        .first()
        .ok_or_else(|| TalkError::encode("no frames to encode"))?;
    let size = first.dimensions();
    if let Some(i) = frames.iter().position(|f| f.dimensions() != size) {
        return Err(TalkError::encode(format!(
            "frame {} is {:?}, expected {:?}",
            i,
            frames[i].dimensions(),
            size
        )));
    }
    Ok(size)
}

/// Pipes rgb24 frames into an `ffmpeg` child and muxes a WAV audio track.
#[derive(Debug, Clone)]
pub struct FfmpegAssembler {
    ffmpeg: PathBuf,
    work_dir: PathBuf,
}

impl FfmpegAssembler {
    pub fn new(ffmpeg: PathBuf, work_dir: PathBuf) -> Self {
        Self { ffmpeg, work_dir }
    }

    fn run(&self, frames: &[RgbImage], audio: &AudioTrack, fps: u32, output: &Path, wav: &Path) -> Result<()> {
        let (width, height) = frame_size(frames)?;
        write_wav(&audio.samples, wav, audio.sample_rate)?;
        let duration = frames.len() as f32 / fps.max(1) as f32;

        let mut child = Command::new(&self.ffmpeg)
            .args(["-y", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &format!("{}x{}", width, height)])
            .args(["-r", &fps.to_string(), "-i", "-"])
            .arg("-i")
            .arg(wav)
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-c:a", "aac"])
            .args(["-t", &format!("{:.3}", duration), "-f", "mp4"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TalkError::with_source(
                    ErrorCode::Encode,
                    format!("Cannot start {}", self.ffmpeg.display()),
                    e,
                )
            })?;

        let write_result = match child.stdin.take() {
            Some(mut stdin) => frames.iter().try_for_each(|f| stdin.write_all(f.as_raw())),
            None => Ok(()),
        };
        let out = child
            .wait_with_output()
            .map_err(|e| TalkError::with_source(ErrorCode::Encode, "ffmpeg did not finish", e))?;
        if !out.status.success() {
            return Err(TalkError::encode(format!(
                "ffmpeg exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        write_result
            .map_err(|e| TalkError::with_source(ErrorCode::Encode, "Failed to stream frames to ffmpeg", e))
    }
}

impl VideoAssembler for FfmpegAssembler {
    fn encode(&self, frames: &[RgbImage], audio: &AudioTrack, fps: u32, output: &Path) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| TalkError::with_source(ErrorCode::Encode, "Cannot create work directory", e))?;
        let wav = self.work_dir.join(format!(
            "track-{}-{}.wav",
            std::process::id(),
            hex::encode(rand::random::<[u8; 6]>())
        ));
        debug!("Encoding {} frames at {} fps to {}", frames.len(), fps, output.display());

        let result = self.run(frames, audio, fps, output, &wav);
        let _ = std::fs::remove_file(&wav);
        match result {
            Ok(()) => {
                info!("Wrote {}", output.display());
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(output);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn track_duration() {
        assert_eq!(AudioTrack::new(vec![0.0; 8000], 16_000).duration(), 0.5);
        assert_eq!(AudioTrack::new(vec![], 0).duration(), 0.0);
    }

    #[test]
    fn frame_size_checks() {
        assert_eq!(frame_size(&[]).unwrap_err().code, ErrorCode::Encode);
        let frames = vec![RgbImage::new(4, 2), RgbImage::new(4, 2)];
        assert_eq!(frame_size(&frames).unwrap(), (4, 2));
        let mixed = vec![RgbImage::new(4, 2), RgbImage::new(2, 2)];
        assert!(frame_size(&mixed).is_err());
    }

    #[test]
    fn missing_ffmpeg_leaves_no_output() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let assembler = FfmpegAssembler::new(dir.path().join("no-ffmpeg"), dir.path().join("work"));
        let frames = vec![RgbImage::new(16, 16); 5];
        let err = assembler
            .encode(&frames, &AudioTrack::new(vec![0.0; 3200], 16_000), 25, &output)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Encode);
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }
}
