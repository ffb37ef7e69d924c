//! End-to-end generation pipeline.
//!
//! Sequences script parsing, per-turn speech synthesis, audio embedding,
//! frame compositing, distributed denoising, decoding and muxing. Every
//! failure is tagged with the stage it came from and aborts the remaining
//! stages; the output path only ever receives a complete video.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::audio::{
    embedding::resample, AudioEmbeddingExtractor, CommandSynthesizer, SpectralEmbeddingExtractor,
    ToneSynthesizer, TtsAdapter,
};
use crate::config::RuntimeConfig;
use crate::dist::{DenoisingState, InferenceCoordinator, StepObserver};
use crate::error::{ErrorCode, Result, TalkError};
use crate::frame::{CompositeFrame, CompositeFramePreparer};
use crate::script::ScriptParser;
use crate::types::{
    distinct_speakers, AudioSegment, DialogueInput, DialogueTurn, EmbeddingTensor,
    GenerationRequest, FPS,
};
use crate::video::{AudioTrack, FfmpegAssembler, FrameDecoder, VideoAssembler};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Request parameter checks.
    Validate,
    /// Dialogue script to turns, speaker and voice checks.
    Parse,
    /// Per-turn text-to-speech.
    Synthesize,
    /// Per-speaker audio embeddings.
    Embed,
    /// Portrait composite and speaker regions.
    Composite,
    /// Distributed denoising.
    Inference,
    /// Latent to frames.
    Decode,
    /// Frames and audio to the output file.
    Assemble,
}

impl PipelineStage {
    /// Stable label used in logs and error reports.
    pub fn label(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Parse => "parse",
            Self::Synthesize => "synthesize",
            Self::Embed => "embed",
            Self::Composite => "composite",
            Self::Inference => "inference",
            Self::Decode => "decode",
            Self::Assemble => "assemble",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Runs `f` as `stage`, tagging any error with it.
fn run_stage<T>(stage: PipelineStage, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let started = Instant::now();
    debug!("Stage {} started", stage);
    let result = f().map_err(|e| e.in_stage(stage));
    match &result {
        Ok(_) => debug!("Stage {} finished in {:?}", stage, started.elapsed()),
        Err(e) => warn!("Stage {} failed: {}", stage, e),
    }
    result
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub path: PathBuf,
    pub turns: usize,
    pub frame_count: u32,
    pub duration_sec: f32,
}

/// Mixed dialogue audio plus each speaker's isolated track, all at one rate
/// and fitted to the video length.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueAudio {
    pub mix: AudioTrack,
    /// Speaker 1 then speaker 2.
    pub speakers: [Vec<f32>; 2],
}

impl DialogueAudio {
    /// Lays segments out back to back. Each speaker's track is silent while
    /// the other speaker talks; the mix is their sum. Segments at other
    /// rates are resampled to the first segment's rate.
    pub fn from_segments(segments: &[AudioSegment], duration_sec: f32) -> Result<Self> {
        let rate = segments
            .first()
            .map(|s| s.sample_rate)
            .ok_or_else(|| TalkError::synthesis("no audio segments"))?;
        let mut speakers: [Vec<f32>; 2] = [Vec::new(), Vec::new()];
        for segment in segments {
            let samples = if segment.sample_rate == rate {
                segment.waveform.clone()
            } else {
                resample(&segment.waveform, segment.sample_rate, rate).map_err(|e| {
                    TalkError::synthesis(format!(
                        "cannot resample speaker {} audio: {}",
                        segment.speaker_id, e.message
                    ))
                })?
            };
            let (own, other) = match segment.speaker_id {
                1 => (0, 1),
                2 => (1, 0),
                id => return Err(TalkError::speaker_count(id as usize)),
            };
            let silence = samples.len();
            speakers[own].extend(samples);
            speakers[other].extend(std::iter::repeat(0.0).take(silence));
        }

        let target = (duration_sec * rate as f32).round() as usize;
        for track in speakers.iter_mut() {
            track.resize(target, 0.0);
        }
        let mix = speakers[0]
            .iter()
            .zip(&speakers[1])
            .map(|(a, b)| a + b)
            .collect();
        Ok(Self {
            mix: AudioTrack::new(mix, rate),
            speakers,
        })
    }
}

/// The orchestrator. Holds one coordinator; requests run one at a time.
pub struct Pipeline {
    parser: ScriptParser,
    tts: Box<dyn TtsAdapter>,
    extractor: Box<dyn AudioEmbeddingExtractor>,
    coordinator: Box<dyn InferenceCoordinator>,
    decoder: FrameDecoder,
    assembler: Box<dyn VideoAssembler>,
}

impl Pipeline {
    pub fn new(
        tts: Box<dyn TtsAdapter>,
        extractor: Box<dyn AudioEmbeddingExtractor>,
        coordinator: Box<dyn InferenceCoordinator>,
        assembler: Box<dyn VideoAssembler>,
    ) -> Self {
        Self {
            parser: ScriptParser::new(),
            tts,
            extractor,
            coordinator,
            decoder: FrameDecoder::new(),
            assembler,
        }
    }

    /// Builds the production pipeline around `coordinator`: the configured
    /// TTS command (or the tone synthesizer), spectral embeddings and ffmpeg.
    pub fn from_config(
        config: &RuntimeConfig,
        coordinator: Box<dyn InferenceCoordinator>,
    ) -> Result<Self> {
        let work_dir = config.effective_work_dir();
        let tts: Box<dyn TtsAdapter> = match &config.tts.command {
            Some(template) if !config.debug => {
                Box::new(CommandSynthesizer::new(template, work_dir.clone())?)
            }
            _ => Box::new(ToneSynthesizer::new(config.tts.sample_rate)),
        };
        let extractor = SpectralEmbeddingExtractor::new(config.coordinator.model.audio_dim);
        let assembler = FfmpegAssembler::new(config.effective_ffmpeg(), work_dir);
        Ok(Self::new(tts, Box::new(extractor), coordinator, Box::new(assembler)))
    }

    /// Forwards denoising step events from the coordinator.
    pub fn set_observer(&mut self, observer: StepObserver) {
        self.coordinator.set_observer(observer);
    }

    /// Generates the video described by `input` at `input.output_path`.
    pub fn run(&mut self, input: &DialogueInput) -> Result<PipelineOutput> {
        let started = Instant::now();
        let params = &input.params;

        run_stage(PipelineStage::Validate, || params.validate())?;
        let turns = run_stage(PipelineStage::Parse, || self.parse(input))?;
        info!(
            "Parsed {} turns; generating {} frames at {}",
            turns.len(),
            params.frame_count,
            params.resolution
        );

        let segments = run_stage(PipelineStage::Synthesize, || self.synthesize(input, &turns))?;
        let duration_sec = params.duration_sec();
        let audio = run_stage(PipelineStage::Synthesize, || {
            DialogueAudio::from_segments(&segments, duration_sec)
        })?;
        drop(segments);

        let embeddings = run_stage(PipelineStage::Embed, || {
            self.embed(&audio, params.frame_count as usize)
        })?;
        let composite = run_stage(PipelineStage::Composite, || self.composite(input))?;

        let request = GenerationRequest {
            composite,
            embeddings,
            prompt: input.prompt.clone(),
            params: params.clone(),
        };
        let state: DenoisingState =
            run_stage(PipelineStage::Inference, || self.coordinator.run(&request))?;
        let frames = run_stage(PipelineStage::Decode, || {
            self.decoder.decode(&state, &request.composite)
        })?;
        drop(state);

        run_stage(PipelineStage::Assemble, || {
            write_atomically(&input.output_path, |staging| {
                self.assembler.encode(&frames, &audio.mix, FPS, staging)
            })
        })?;

        info!(
            "Generated {} ({:.2}s of video) in {:.1}s",
            input.output_path.display(),
            duration_sec,
            started.elapsed().as_secs_f32()
        );
        Ok(PipelineOutput {
            path: input.output_path.clone(),
            turns: turns.len(),
            frame_count: params.frame_count,
            duration_sec,
        })
    }

    /// Parses the script and checks speakers and voices.
    fn parse(&self, input: &DialogueInput) -> Result<Vec<DialogueTurn>> {
        let turns = self.parser.parse(&input.script);
        if turns.is_empty() {
            return Err(TalkError::speaker_count(0));
        }
        let speakers = distinct_speakers(&turns);
        if speakers.len() != 2 {
            return Err(TalkError::speaker_count(speakers.len()));
        }
        if speakers.iter().any(|id| *id != 1 && *id != 2) {
            return Err(TalkError::new(
                ErrorCode::SpeakerCount,
                format!("speakers must be 1 and 2, got {:?}", speakers),
            ));
        }
        for id in speakers {
            if input.voice_for(id).is_none() {
                return Err(TalkError::missing_voice(id));
            }
        }
        Ok(turns)
    }

    fn synthesize(&self, input: &DialogueInput, turns: &[DialogueTurn]) -> Result<Vec<AudioSegment>> {
        turns
            .iter()
            .map(|turn| {
                let voice = input
                    .voice_for(turn.speaker_id)
                    .ok_or_else(|| TalkError::missing_voice(turn.speaker_id))?;
                let (waveform, sample_rate) = self
                    .tts
                    .synthesize(&turn.text, &voice.voice_key)
                    .map_err(|e| {
                        TalkError::new(
                            e.code,
                            format!("turn {} (speaker {}): {}", turn.order, turn.speaker_id, e.message),
                        )
                    })?;
                let waveform = conform_rate(waveform, sample_rate, voice.sample_rate).map_err(|e| {
                    TalkError::synthesis(format!(
                        "turn {} (speaker {}): {}",
                        turn.order, turn.speaker_id, e.message
                    ))
                })?;
                let segment = AudioSegment::new(turn.speaker_id, waveform, voice.sample_rate);
                debug!(
                    "Turn {} speaker {}: {:.2}s",
                    turn.order,
                    turn.speaker_id,
                    segment.duration()
                );
                Ok(segment)
            })
            .collect()
    }

    fn embed(&self, audio: &DialogueAudio, frame_count: usize) -> Result<Vec<EmbeddingTensor>> {
        let expected = (frame_count, self.extractor.dim());
        audio
            .speakers
            .iter()
            .enumerate()
            .map(|(k, track)| {
                let values = self.extractor.embed(track, audio.mix.sample_rate, frame_count)?;
                if values.dim() != expected {
                    return Err(TalkError::embedding(format!(
                        "extractor returned {:?} for speaker {}, expected {:?}",
                        values.dim(),
                        k + 1,
                        expected
                    )));
                }
                Ok(EmbeddingTensor::new(k as u8 + 1, values))
            })
            .collect()
    }

    fn composite(&self, input: &DialogueInput) -> Result<CompositeFrame> {
        let read = |path: &Path, n: u8| {
            std::fs::read(path).map_err(|e| {
                TalkError::with_source(
                    ErrorCode::InvalidImage,
                    format!("Cannot read portrait {} at {}", n, path.display()),
                    e,
                )
            })
        };
        let p1 = read(&input.portrait1, 1)?;
        let p2 = read(&input.portrait2, 2)?;
        let res = input.params.resolution;
        CompositeFramePreparer::new(res.width, res.height).prepare(&p1, &p2)
    }
}

/// Brings synthesized audio to the rate its voice profile declares.
fn conform_rate(waveform: Vec<f32>, from: u32, to: u32) -> Result<Vec<f32>> {
    if to == 0 {
        return Err(TalkError::synthesis("voice profile has a zero sample rate"));
    }
    if from == to {
        return Ok(waveform);
    }
    debug!("Resampling synthesized audio {} Hz -> {} Hz", from, to);
    resample(&waveform, from, to)
}

/// Staging path next to `output`; renamed over it only on success.
pub fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!(".{}.partial", name))
}

/// Calls `write` with a staging path and moves the result to `output`.
/// Nothing is left behind on failure.
pub fn write_atomically(output: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            TalkError::with_source(ErrorCode::Encode, "Cannot create output directory", e)
        })?;
    }
    let staging = staging_path(output);
    let result = write(&staging).and_then(|()| {
        std::fs::rename(&staging, output).map_err(|e| {
            TalkError::with_source(
                ErrorCode::Encode,
                format!("Cannot move video into {}", output.display()),
                e,
            )
        })
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_labels() {
        assert_eq!(PipelineStage::Synthesize.label(), "synthesize");
        assert_eq!(PipelineStage::Inference.to_string(), "inference");
    }

    #[test]
    fn run_stage_tags_errors() {
        let err = run_stage(PipelineStage::Embed, || -> Result<()> {
            Err(TalkError::embedding("bad shape"))
        })
        .unwrap_err();
        assert_eq!(err.stage, Some(PipelineStage::Embed));
    }

    #[test]
    fn dialogue_audio_interleaves_speakers() {
        let segments = vec![
            AudioSegment::new(1, vec![1.0; 4], 10),
            AudioSegment::new(2, vec![2.0; 2], 10),
        ];
        let audio = DialogueAudio::from_segments(&segments, 0.8).unwrap();
        assert_eq!(audio.speakers[0], vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(audio.speakers[1], vec![0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 0.0, 0.0]);
        assert_eq!(audio.mix.samples, vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 0.0, 0.0]);
        assert_eq!(audio.mix.sample_rate, 10);
    }

    #[test]
    fn dialogue_audio_truncates_to_duration() {
        let segments = vec![AudioSegment::new(1, vec![0.5; 100], 10)];
        let audio = DialogueAudio::from_segments(&segments, 2.0).unwrap();
        assert_eq!(audio.mix.samples.len(), 20);
        assert_eq!(audio.mix.duration(), 2.0);
    }

    #[test]
    fn synthesized_audio_follows_profile_rate() {
        let tone: Vec<f32> = (0..16_000).map(|i| (i as f32 * 0.05).sin()).collect();
        let same = conform_rate(tone.clone(), 16_000, 16_000).unwrap();
        assert_eq!(same, tone);

        let halved = conform_rate(tone.clone(), 16_000, 8_000).unwrap();
        assert!((halved.len() as i64 - 8_000).abs() < 400, "got {}", halved.len());

        let err = conform_rate(tone, 16_000, 0).unwrap_err();
        assert_eq!(err.code, ErrorCode::Synthesis);
    }

    #[test]
    fn staging_is_hidden_sibling() {
        assert_eq!(
            staging_path(Path::new("/tmp/out/talk.mp4")),
            PathBuf::from("/tmp/out/.talk.mp4.partial")
        );
    }

    #[test]
    fn failed_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("talk.mp4");
        let err = write_atomically(&output, |staging| {
            std::fs::write(staging, b"half a video").unwrap();
            Err(TalkError::encode("muxer crashed"))
        })
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::Encode);
        assert!(!output.exists());
        assert!(!staging_path(&output).exists());

        write_atomically(&output, |staging| {
            std::fs::write(staging, b"video").unwrap();
            Ok(())
        })
        .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"video");
    }
}
