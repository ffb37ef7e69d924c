//! Full pipeline runs with the encoder and TTS faked at their trait boundary.

mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image::RgbImage;

use duet_daemon::audio::{SpectralEmbeddingExtractor, ToneSynthesizer, TtsAdapter};
use duet_daemon::config::CoordinatorConfig;
use duet_daemon::dist::{spawn_local_group, InferenceCoordinator, SingleDeviceCoordinator};
use duet_daemon::error::{ErrorCode, Result, TalkError};
use duet_daemon::generation::{staging_path, Pipeline, PipelineStage};
use duet_daemon::types::{DialogueInput, VoiceProfile, FPS, MAX_FRAME_COUNT};
use duet_daemon::video::{AudioTrack, VideoAssembler};

use common::{small_config, write_portrait};

/// What the fake encoder was handed.
#[derive(Debug, Default)]
struct Encoded {
    frames: Vec<RgbImage>,
    audio_sec: f32,
    audio_rate: u32,
    fps: u32,
}

/// Writes a marker file instead of running ffmpeg.
#[derive(Clone, Default)]
struct RecordingAssembler {
    calls: Arc<Mutex<Vec<Encoded>>>,
    fail: bool,
}

impl VideoAssembler for RecordingAssembler {
    fn encode(&self, frames: &[RgbImage], audio: &AudioTrack, fps: u32, output: &Path) -> Result<()> {
        std::fs::write(output, b"fake mp4").unwrap();
        self.calls.lock().unwrap().push(Encoded {
            frames: frames.to_vec(),
            audio_sec: audio.duration(),
            audio_rate: audio.sample_rate,
            fps,
        });
        if self.fail {
            return Err(TalkError::encode("muxer exited with status 1"));
        }
        Ok(())
    }
}

/// Counts calls, then delegates to the tone synthesizer.
struct CountingTts {
    inner: ToneSynthesizer,
    calls: Arc<AtomicUsize>,
}

impl TtsAdapter for CountingTts {
    fn synthesize(&self, text: &str, voice_key: &str) -> Result<(Vec<f32>, u32)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.synthesize(text, voice_key)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    input: DialogueInput,
    tts_calls: Arc<AtomicUsize>,
    assembler: RecordingAssembler,
}

impl Harness {
    fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let portrait1 = dir.path().join("left.png");
        let portrait2 = dir.path().join("right.png");
        write_portrait(&portrait1, 40, 60, [200, 80, 60]);
        write_portrait(&portrait2, 60, 40, [40, 90, 210]);

        let input = DialogueInput {
            script: script.to_string(),
            portrait1,
            portrait2,
            voices: vec![
                VoiceProfile::new(1, "alice", 16_000),
                VoiceProfile::new(2, "bob", 16_000),
            ],
            prompt: "two friends in a cafe".to_string(),
            params: small_config().sampling,
            output_path: dir.path().join("out").join("talk.mp4"),
        };
        Self {
            _dir: dir,
            input,
            tts_calls: Arc::new(AtomicUsize::new(0)),
            assembler: RecordingAssembler::default(),
        }
    }

    fn pipeline(&self, config: &CoordinatorConfig, coordinator: Box<dyn InferenceCoordinator>) -> Pipeline {
        Pipeline::new(
            Box::new(CountingTts {
                inner: ToneSynthesizer::new(16_000),
                calls: self.tts_calls.clone(),
            }),
            Box::new(SpectralEmbeddingExtractor::new(config.model.audio_dim)),
            coordinator,
            Box::new(self.assembler.clone()),
        )
    }

    fn single_device_pipeline(&self) -> Pipeline {
        let config = small_config();
        let coordinator = SingleDeviceCoordinator::new(config.clone()).unwrap();
        self.pipeline(&config, Box::new(coordinator))
    }

    fn output(&self) -> PathBuf {
        self.input.output_path.clone()
    }
}

#[test]
fn tagged_dialogue_produces_one_video() {
    let h = Harness::new("(s1) 你好 (s2) 你好呀");
    let mut pipeline = h.single_device_pipeline();

    let output = pipeline.run(&h.input).unwrap();

    assert_eq!(output.turns, 2);
    assert_eq!(output.path, h.output());
    assert_eq!(output.frame_count, h.input.params.frame_count);
    let expected = h.input.params.frame_count as f32 / FPS as f32;
    assert!((output.duration_sec - expected).abs() < 1e-6);

    assert!(h.output().exists());
    assert!(!staging_path(&h.output()).exists());
    assert_eq!(h.tts_calls.load(Ordering::SeqCst), 2);

    let calls = h.assembler.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let encoded = &calls[0];
    assert_eq!(encoded.fps, FPS);
    assert_eq!(encoded.frames.len(), h.input.params.frame_count as usize);
    let res = h.input.params.resolution;
    assert_eq!(encoded.frames[0].dimensions(), (res.width, res.height));
    assert!((encoded.audio_sec - expected).abs() < 1e-3);
}

#[test]
fn labeled_and_unlabeled_scripts_work() {
    for script in [
        "Speaker 1: hi there\nSpeaker 2: hello",
        "角色1：你好 角色2：你好呀",
        "good morning\ngood morning to you",
    ] {
        let h = Harness::new(script);
        let output = h.single_device_pipeline().run(&h.input).unwrap();
        assert_eq!(output.turns, 2);
        assert!(h.output().exists());
    }
}

#[test]
fn turns_are_resampled_to_the_voice_rate() {
    let mut h = Harness::new("(s1) 你好 (s2) 你好呀");
    for voice in h.input.voices.iter_mut() {
        voice.sample_rate = 8_000;
    }
    h.single_device_pipeline().run(&h.input).unwrap();

    let calls = h.assembler.calls.lock().unwrap();
    assert_eq!(calls[0].audio_rate, 8_000);
    let expected = h.input.params.frame_count as f32 / FPS as f32;
    assert!((calls[0].audio_sec - expected).abs() < 1e-3);
}

#[test]
fn third_speaker_fails_before_synthesis() {
    let h = Harness::new("(s1) a (s2) b (s3) c");
    let err = h.single_device_pipeline().run(&h.input).unwrap_err();

    assert_eq!(err.code, ErrorCode::SpeakerCount);
    assert_eq!(err.stage, Some(PipelineStage::Parse));
    assert_eq!(h.tts_calls.load(Ordering::SeqCst), 0);
    assert!(h.assembler.calls.lock().unwrap().is_empty());
    assert!(!h.output().exists());
}

#[test]
fn single_speaker_is_rejected() {
    let h = Harness::new("(s1) talking to myself (s1) again");
    let err = h.single_device_pipeline().run(&h.input).unwrap_err();
    assert_eq!(err.code, ErrorCode::SpeakerCount);
    assert_eq!(h.tts_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn missing_voice_is_reported() {
    let mut h = Harness::new("(s1) hi (s2) hello");
    h.input.voices.retain(|v| v.speaker_id == 1);
    let err = h.single_device_pipeline().run(&h.input).unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingVoice);
    assert!(err.message.contains('2'));
    assert_eq!(h.tts_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn oversized_frame_count_runs_no_stage() {
    let mut h = Harness::new("(s1) hi (s2) hello");
    h.input.params.frame_count = MAX_FRAME_COUNT + 4;
    let err = h.single_device_pipeline().run(&h.input).unwrap_err();

    assert_eq!(err.code, ErrorCode::UnsupportedParameter);
    assert_eq!(err.stage, Some(PipelineStage::Validate));
    assert_eq!(h.tts_calls.load(Ordering::SeqCst), 0);
    assert!(h.assembler.calls.lock().unwrap().is_empty());
}

#[test]
fn unreadable_portrait_is_invalid_image() {
    let mut h = Harness::new("(s1) hi (s2) hello");
    std::fs::write(&h.input.portrait2, b"not an image").unwrap();
    h.input.portrait1 = h.input.portrait1.with_file_name("missing.png");
    let err = h.single_device_pipeline().run(&h.input).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidImage);
    assert_eq!(err.stage, Some(PipelineStage::Composite));
}

#[test]
fn encoder_failure_leaves_no_file() {
    let mut h = Harness::new("(s1) hi (s2) hello");
    h.assembler.fail = true;
    let err = h.single_device_pipeline().run(&h.input).unwrap_err();

    assert_eq!(err.code, ErrorCode::Encode);
    assert_eq!(err.stage, Some(PipelineStage::Assemble));
    assert!(!h.output().exists());
    assert!(!staging_path(&h.output()).exists());
}

#[test]
fn local_group_renders_the_same_frames() {
    let h = Harness::new("(s1) 你好 (s2) 你好呀");
    h.single_device_pipeline().run(&h.input).unwrap();

    let mut config = small_config();
    config.parallel.ulysses_size = 2;
    let group = spawn_local_group(&config, 2).unwrap();
    let mut pipeline = h.pipeline(&config, Box::new(group));
    pipeline.run(&h.input).unwrap();
    drop(pipeline);

    let calls = h.assembler.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].frames, calls[1].frames);
}
