#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use image::{Rgb, RgbImage};
use ndarray::Array2;

use duet_daemon::config::CoordinatorConfig;
use duet_daemon::frame::{BBox, CompositeFrame};
use duet_daemon::types::{EmbeddingTensor, GenerationParams, GenerationRequest, Resolution};

/// Small model and canvas: a 2x4 token grid over 2 latent frames.
pub fn small_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.model.patch_size = 32;
    config.sampling = small_params();
    config.timeouts.gather_ms = 2_000;
    config.timeouts.collective_ms = 5_000;
    config
}

pub fn small_params() -> GenerationParams {
    GenerationParams {
        sample_steps: 2,
        frame_count: 5,
        resolution: Resolution::new(128, 64),
        ..Default::default()
    }
}

pub fn request(config: &CoordinatorConfig) -> GenerationRequest {
    let params = config.sampling.clone();
    let (w, h) = (params.resolution.width, params.resolution.height);
    let image = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 2) as u8, (y * 3) as u8, 90]));
    let frames = params.frame_count as usize;
    let dim = config.model.audio_dim;
    GenerationRequest {
        composite: CompositeFrame {
            image,
            bbox_speaker1: BBox::new(0, 0, w / 2, h),
            bbox_speaker2: BBox::new(w / 2, 0, w, h),
        },
        embeddings: vec![
            EmbeddingTensor::new(
                1,
                Array2::from_shape_fn((frames, dim), |(f, j)| ((f + j) as f32 / 7.0).sin()),
            ),
            EmbeddingTensor::new(
                2,
                Array2::from_shape_fn((frames, dim), |(f, j)| ((f * j) as f32 / 5.0).cos()),
            ),
        ],
        prompt: "two friends talking in a cafe".to_string(),
        params,
    }
}

/// Writes a solid-colour PNG portrait.
pub fn write_portrait(path: &Path, width: u32, height: u32, color: [u8; 3]) {
    RgbImage::from_pixel(width, height, Rgb(color)).save(path).unwrap();
}

/// Shared, cloneable event log for observers on several threads.
pub fn shared_log<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}
