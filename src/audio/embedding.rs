//! Audio embedding extraction.

use ndarray::Array2;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use crate::error::{Result, TalkError};
use crate::types::FPS;

/// Rate the extractor analyses audio at.
pub const EMBEDDING_SAMPLE_RATE: u32 = 16_000;

/// Maps a waveform to a `(frame_count, dim)` tensor, one row per video frame.
///
/// The shape depends only on `frame_count` and [`dim`](Self::dim); shorter
/// audio is padded with silence and longer audio is truncated.
pub trait AudioEmbeddingExtractor: Send + Sync {
    fn dim(&self) -> usize;

    fn embed(&self, waveform: &[f32], sample_rate: u32, frame_count: usize) -> Result<Array2<f32>>;
}

/// Log band energies over one video frame of audio per row.
#[derive(Debug, Clone)]
pub struct SpectralEmbeddingExtractor {
    dim: usize,
    /// Band centre frequencies in Hz, log spaced.
    centres: Vec<f32>,
}

const MIN_HZ: f32 = 80.0;
const MAX_HZ: f32 = 7_600.0;
const ENERGY_FLOOR: f32 = 1e-6;

impl SpectralEmbeddingExtractor {
    pub fn new(dim: usize) -> Self {
        let centres = (0..dim)
            .map(|i| {
                let frac = if dim > 1 { i as f32 / (dim - 1) as f32 } else { 0.0 };
                MIN_HZ * (MAX_HZ / MIN_HZ).powf(frac)
            })
            .collect();
        Self { dim, centres }
    }

    /// Energy of `window` at `freq`, normalised so silence is 0.
    fn band(&self, window: &[f32], freq: f32) -> f32 {
        let w = 2.0 * std::f32::consts::PI * freq / EMBEDDING_SAMPLE_RATE as f32;
        let (mut re, mut im) = (0.0f32, 0.0f32);
        for (n, x) in window.iter().enumerate() {
            let phase = w * n as f32;
            re += x * phase.cos();
            im -= x * phase.sin();
        }
        let energy = (re * re + im * im) / window.len().max(1) as f32;
        ((energy + ENERGY_FLOOR).ln() - ENERGY_FLOOR.ln()) / -ENERGY_FLOOR.ln()
    }
}

impl AudioEmbeddingExtractor for SpectralEmbeddingExtractor {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, waveform: &[f32], sample_rate: u32, frame_count: usize) -> Result<Array2<f32>> {
        if sample_rate == 0 {
            return Err(TalkError::embedding("sample rate is zero"));
        }
        let audio = resample(waveform, sample_rate, EMBEDDING_SAMPLE_RATE)?;
        let hop = (EMBEDDING_SAMPLE_RATE / FPS) as usize;

        let mut out = Array2::<f32>::zeros((frame_count, self.dim));
        for f in 0..frame_count {
            let start = f * hop;
            if start >= audio.len() {
                break;
            }
            let window = &audio[start..(start + hop).min(audio.len())];
            for (j, freq) in self.centres.iter().enumerate() {
                out[[f, j]] = self.band(window, *freq);
            }
        }
        Ok(out)
    }
}

/// Mono resampling with a sinc interpolator.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to as f64 / from as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1)
        .map_err(|e| TalkError::embedding(format!("resampler creation failed: {}", e)))?;
    let waves_in = vec![samples.to_vec()];
    let waves_out = resampler
        .process(&waves_in, None)
        .map_err(|e| TalkError::embedding(format!("resampling failed: {}", e)))?;
    Ok(waves_out.into_iter().next().unwrap_or_default())
}
