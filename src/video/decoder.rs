//! Reference latent decoder: each latent token tints its cell of the
//! composite frame.

use image::{Rgb, RgbImage};

use crate::dist::DenoisingState;
use crate::error::{Result, TalkError};
use crate::frame::CompositeFrame;

/// Largest per-channel offset a token can apply, in 8-bit levels.
const MAX_TINT: f32 = 48.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decodes `frame_count` RGB frames at the composite's size.
    pub fn decode(&self, state: &DenoisingState, composite: &CompositeFrame) -> Result<Vec<RgbImage>> {
        let g = &state.geometry;
        if state.latent.dim() != (g.seq_len(), g.channels) {
            return Err(TalkError::inference(format!(
                "latent {:?} does not match geometry ({}, {})",
                state.latent.dim(),
                g.seq_len(),
                g.channels
            )));
        }
        if g.channels == 0 {
            return Err(TalkError::inference("latent has no channels"));
        }

        // Per-token RGB offsets.
        let tints: Vec<[f32; 3]> = state
            .latent
            .rows()
            .into_iter()
            .map(|row| {
                let mut t = [0.0f32; 3];
                for (ch, v) in t.iter_mut().enumerate() {
                    *v = MAX_TINT * row[ch % g.channels].tanh();
                }
                t
            })
            .collect();

        let (width, height) = (composite.width(), composite.height());
        let col_of: Vec<usize> = (0..width)
            .map(|x| (x as u64 * g.grid_w as u64 / width.max(1) as u64) as usize)
            .collect();
        let row_of: Vec<usize> = (0..height)
            .map(|y| (y as u64 * g.grid_h as u64 / height.max(1) as u64) as usize)
            .collect();

        let per_frame = g.tokens_per_frame();
        let frames = (0..g.frame_count)
            .map(|v| {
                let base = g.latent_frame_of(v) * per_frame;
                RgbImage::from_fn(width, height, |x, y| {
                    let token = base + row_of[y as usize] * g.grid_w + col_of[x as usize];
                    let tint = tints[token];
                    let px = composite.image.get_pixel(x, y).0;
                    Rgb([
                        (px[0] as f32 + tint[0]).round().clamp(0.0, 255.0) as u8,
                        (px[1] as f32 + tint[1]).round().clamp(0.0, 255.0) as u8,
                        (px[2] as f32 + tint[2]).round().clamp(0.0, 255.0) as u8,
                    ])
                })
            })
            .collect();
        Ok(frames)
    }
}
