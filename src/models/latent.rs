//! Latent token layout and seeded noise.

use std::ops::Range;

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::types::{GenerationParams, TEMPORAL_STRIDE};

/// Mapping between video frames/pixels and latent tokens.
///
/// Tokens are ordered frame-major, then row, then column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentGeometry {
    pub latent_frames: usize,
    pub grid_h: usize,
    pub grid_w: usize,
    pub channels: usize,
    pub frame_count: usize,
}

impl LatentGeometry {
    /// Geometry for a request; each token covers `patch` pixels per side
    /// (the last row/column may cover fewer).
    pub fn new(params: &GenerationParams, patch: u32, channels: usize) -> Self {
        let patch = patch.max(1);
        let frame_count = params.frame_count.max(1) as usize;
        Self {
            latent_frames: (frame_count - 1) / TEMPORAL_STRIDE as usize + 1,
            grid_h: params.resolution.height.div_ceil(patch).max(1) as usize,
            grid_w: params.resolution.width.div_ceil(patch).max(1) as usize,
            channels,
            frame_count,
        }
    }

    pub fn tokens_per_frame(&self) -> usize {
        self.grid_h * self.grid_w
    }

    /// Total sequence length.
    pub fn seq_len(&self) -> usize {
        self.latent_frames * self.tokens_per_frame()
    }

    /// (latent frame, grid row, grid column) of a token.
    pub fn position(&self, token: usize) -> (usize, usize, usize) {
        let per_frame = self.tokens_per_frame();
        let f = token / per_frame;
        let s = token % per_frame;
        (f, s / self.grid_w, s % self.grid_w)
    }

    /// Spatial index (row-major cell) of a token.
    pub fn cell(&self, token: usize) -> usize {
        token % self.tokens_per_frame()
    }

    /// Video frame whose audio conditions latent frame `f`.
    ///
    /// Latent frame 0 is video frame 0; latent frame f > 0 covers video frames
    /// `4f-3 ..= 4f` and takes the last of them.
    pub fn video_frame(&self, latent_frame: usize) -> usize {
        (latent_frame * TEMPORAL_STRIDE as usize).min(self.frame_count - 1)
    }

    /// Latent frame that decodes into video frame `v`.
    pub fn latent_frame_of(&self, video_frame: usize) -> usize {
        let stride = TEMPORAL_STRIDE as usize;
        (video_frame.div_ceil(stride)).min(self.latent_frames - 1)
    }
}

/// Standard normal noise for one token, reproducible from `(key, token)`.
pub fn token_noise(key: u64, token: usize, channels: usize) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(key);
    rng.set_stream(token as u64);
    (0..channels).map(|_| StandardNormal.sample(&mut rng)).collect()
}

/// Initial latent rows `rows` for `seed`; any split of the sequence yields the
/// same values for the same token.
pub fn initial_noise(seed: u64, rows: Range<usize>, channels: usize) -> Array2<f32> {
    let n = rows.len();
    let mut out = Array2::<f32>::zeros((n, channels));
    for (i, token) in rows.enumerate() {
        for (j, v) in token_noise(seed, token, channels).into_iter().enumerate() {
            out[[i, j]] = v;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    fn params(frames: u32, w: u32, h: u32) -> GenerationParams {
        GenerationParams {
            frame_count: frames,
            resolution: Resolution::new(w, h),
            ..Default::default()
        }
    }

    #[test]
    fn default_geometry() {
        let g = LatentGeometry::new(&params(81, 1280, 720), 80, 4);
        assert_eq!(g.latent_frames, 21);
        assert_eq!((g.grid_h, g.grid_w), (9, 16));
        assert_eq!(g.seq_len(), 21 * 144);
    }

    #[test]
    fn partial_patches_round_up() {
        let g = LatentGeometry::new(&params(5, 96, 64), 80, 4);
        assert_eq!((g.grid_h, g.grid_w), (1, 2));
        assert_eq!(g.latent_frames, 2);
    }

    #[test]
    fn positions_and_frames() {
        let g = LatentGeometry::new(&params(9, 64, 32), 16, 4);
        assert_eq!((g.grid_h, g.grid_w), (2, 4));
        assert_eq!(g.position(0), (0, 0, 0));
        assert_eq!(g.position(13), (1, 1, 1));
        assert_eq!(g.cell(13), 5);
        assert_eq!(g.video_frame(0), 0);
        assert_eq!(g.video_frame(2), 8);
        assert_eq!(g.latent_frame_of(0), 0);
        assert_eq!(g.latent_frame_of(1), 1);
        assert_eq!(g.latent_frame_of(4), 1);
        assert_eq!(g.latent_frame_of(5), 2);
        assert_eq!(g.latent_frame_of(8), 2);
    }

    #[test]
    fn noise_is_split_invariant() {
        let full = initial_noise(42, 0..10, 3);
        let tail = initial_noise(42, 6..10, 3);
        assert_eq!(full.slice(ndarray::s![6.., ..]), tail);
        assert_ne!(initial_noise(43, 0..10, 3), full);
    }
}
