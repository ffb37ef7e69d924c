//! Reference diffusion transformer: one attention block over latent tokens,
//! conditioned on the composite frame, the prompt and routed audio.
//!
//! Every per-token operation is row-local and accumulates in a fixed order,
//! so a shard of rows produces exactly the rows the full sequence would.

use std::ops::Range;

use ndarray::{Array2, Array3};

use super::latent::LatentGeometry;
use super::params::{init_matrix, linear_into, ParamSet};
use crate::config::DitConfig;
use crate::error::{Result, TalkError};

const TIME_FEATURES: usize = 16;
const POS_FEATURES: usize = 24;

/// Parameter names in checkpoint order. Input projections come first so a
/// persistent-parameter budget keeps the small ones resident.
pub const DIT_PARAM_NAMES: [&str; 13] = [
    "dit.image_in",
    "dit.time_in",
    "dit.patch_in",
    "dit.text_in",
    "dit.audio_in",
    "dit.pos_in",
    "dit.wq",
    "dit.wk",
    "dit.wv",
    "dit.wo",
    "dit.ff_up",
    "dit.ff_down",
    "dit.head_out",
];

/// Which conditioning signals a forward pass sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Unconditional,
    Text,
    Audio,
}

impl Branch {
    pub const ALL: [Branch; 3] = [Branch::Unconditional, Branch::Text, Branch::Audio];

    fn uses_text(self) -> bool {
        matches!(self, Branch::Text)
    }

    fn uses_audio(self) -> bool {
        matches!(self, Branch::Audio)
    }
}

/// Per-request conditioning, identical on every rank.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// Pooled prompt embedding.
    pub text: Vec<f32>,
    /// Mean RGB of each grid cell in `[-1, 1]`, `(cells, 3)`.
    pub cell_colors: Array2<f32>,
    /// Per-speaker embeddings `(frame_count, audio_dim)`, speaker 1 first.
    pub audio: Vec<Array2<f32>>,
    /// Per-cell speaker weights, `(cells, 2)`.
    pub routing: Array2<f32>,
}

impl Conditioning {
    /// Audio feature of a token: routing-weighted sum of the speakers'
    /// embeddings at the token's video frame.
    fn audio_for(&self, geometry: &LatentGeometry, token: usize, out: &mut [f32]) {
        let (f, _, _) = geometry.position(token);
        let cell = geometry.cell(token);
        let vf = geometry.video_frame(f);
        out.iter_mut().for_each(|o| *o = 0.0);
        for (k, emb) in self.audio.iter().enumerate() {
            let w = self.routing[[cell, k]];
            if w == 0.0 {
                continue;
            }
            for (o, e) in out.iter_mut().zip(emb.row(vf)) {
                *o += w * e;
            }
        }
    }
}

/// Shape-only description of the transformer.
#[derive(Debug, Clone, Copy)]
pub struct DiffusionTransformer {
    hidden: usize,
    heads: usize,
    channels: usize,
    text_dim: usize,
    audio_dim: usize,
}

struct Weights<'a> {
    image_in: &'a Array2<f32>,
    time_in: &'a Array2<f32>,
    patch_in: &'a Array2<f32>,
    text_in: &'a Array2<f32>,
    audio_in: &'a Array2<f32>,
    pos_in: &'a Array2<f32>,
    wq: &'a Array2<f32>,
    wk: &'a Array2<f32>,
    wv: &'a Array2<f32>,
    wo: &'a Array2<f32>,
    ff_up: &'a Array2<f32>,
    ff_down: &'a Array2<f32>,
    head_out: &'a Array2<f32>,
}

impl<'a> Weights<'a> {
    fn bind(params: &'a ParamSet) -> Result<Self> {
        Ok(Self {
            image_in: params.get("dit.image_in")?,
            time_in: params.get("dit.time_in")?,
            patch_in: params.get("dit.patch_in")?,
            text_in: params.get("dit.text_in")?,
            audio_in: params.get("dit.audio_in")?,
            pos_in: params.get("dit.pos_in")?,
            wq: params.get("dit.wq")?,
            wk: params.get("dit.wk")?,
            wv: params.get("dit.wv")?,
            wo: params.get("dit.wo")?,
            ff_up: params.get("dit.ff_up")?,
            ff_down: params.get("dit.ff_down")?,
            head_out: params.get("dit.head_out")?,
        })
    }
}

impl DiffusionTransformer {
    pub fn new(config: &DitConfig) -> Self {
        Self {
            hidden: config.hidden_dim,
            heads: config.num_heads.max(1),
            channels: config.latent_channels,
            text_dim: config.text_dim,
            audio_dim: config.audio_dim,
        }
    }

    pub fn num_heads(&self) -> usize {
        self.heads
    }

    pub fn head_dim(&self) -> usize {
        self.hidden / self.heads
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn audio_dim(&self) -> usize {
        self.audio_dim
    }

    /// Freshly initialized weights in [`DIT_PARAM_NAMES`] order.
    pub fn checkpoint(&self, seed: u64) -> ParamSet {
        let d = self.hidden;
        let shapes = [
            (3, d),
            (TIME_FEATURES, d),
            (self.channels, d),
            (self.text_dim, d),
            (self.audio_dim, d),
            (POS_FEATURES, d),
            (d, d),
            (d, d),
            (d, d),
            (d, d),
            (d, 2 * d),
            (2 * d, d),
            (d, self.channels),
        ];
        let mut params = ParamSet::new();
        for (i, (name, (rows, cols))) in DIT_PARAM_NAMES.iter().zip(shapes).enumerate() {
            params.push(*name, init_matrix(seed, 200 + i as u64, rows, cols));
        }
        params
    }

    /// Velocity prediction for `latent`, the rows `rows` of the full sequence.
    ///
    /// `attention` maps this shard's `(rows, heads, head_dim)` Q/K/V to
    /// attention output over the whole sequence.
    #[allow(clippy::too_many_arguments)]
    pub fn forward<F>(
        &self,
        params: &ParamSet,
        latent: &Array2<f32>,
        rows: Range<usize>,
        geometry: &LatentGeometry,
        conditioning: &Conditioning,
        branch: Branch,
        timestep: f32,
        mut attention: F,
    ) -> Result<Array2<f32>>
    where
        F: FnMut(&Array3<f32>, &Array3<f32>, &Array3<f32>) -> Result<Array3<f32>>,
    {
        let n = rows.len();
        if latent.dim() != (n, self.channels) {
            return Err(TalkError::inference(format!(
                "latent shard {:?} does not match {} rows of {} channels",
                latent.dim(),
                n,
                self.channels
            )));
        }
        if self.hidden % self.heads != 0 {
            return Err(TalkError::inference(format!(
                "hidden size {} is not divisible by {} heads",
                self.hidden, self.heads
            )));
        }
        if branch.uses_audio() {
            for (k, emb) in conditioning.audio.iter().enumerate() {
                if emb.nrows() < geometry.frame_count || emb.ncols() != self.audio_dim {
                    return Err(TalkError::inference(format!(
                        "speaker {} embedding {:?} does not cover {} frames of {} features",
                        k + 1,
                        emb.dim(),
                        geometry.frame_count,
                        self.audio_dim
                    )));
                }
            }
        }

        let w = Weights::bind(params)?;
        let d = self.hidden;
        let time = time_features(timestep);
        let mut time_emb = vec![0.0f32; d];
        linear_into(&time, w.time_in, &mut time_emb);
        let mut text_emb = vec![0.0f32; d];
        if branch.uses_text() {
            linear_into(&conditioning.text, w.text_in, &mut text_emb);
        }

        let mut hidden = Array2::<f32>::zeros((n, d));
        let mut tmp = vec![0.0f32; d];
        let mut audio = vec![0.0f32; self.audio_dim];
        for (i, token) in rows.clone().enumerate() {
            let cell = geometry.cell(token);
            let mut h = hidden.row_mut(i);

            let x: Vec<f32> = latent.row(i).to_vec();
            linear_into(&x, w.patch_in, &mut tmp);
            h.iter_mut().zip(&tmp).for_each(|(h, t)| *h = *t);

            let color: Vec<f32> = conditioning.cell_colors.row(cell).to_vec();
            linear_into(&color, w.image_in, &mut tmp);
            h.iter_mut().zip(&tmp).for_each(|(h, t)| *h += t);

            linear_into(&pos_features(geometry, token), w.pos_in, &mut tmp);
            h.iter_mut().zip(&tmp).for_each(|(h, t)| *h += t);

            h.iter_mut().zip(&time_emb).for_each(|(h, t)| *h += t);
            if branch.uses_text() {
                h.iter_mut().zip(&text_emb).for_each(|(h, t)| *h += t);
            }
            if branch.uses_audio() {
                conditioning.audio_for(geometry, token, &mut audio);
                linear_into(&audio, w.audio_in, &mut tmp);
                h.iter_mut().zip(&tmp).for_each(|(h, t)| *h += t);
            }
        }

        let (heads, hd) = (self.heads, self.head_dim());
        let mut q = Array3::<f32>::zeros((n, heads, hd));
        let mut k = Array3::<f32>::zeros((n, heads, hd));
        let mut v = Array3::<f32>::zeros((n, heads, hd));
        for i in 0..n {
            let h: Vec<f32> = hidden.row(i).to_vec();
            for (proj, target) in [(w.wq, &mut q), (w.wk, &mut k), (w.wv, &mut v)] {
                linear_into(&h, proj, &mut tmp);
                for (j, val) in tmp.iter().enumerate() {
                    target[[i, j / hd, j % hd]] = *val;
                }
            }
        }

        let attn = attention(&q, &k, &v)?;
        if attn.dim() != (n, heads, hd) {
            return Err(TalkError::inference(format!(
                "attention returned {:?}, expected {:?}",
                attn.dim(),
                (n, heads, hd)
            )));
        }

        let mut out = Array2::<f32>::zeros((n, self.channels));
        let mut up = vec![0.0f32; 2 * d];
        let mut head = vec![0.0f32; self.channels];
        for i in 0..n {
            let a: Vec<f32> = attn.slice(ndarray::s![i, .., ..]).iter().copied().collect();
            linear_into(&a, w.wo, &mut tmp);
            let mut h: Vec<f32> = hidden.row(i).iter().zip(&tmp).map(|(h, t)| h + t).collect();

            linear_into(&h, w.ff_up, &mut up);
            up.iter_mut().for_each(|u| *u = u.max(0.0));
            linear_into(&up, w.ff_down, &mut tmp);
            h.iter_mut().zip(&tmp).for_each(|(h, t)| *h += t);

            linear_into(&h, w.head_out, &mut head);
            out.row_mut(i).iter_mut().zip(&head).for_each(|(o, v)| *o = *v);
        }
        Ok(out)
    }
}

fn time_features(timestep: f32) -> Vec<f32> {
    let half = TIME_FEATURES / 2;
    let mut out = Vec::with_capacity(TIME_FEATURES);
    for i in 0..half {
        let freq = (-(10_000f32).ln() * i as f32 / half as f32).exp();
        out.push((timestep * freq).sin());
    }
    for i in 0..half {
        let freq = (-(10_000f32).ln() * i as f32 / half as f32).exp();
        out.push((timestep * freq).cos());
    }
    out
}

fn pos_features(geometry: &LatentGeometry, token: usize) -> Vec<f32> {
    let (f, r, c) = geometry.position(token);
    let mut out = Vec::with_capacity(POS_FEATURES);
    for coord in [f, r, c] {
        for i in 0..POS_FEATURES / 6 {
            let angle = coord as f32 / (1u32 << (2 * i)) as f32;
            out.push(angle.sin());
            out.push(angle.cos());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::attend;
    use crate::types::{GenerationParams, Resolution};
    use ndarray::s;

    fn setup() -> (DiffusionTransformer, ParamSet, LatentGeometry, Conditioning) {
        let config = DitConfig::default();
        let dit = DiffusionTransformer::new(&config);
        let params = dit.checkpoint(config.weight_seed);
        let gp = GenerationParams {
            frame_count: 5,
            resolution: Resolution::new(160, 80),
            ..Default::default()
        };
        let geometry = LatentGeometry::new(&gp, 40, config.latent_channels);
        let cells = geometry.tokens_per_frame();
        let cond = Conditioning {
            text: vec![0.3; config.text_dim],
            cell_colors: Array2::from_shape_fn((cells, 3), |(i, j)| (i + j) as f32 / 10.0 - 0.5),
            audio: vec![
                Array2::from_elem((5, config.audio_dim), 0.5),
                Array2::from_elem((5, config.audio_dim), -0.5),
            ],
            routing: Array2::from_shape_fn((cells, 2), |(i, k)| {
                if (i % 4 < 2) == (k == 0) {
                    1.0
                } else {
                    0.0
                }
            }),
        };
        (dit, params, geometry, cond)
    }

    #[test]
    fn checkpoint_order_and_shapes() {
        let config = DitConfig::default();
        let dit = DiffusionTransformer::new(&config);
        let params = dit.checkpoint(7);
        let names: Vec<&str> = params.iter().map(|(n, _)| n).collect();
        assert_eq!(names, DIT_PARAM_NAMES.to_vec());
        assert_eq!(params.get("dit.head_out").unwrap().dim(), (32, 4));
        assert_eq!(dit.checkpoint(7), params);
    }

    #[test]
    fn branches_differ() {
        let (dit, params, geometry, cond) = setup();
        let n = geometry.seq_len();
        let latent = Array2::from_elem((n, 4), 0.1);
        let run = |b| {
            dit.forward(&params, &latent, 0..n, &geometry, &cond, b, 500.0, |q, k, v| {
                Ok(attend(q, k, v))
            })
            .unwrap()
        };
        let u = run(Branch::Unconditional);
        assert_ne!(u, run(Branch::Text));
        assert_ne!(u, run(Branch::Audio));
        assert!(u.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn rejects_short_audio() {
        let (dit, params, geometry, mut cond) = setup();
        cond.audio[1] = Array2::zeros((2, 16));
        let n = geometry.seq_len();
        let latent = Array2::zeros((n, 4));
        let err = dit
            .forward(&params, &latent, 0..n, &geometry, &cond, Branch::Audio, 1.0, |q, k, v| {
                Ok(attend(q, k, v))
            })
            .unwrap_err();
        assert!(err.message.contains("speaker 2"));
    }

    #[test]
    fn row_local_outside_attention() {
        // With attention fixed to zero every row depends only on itself.
        let (dit, params, geometry, cond) = setup();
        let n = geometry.seq_len();
        let latent = Array2::from_shape_fn((n, 4), |(i, j)| (i * 4 + j) as f32 / 50.0);
        let zero = |q: &Array3<f32>, _: &Array3<f32>, _: &Array3<f32>| -> Result<Array3<f32>> {
            Ok(Array3::zeros(q.dim()))
        };
        let full = dit
            .forward(&params, &latent, 0..n, &geometry, &cond, Branch::Audio, 3.0, zero)
            .unwrap();
        let part = latent.slice(s![3..7, ..]).to_owned();
        let shard = dit
            .forward(&params, &part, 3..7, &geometry, &cond, Branch::Audio, 3.0, zero)
            .unwrap();
        assert_eq!(full.slice(s![3..7, ..]), shard);
    }
}
