//! Reference prompt encoder.
//!
//! Characters are hashed into a fixed vocabulary, embedded, mean pooled and
//! projected. An empty prompt encodes to zeros.

use ndarray::Array2;

use super::params::{init_matrix, linear, ParamSet};
use crate::config::DitConfig;
use crate::error::Result;

const EMBED: &str = "text.embed";
const PROJ: &str = "text.proj";

/// Hashed-token text encoder.
#[derive(Debug, Clone, Copy)]
pub struct TextEncoder {
    vocab: usize,
    dim: usize,
}

impl TextEncoder {
    pub fn new(config: &DitConfig) -> Self {
        Self {
            vocab: config.text_vocab,
            dim: config.text_dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Freshly initialized weights; identical for the same seed.
    pub fn checkpoint(&self, seed: u64) -> ParamSet {
        let mut p = ParamSet::new();
        // Embedding rows are unit-variance; init_matrix scales by the row count.
        let embed = init_matrix(seed, 100, self.vocab, self.dim) * (self.vocab as f32).sqrt();
        p.push(EMBED, embed);
        p.push(PROJ, init_matrix(seed, 101, self.dim, self.dim));
        p
    }

    /// Token ids of `text`: one per non-whitespace character.
    pub fn tokenize(&self, text: &str) -> Vec<usize> {
        text.chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| {
                let mut buf = [0u8; 4];
                (fnv1a(c.encode_utf8(&mut buf).as_bytes()) % self.vocab as u64) as usize
            })
            .collect()
    }

    /// Pooled prompt embedding of length `dim`.
    pub fn encode(&self, params: &ParamSet, text: &str) -> Result<Vec<f32>> {
        let tokens = self.tokenize(text);
        if tokens.is_empty() {
            return Ok(vec![0.0; self.dim]);
        }
        let embed: &Array2<f32> = params.get(EMBED)?;
        let proj = params.get(PROJ)?;

        let mut pooled = vec![0.0f32; self.dim];
        for &t in &tokens {
            for (p, e) in pooled.iter_mut().zip(embed.row(t)) {
                *p += e;
            }
        }
        let n = tokens.len() as f32;
        for p in pooled.iter_mut() {
            *p /= n;
        }
        Ok(linear(&pooled, proj).into_iter().map(f32::tanh).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
