//! Named parameter tensors in declaration order.

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{Result, TalkError};

/// Ordered collection of 2-D parameters. Vectors are stored as `(1, n)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    entries: Vec<(String, Array2<f32>)>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Array2<f32>) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Result<&Array2<f32>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| TalkError::inference(format!("missing parameter '{}'", name)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of elements over all tensors.
    pub fn total_elements(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array2<f32>)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn into_entries(self) -> Vec<(String, Array2<f32>)> {
        self.entries
    }
}

/// Gaussian matrix scaled by `1/sqrt(rows)`, reproducible from `(seed, index)`.
pub fn init_matrix(seed: u64, index: u64, rows: usize, cols: usize) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(index);
    let scale = 1.0 / (rows.max(1) as f32).sqrt();
    Array2::from_shape_simple_fn((rows, cols), || {
        let v: f32 = StandardNormal.sample(&mut rng);
        v * scale
    })
}

/// `out[j] = sum_i x[i] * w[i, j]`, accumulated in index order.
pub fn linear_into(x: &[f32], w: &Array2<f32>, out: &mut [f32]) {
    let (rows, cols) = w.dim();
    debug_assert_eq!(x.len(), rows);
    debug_assert_eq!(out.len(), cols);
    for (j, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for (i, xi) in x.iter().enumerate() {
            acc += xi * w[[i, j]];
        }
        *o = acc;
    }
}

/// Allocating form of [`linear_into`].
pub fn linear(x: &[f32], w: &Array2<f32>) -> Vec<f32> {
    let mut out = vec![0.0; w.ncols()];
    linear_into(x, w, &mut out);
    out
}
