//! Sequence-parallel self-attention combining Ulysses and Ring exchanges.
//!
//! Rank `r` sits at ring index `r / ulysses` and Ulysses index `r % ulysses`.
//! The ranks of one Ulysses group own consecutive shards, so each Ulysses
//! group covers one contiguous block of the sequence.
//!
//! Per call:
//! 1. all-to-all inside the Ulysses group: rows of the local shard are traded
//!    for one head group over the whole block;
//! 2. all-to-all among ring peers holding the same head group: K and V of
//!    every block are shared, giving the full sequence;
//! 3. softmax attention for the block's queries over all keys;
//! 4. all-to-all inside the Ulysses group back to the row owners.

use ndarray::{s, Array3, ArrayView3, Axis};

use super::group::ProcessGroup;
use super::shard::SequenceShard;
use crate::error::{Result, TalkError};

/// Factorization of the group into Ulysses and Ring degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelLayout {
    pub ulysses: usize,
    pub ring: usize,
}

impl ParallelLayout {
    pub fn new(ulysses: usize, ring: usize) -> Self {
        Self { ulysses, ring }
    }

    pub fn world_size(&self) -> usize {
        self.ulysses * self.ring
    }

    /// Checks the layout against the group size and the model's head count.
    pub fn validate(&self, world_size: usize, num_heads: usize) -> Result<()> {
        if self.ulysses == 0 || self.ring == 0 {
            return Err(TalkError::sharding("ulysses_size and ring_size must be at least 1"));
        }
        if self.world_size() != world_size {
            return Err(TalkError::sharding(format!(
                "world_size {} != ulysses_size {} * ring_size {}",
                world_size, self.ulysses, self.ring
            )));
        }
        if num_heads % self.ulysses != 0 {
            return Err(TalkError::sharding(format!(
                "{} attention heads cannot be split over ulysses_size {}",
                num_heads, self.ulysses
            )));
        }
        Ok(())
    }

    pub fn ring_index(&self, rank: usize) -> usize {
        rank / self.ulysses
    }

    pub fn ulysses_index(&self, rank: usize) -> usize {
        rank % self.ulysses
    }

    /// Ranks sharing `rank`'s sequence block, in order.
    pub fn ulysses_group(&self, rank: usize) -> Vec<usize> {
        let base = self.ring_index(rank) * self.ulysses;
        (base..base + self.ulysses).collect()
    }

    /// Ranks holding the same head group as `rank`, in block order.
    pub fn ring_group(&self, rank: usize) -> Vec<usize> {
        let u = self.ulysses_index(rank);
        (0..self.ring).map(|i| i * self.ulysses + u).collect()
    }
}

fn flatten(view: ArrayView3<'_, f32>) -> Vec<f32> {
    view.iter().copied().collect()
}

fn unflatten(data: &[f32], rows: usize, heads: usize, dim: usize) -> Result<Array3<f32>> {
    Array3::from_shape_vec((rows, heads, dim), data.to_vec())
        .map_err(|e| TalkError::inference(format!("attention exchange shape: {}", e)))
}

fn concat_rows(parts: &[Array3<f32>]) -> Result<Array3<f32>> {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| TalkError::inference(format!("attention concat: {}", e)))
}

/// Full-sequence attention output for this rank's shard.
///
/// `q`, `k` and `v` are `(shard_rows, heads, head_dim)` for the local shard.
/// Every rank of the group must call this together with the same `shards`.
pub fn sequence_parallel_attention(
    group: &mut ProcessGroup,
    layout: &ParallelLayout,
    shards: &[SequenceShard],
    q: &Array3<f32>,
    k: &Array3<f32>,
    v: &Array3<f32>,
) -> Result<Array3<f32>> {
    let rank = group.rank();
    let (rows, heads, dim) = q.dim();
    let local = shards
        .get(rank)
        .ok_or_else(|| TalkError::inference(format!("no shard for rank {}", rank)))?;
    if rows != local.len() || k.dim() != q.dim() || v.dim() != q.dim() {
        return Err(TalkError::inference(format!(
            "rank {} attention inputs {:?}/{:?}/{:?} do not match shard of {} rows",
            rank,
            q.dim(),
            k.dim(),
            v.dim(),
            local.len()
        )));
    }
    let hg = heads / layout.ulysses;
    let ulysses_peers = layout.ulysses_group(rank);
    let ring_peers = layout.ring_group(rank);
    let my_group = layout.ulysses_index(rank);

    // 1. rows of my shard, all heads -> rows of my block, my head group.
    let chunks = (0..layout.ulysses)
        .map(|j| {
            let hr = j * hg..(j + 1) * hg;
            let mut chunk = flatten(q.slice(s![.., hr.clone(), ..]));
            chunk.extend(k.slice(s![.., hr.clone(), ..]).iter());
            chunk.extend(v.slice(s![.., hr, ..]).iter());
            chunk
        })
        .collect();
    let received = group.all_to_all_in(&ulysses_peers, chunks)?;

    let mut q_parts = Vec::with_capacity(layout.ulysses);
    let mut k_parts = Vec::with_capacity(layout.ulysses);
    let mut v_parts = Vec::with_capacity(layout.ulysses);
    for (&peer, data) in ulysses_peers.iter().zip(&received) {
        let n = shards[peer].len();
        let block = n * hg * dim;
        if data.len() != 3 * block {
            return Err(TalkError::inference(format!(
                "rank {} sent {} values, expected {}",
                peer,
                data.len(),
                3 * block
            )));
        }
        q_parts.push(unflatten(&data[..block], n, hg, dim)?);
        k_parts.push(unflatten(&data[block..2 * block], n, hg, dim)?);
        v_parts.push(unflatten(&data[2 * block..], n, hg, dim)?);
    }
    let q_block = concat_rows(&q_parts)?;
    let k_block = concat_rows(&k_parts)?;
    let v_block = concat_rows(&v_parts)?;

    // 2. share K/V of my block with ring peers of the same head group.
    let mut kv = flatten(k_block.view());
    kv.extend(v_block.iter());
    let received = group.all_to_all_in(&ring_peers, vec![kv; ring_peers.len()])?;

    let mut k_full = Vec::with_capacity(layout.ring);
    let mut v_full = Vec::with_capacity(layout.ring);
    for (i, data) in received.iter().enumerate() {
        let block_rows: usize = layout
            .ulysses_group(i * layout.ulysses)
            .iter()
            .map(|&r| shards[r].len())
            .sum();
        let half = block_rows * hg * dim;
        if data.len() != 2 * half {
            return Err(TalkError::inference(format!(
                "ring block {} carried {} values, expected {}",
                i,
                data.len(),
                2 * half
            )));
        }
        k_full.push(unflatten(&data[..half], block_rows, hg, dim)?);
        v_full.push(unflatten(&data[half..], block_rows, hg, dim)?);
    }
    let k_full = concat_rows(&k_full)?;
    let v_full = concat_rows(&v_full)?;

    // 3.
    let out_block = attend(&q_block, &k_full, &v_full);

    // 4. back to the owners of each shard in my block.
    let mut offset = 0;
    let chunks = ulysses_peers
        .iter()
        .map(|&peer| {
            let n = shards[peer].len();
            let chunk = flatten(out_block.slice(s![offset..offset + n, .., ..]));
            offset += n;
            chunk
        })
        .collect();
    let received = group.all_to_all_in(&ulysses_peers, chunks)?;

    let mut out = Array3::<f32>::zeros((rows, heads, dim));
    for (j, data) in received.iter().enumerate() {
        let part = unflatten(data, rows, hg, dim)?;
        out.slice_mut(s![.., j * hg..(j + 1) * hg, ..]).assign(&part);
    }
    tracing::trace!(
        "Rank {} attention: block of {} rows, head group {}",
        rank,
        q_block.dim().0,
        my_group
    );
    Ok(out)
}

/// Scaled dot-product attention with a numerically stable softmax.
///
/// Keys are visited in row order, so the result for a query depends only on
/// the full key sequence and not on how it was assembled.
pub fn attend(q: &Array3<f32>, k: &Array3<f32>, v: &Array3<f32>) -> Array3<f32> {
    let (nq, heads, dim) = q.dim();
    let nk = k.dim().0;
    let scale = 1.0 / (dim as f32).sqrt();
    let mut out = Array3::<f32>::zeros((nq, heads, dim));
    let mut scores = vec![0.0f32; nk];

    for i in 0..nq {
        for h in 0..heads {
            let mut max = f32::NEG_INFINITY;
            for (j, score) in scores.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for d in 0..dim {
                    acc += q[[i, h, d]] * k[[j, h, d]];
                }
                *score = acc * scale;
                if *score > max {
                    max = *score;
                }
            }
            let mut denom = 0.0f32;
            for score in scores.iter_mut() {
                *score = (*score - max).exp();
                denom += *score;
            }
            for d in 0..dim {
                let mut acc = 0.0f32;
                for (j, w) in scores.iter().enumerate() {
                    acc += w * v[[j, h, d]];
                }
                out[[i, h, d]] = acc / denom;
            }
        }
    }
    out
}
