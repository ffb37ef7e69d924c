//! Fully sharded parameter placement.
//!
//! Each rank keeps a contiguous slice of every flattened parameter. Before a
//! forward pass the full parameters are all-gathered into a transient
//! [`ParamSet`]; it is dropped after use so only the shards stay resident.
//! The first parameters whose cumulative size fits the persistent budget are
//! never sharded.

use ndarray::Array2;
use tracing::debug;

use super::group::ProcessGroup;
use super::shard::balanced_range;
use crate::error::{Result, TalkError};
use crate::models::ParamSet;

#[derive(Debug, Clone)]
enum Residency {
    Resident(Array2<f32>),
    Sharded {
        shape: (usize, usize),
        local: Vec<f32>,
    },
}

/// One rank's share of a model's parameters. Never mutated after sharding.
#[derive(Debug, Clone)]
pub struct ShardedModelState {
    rank: usize,
    world_size: usize,
    entries: Vec<(String, Residency)>,
}

impl ShardedModelState {
    /// Splits `checkpoint` for `rank`. With `shard == false` every parameter
    /// stays resident.
    pub fn from_checkpoint(
        checkpoint: ParamSet,
        rank: usize,
        world_size: usize,
        shard: bool,
        persistent_param_count: usize,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(TalkError::sharding(format!(
                "rank {} is outside a group of {}",
                rank, world_size
            )));
        }

        let mut budget_left = persistent_param_count;
        let mut persistent = true;
        let mut entries = Vec::with_capacity(checkpoint.len());
        for (name, param) in checkpoint.into_entries() {
            let n = param.len();
            let keep = !shard || (persistent && n <= budget_left);
            if keep {
                if shard {
                    budget_left -= n;
                }
                entries.push((name, Residency::Resident(param)));
                continue;
            }
            persistent = false;
            let shape = param.dim();
            let flat: Vec<f32> = param.iter().copied().collect();
            let local = flat[balanced_range(n, world_size, rank)].to_vec();
            entries.push((name, Residency::Sharded { shape, local }));
        }

        let state = Self {
            rank,
            world_size,
            entries,
        };
        debug!(
            "Rank {} holds {} of {} parameter tensors fully, {} local elements",
            rank,
            state.resident_count(),
            state.entries.len(),
            state.local_elements()
        );
        Ok(state)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Tensors kept whole on this rank.
    pub fn resident_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, r)| matches!(r, Residency::Resident(_)))
            .count()
    }

    /// Elements stored on this rank (resident tensors plus local slices).
    pub fn local_elements(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, r)| match r {
                Residency::Resident(p) => p.len(),
                Residency::Sharded { local, .. } => local.len(),
            })
            .sum()
    }

    fn has_sharded(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, r)| matches!(r, Residency::Sharded { .. }))
    }

    /// Rebuilds the full parameter set with one all-gather.
    ///
    /// Every rank of the group must call this together.
    pub fn materialize(&self, group: &mut ProcessGroup) -> Result<ParamSet> {
        let gathered = if self.has_sharded() {
            let packed: Vec<f32> = self
                .entries
                .iter()
                .filter_map(|(_, r)| match r {
                    Residency::Sharded { local, .. } => Some(local.as_slice()),
                    Residency::Resident(_) => None,
                })
                .flatten()
                .copied()
                .collect();
            group.all_gather(&packed)?
        } else {
            Vec::new()
        };

        let mut cursors = vec![0usize; gathered.len()];
        let mut out = ParamSet::new();
        for (name, residency) in &self.entries {
            match residency {
                Residency::Resident(p) => out.push(name.clone(), p.clone()),
                Residency::Sharded { shape, .. } => {
                    let n = shape.0 * shape.1;
                    let mut flat = Vec::with_capacity(n);
                    for (src, payload) in gathered.iter().enumerate() {
                        let take = balanced_range(n, self.world_size, src).len();
                        let from = cursors[src];
                        let piece = payload.get(from..from + take).ok_or_else(|| {
                            TalkError::inference(format!(
                                "rank {} sent a short shard for {}",
                                src, name
                            ))
                        })?;
                        flat.extend_from_slice(piece);
                        cursors[src] += take;
                    }
                    let full = Array2::from_shape_vec(*shape, flat)
                        .map_err(|e| TalkError::inference(format!("{}: {}", name, e)))?;
                    out.push(name.clone(), full);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::dist::transport::{channel_mesh, LoopbackTransport, Transport};
    use std::thread;

    fn checkpoint() -> ParamSet {
        let mut p = ParamSet::new();
        p.push("bias", Array2::from_shape_fn((1, 3), |(_, j)| j as f32));
        p.push("w1", Array2::from_shape_fn((4, 5), |(i, j)| (i * 5 + j) as f32));
        p.push("w2", Array2::from_shape_fn((2, 2), |(i, j)| -((i * 2 + j) as f32)));
        p
    }

    #[test]
    fn unsharded_keeps_everything() {
        let state = ShardedModelState::from_checkpoint(checkpoint(), 1, 4, false, 0).unwrap();
        assert_eq!(state.resident_count(), 3);
        assert_eq!(state.local_elements(), 3 + 20 + 4);
    }

    #[test]
    fn persistent_budget_counts_leading_params() {
        // 3 fits, 3 + 20 does not; w2 is sharded even though it would fit.
        let state = ShardedModelState::from_checkpoint(checkpoint(), 0, 4, true, 10).unwrap();
        assert_eq!(state.resident_count(), 1);
        // bias 3 + w1 slice 5 + w2 slice 1
        assert_eq!(state.local_elements(), 3 + 5 + 1);
    }

    #[test]
    fn invalid_rank_is_sharding_error() {
        let err = ShardedModelState::from_checkpoint(checkpoint(), 4, 4, true, 0).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Sharding);
    }

    #[test]
    fn materialize_restores_checkpoint() {
        let timeouts = TimeoutConfig::default();
        let handles: Vec<_> = channel_mesh(3)
            .into_iter()
            .map(|t| {
                let timeouts = timeouts.clone();
                thread::spawn(move || {
                    let rank = t.rank();
                    let mut group = ProcessGroup::new(Box::new(t), &timeouts);
                    let state =
                        ShardedModelState::from_checkpoint(checkpoint(), rank, 3, true, 3).unwrap();
                    state.materialize(&mut group).unwrap()
                })
            })
            .collect();
        let expected = checkpoint();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
    }

    #[test]
    fn single_rank_materialize() {
        let mut group =
            ProcessGroup::new(Box::new(LoopbackTransport::new()), &TimeoutConfig::default());
        let state = ShardedModelState::from_checkpoint(checkpoint(), 0, 1, true, 0).unwrap();
        assert_eq!(state.materialize(&mut group).unwrap(), checkpoint());
    }
}
