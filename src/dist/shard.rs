//! Contiguous partitioning of the token sequence across ranks.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TalkError};

/// The slice `[start, end)` of the sequence owned by rank `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceShard {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl SequenceShard {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Splits `len` tokens into `parts` balanced, non-empty, contiguous shards.
    ///
    /// The first `len % parts` shards are one token longer.
    pub fn partition(len: usize, parts: usize) -> Result<Vec<SequenceShard>> {
        if parts == 0 {
            return Err(TalkError::unsupported_parameter("cannot split a sequence into 0 shards"));
        }
        if len < parts {
            return Err(TalkError::unsupported_parameter(format!(
                "sequence of {} tokens is shorter than the {} ranks it must cover",
                len, parts
            )));
        }
        Ok((0..parts)
            .map(|index| {
                let r = balanced_range(len, parts, index);
                SequenceShard {
                    index,
                    start: r.start,
                    end: r.end,
                }
            })
            .collect())
    }
}

/// Range of part `index` when `len` items are split into `parts` balanced runs.
/// Parts may be empty when `len < parts`.
pub fn balanced_range(len: usize, parts: usize, index: usize) -> Range<usize> {
    let base = len / parts;
    let extra = len % parts;
    let start = index * base + index.min(extra);
    let size = base + usize::from(index < extra);
    start..start + size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn partition_covers_without_gaps() {
        for len in [1usize, 7, 8, 9, 100, 1013] {
            for parts in 1..=8 {
                if len < parts {
                    continue;
                }
                let shards = SequenceShard::partition(len, parts).unwrap();
                assert_eq!(shards.len(), parts);
                assert_eq!(shards[0].start, 0);
                assert_eq!(shards[parts - 1].end, len);
                for pair in shards.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
                for (i, s) in shards.iter().enumerate() {
                    assert_eq!(s.index, i);
                    assert!(!s.is_empty());
                }
                let max = shards.iter().map(|s| s.len()).max().unwrap();
                let min = shards.iter().map(|s| s.len()).min().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn first_shards_take_remainder() {
        let shards = SequenceShard::partition(10, 4).unwrap();
        let lens: Vec<usize> = shards.iter().map(|s| s.len()).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
    }

    #[test]
    fn too_short_sequence_rejected() {
        let err = SequenceShard::partition(3, 4).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedParameter);
        assert!(SequenceShard::partition(3, 0).is_err());
    }

    #[test]
    fn balanced_range_allows_empty_parts() {
        assert_eq!(balanced_range(2, 4, 0), 0..1);
        assert_eq!(balanced_range(2, 4, 1), 1..2);
        assert_eq!(balanced_range(2, 4, 3), 2..2);
    }
}
