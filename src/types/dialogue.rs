//! Parsed dialogue turns.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One utterance of the dialogue, in script order.
///
/// Turns are immutable once parsed; `order` is the zero-based position in
/// the parsed sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueTurn {
    /// Speaker identifier (1 or 2 for a valid two-person script).
    pub speaker_id: u8,
    /// Text spoken in this turn.
    pub text: String,
    /// Position of the turn in the script.
    pub order: usize,
}

impl DialogueTurn {
    /// Creates a new turn.
    pub fn new(speaker_id: u8, text: impl Into<String>, order: usize) -> Self {
        Self {
            speaker_id,
            text: text.into(),
            order,
        }
    }
}

/// Returns the distinct speaker ids appearing in `turns`, ascending.
pub fn distinct_speakers(turns: &[DialogueTurn]) -> BTreeSet<u8> {
    turns.iter().map(|t| t.speaker_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_speakers_dedupes() {
        let turns = vec![
            DialogueTurn::new(1, "a", 0),
            DialogueTurn::new(2, "b", 1),
            DialogueTurn::new(1, "c", 2),
        ];
        let speakers = distinct_speakers(&turns);
        assert_eq!(speakers.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn distinct_speakers_empty() {
        assert!(distinct_speakers(&[]).is_empty());
    }
}
