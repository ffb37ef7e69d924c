//! Converts free dialogue text into ordered speaker turns.
//!
//! Three formats are recognized, tried in priority order; the first one that
//! matches anywhere in the input is used for the whole input:
//!
//! 1. Tagged: `(s1) hello (s2) hi there`. Tags may appear inline or at line
//!    starts; each tag opens a turn that runs until the next tag.
//! 2. Labeled: `角色1:`, `人物2：`, `A:`/`B:` or `Speaker 1:` labels, one or
//!    several per line (`角色1: 你好 角色2: 你好呀`). Each label opens a turn
//!    that runs until the next label, so unlabeled lines continue a turn.
//! 3. Unlabeled: every non-empty line is a turn, speakers alternate 1, 2, 1...

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::types::DialogueTurn;

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\([sS](\d{1,3})\)").expect("valid regex"));
// Latin labels must start a line or follow whitespace.
static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)(?:角色\s*(\d{1,3})|人物\s*(\d{1,3})|(?:^|\s)(?:[Ss]peaker\s*(\d{1,3})|([AB])))\s*[:：]")
        .expect("valid regex")
});

/// Which format a script was parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFormat {
    Tagged,
    Labeled,
    Unlabeled,
}

/// Stateless dialogue parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptParser;

impl ScriptParser {
    pub fn new() -> Self {
        Self
    }

    /// Parses `text` into turns. Empty input yields no turns.
    pub fn parse(&self, text: &str) -> Vec<DialogueTurn> {
        self.parse_with_format(text).1
    }

    /// Parses `text` and reports the format that was used.
    pub fn parse_with_format(&self, text: &str) -> (ScriptFormat, Vec<DialogueTurn>) {
        let text = text.trim();
        if TAG_RE.is_match(text) {
            return (ScriptFormat::Tagged, parse_tagged(text));
        }
        if LABEL_RE.is_match(text) {
            return (ScriptFormat::Labeled, parse_labeled(text));
        }
        (ScriptFormat::Unlabeled, parse_unlabeled(text))
    }
}

fn speaker_from_digits(digits: &str) -> u8 {
    digits.parse().unwrap_or(u8::MAX)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_tagged(text: &str) -> Vec<DialogueTurn> {
    let tags: Vec<_> = TAG_RE.captures_iter(text).collect();

    if let Some(first) = tags.first().and_then(|c| c.get(0)) {
        if !text[..first.start()].trim().is_empty() {
            debug!("Dropping text before the first speaker tag");
        }
    }

    let mut turns = Vec::with_capacity(tags.len());
    for (order, caps) in tags.iter().enumerate() {
        let (Some(whole), Some(digits)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = tags
            .get(order + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let body = collapse_whitespace(&text[whole.end()..end]);
        turns.push(DialogueTurn::new(speaker_from_digits(digits.as_str()), body, order));
    }
    turns
}

fn parse_labeled(text: &str) -> Vec<DialogueTurn> {
    let labels: Vec<_> = LABEL_RE.captures_iter(text).collect();

    if let Some(first) = labels.first().and_then(|c| c.get(0)) {
        let before = text[..first.start()].trim();
        if !before.is_empty() {
            warn!("Could not attribute text to a speaker: '{}'", before);
        }
    }

    let mut turns = Vec::with_capacity(labels.len());
    for (order, caps) in labels.iter().enumerate() {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let speaker = if let Some(d) = caps.get(1).or(caps.get(2)).or(caps.get(3)) {
            speaker_from_digits(d.as_str())
        } else if caps.get(4).map(|m| m.as_str()) == Some("A") {
            1
        } else {
            2
        };
        let end = labels
            .get(order + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let body = collapse_whitespace(&text[whole.end()..end]);
        turns.push(DialogueTurn::new(speaker, body, order));
    }
    turns
}

fn parse_unlabeled(text: &str) -> Vec<DialogueTurn> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(order, line)| {
            let speaker = if order % 2 == 0 { 1 } else { 2 };
            DialogueTurn::new(speaker, collapse_whitespace(line), order)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(turns: &[DialogueTurn]) -> Vec<(u8, &str)> {
        turns.iter().map(|t| (t.speaker_id, t.text.as_str())).collect()
    }

    #[test]
    fn empty_input_yields_no_turns() {
        assert!(ScriptParser::new().parse("").is_empty());
        assert!(ScriptParser::new().parse("  \n\n ").is_empty());
    }

    #[test]
    fn tagged_inline() {
        let (format, turns) = ScriptParser::new().parse_with_format("(s1) 你好 (s2) 你好呀");
        assert_eq!(format, ScriptFormat::Tagged);
        assert_eq!(pairs(&turns), vec![(1, "你好"), (2, "你好呀")]);
        assert_eq!(turns[0].order, 0);
        assert_eq!(turns[1].order, 1);
    }

    #[test]
    fn tagged_turn_count_matches_tags() {
        let script = "(s1) one\n(s2) two\nstill two\n(s1) three (s2) four (s1) five";
        let turns = ScriptParser::new().parse(script);
        assert_eq!(turns.len(), 5);
        assert_eq!(turns[1].text, "two still two");
        let speakers: Vec<u8> = turns.iter().map(|t| t.speaker_id).collect();
        assert_eq!(speakers, vec![1, 2, 1, 2, 1]);
    }

    #[test]
    fn tagged_wins_over_labels() {
        let turns = ScriptParser::new().parse("A: ignored label (s2) tagged");
        assert_eq!(pairs(&turns), vec![(2, "tagged")]);
    }

    #[test]
    fn labeled_chinese_and_letters() {
        let script = "角色1：今天天气不错\n角色2: 是啊\n人物1: 出去走走\nB：好";
        let (format, turns) = ScriptParser::new().parse_with_format(script);
        assert_eq!(format, ScriptFormat::Labeled);
        assert_eq!(
            pairs(&turns),
            vec![(1, "今天天气不错"), (2, "是啊"), (1, "出去走走"), (2, "好")]
        );
    }

    #[test]
    fn labeled_continuation_lines() {
        let script = "A: first line\nand more\nB: reply";
        let turns = ScriptParser::new().parse(script);
        assert_eq!(pairs(&turns), vec![(1, "first line and more"), (2, "reply")]);
    }

    #[test]
    fn labeled_on_one_line() {
        let parser = ScriptParser::new();
        assert_eq!(
            pairs(&parser.parse("角色1：你好 角色2：你好呀")),
            vec![(1, "你好"), (2, "你好呀")]
        );
        assert_eq!(
            pairs(&parser.parse("A: hi B: hello")),
            vec![(1, "hi"), (2, "hello")]
        );
        assert_eq!(
            pairs(&parser.parse("人物1: 早 人物2: 早上好")),
            vec![(1, "早"), (2, "早上好")]
        );
    }

    #[test]
    fn latin_labels_need_a_word_start() {
        let turns = ScriptParser::new().parse("Speaker 1: see section DATA: 3\nSpeaker 2: ok");
        assert_eq!(pairs(&turns), vec![(1, "see section DATA: 3"), (2, "ok")]);
    }

    #[test]
    fn unrecognized_labels_fall_through() {
        let script = "Narrator: once upon a time\nC: something";
        let (format, turns) = ScriptParser::new().parse_with_format(script);
        assert_eq!(format, ScriptFormat::Unlabeled);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "Narrator: once upon a time");
    }

    #[test]
    fn unlabeled_alternates() {
        let turns = ScriptParser::new().parse("hello\n\nhi\nhow are you\nfine");
        let speakers: Vec<u8> = turns.iter().map(|t| t.speaker_id).collect();
        assert_eq!(speakers, vec![1, 2, 1, 2]);
        assert_eq!(turns[2].text, "how are you");
    }

    #[test]
    fn deterministic() {
        let script = "(s1) a (s2) b\n(s1) c";
        let parser = ScriptParser::new();
        assert_eq!(parser.parse(script), parser.parse(script));
    }
}
