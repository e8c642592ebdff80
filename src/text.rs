//! # Transcript Cleanup
//!
//! Turns per-window model output into the final transcript string.
//!
//! ## Cleaning Passes:
//! 1. Join segment texts in start order, separated by single spaces
//! 2. Strip leftover Whisper control tokens (`<|...|>`)
//! 3. Remove subtitle-credit lines Whisper hallucinates on silence or music
//! 4. Collapse degenerate repetition: more than `MAX_REPEATS` consecutive
//!    copies of the same 1 to `LOOKBACK` word phrase become one copy
//! 5. Drop a trailing run of a single repeated letter ("... a a a")
//! 6. Collapse whitespace, trim, capitalise the first letter
//!
//! Passes 2 to 5 repeat until the text stops changing, which makes
//! `clean_text` idempotent.

use crate::transcription::engine::TranscriptSegment;
use regex::Regex;

/// Longest phrase, in words, checked for repetition.
pub const LOOKBACK: usize = 4;

/// Consecutive copies of a phrase tolerated before collapsing.
pub const MAX_REPEATS: usize = 3;

/// Shortest trailing run of one repeated letter that gets dropped.
const TRAILING_LETTER_RUN: usize = 3;

const CREDIT_PATTERNS: &[&str] = &[
    r"(?is)sottotitoli creati dalla comunità amara\.org.*?qtss\.?",
    r"(?is)subtitles created by.*?community.*?amara\.org.*?qtss\.?",
    r"(?is)sottotitoli e revisione a cura di.*?qtss\.?",
    r"(?is)subtitles and revision by.*?qtss\.?",
    r"(?is)traduzione e adattamento.*?qtss\.?",
    r"(?is)translation and adaptation.*?qtss\.?",
];

/// Compiled cleanup rules. Cheap to share, holds no per-request state.
#[derive(Debug, Clone)]
pub struct TextProcessor {
    control_tokens: Regex,
    credits: Vec<Regex>,
}

impl TextProcessor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            control_tokens: Regex::new(r"<\|[^|>]*\|>")?,
            credits: CREDIT_PATTERNS
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    /// Build the transcript from engine segments.
    pub fn clean(&self, segments: &[TranscriptSegment]) -> String {
        let mut ordered: Vec<&TranscriptSegment> = segments.iter().collect();
        ordered.sort_by(|a, b| a.start.total_cmp(&b.start));

        let joined = ordered
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        self.clean_text(&joined)
    }

    /// Clean an already joined transcript.
    pub fn clean_text(&self, text: &str) -> String {
        let mut current = normalize_whitespace(text);
        loop {
            let next = self.pass(&current);
            if next == current {
                break;
            }
            current = next;
        }
        capitalize_first(&current)
    }

    fn pass(&self, text: &str) -> String {
        let mut text = self.control_tokens.replace_all(text, " ").into_owned();
        for pattern in &self.credits {
            text = pattern.replace_all(&text, " ").into_owned();
        }

        let mut words: Vec<&str> = text.split_whitespace().collect();
        words = collapse_repeats(&words);
        drop_trailing_letter_run(&mut words);
        words.join(" ")
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison key: lowercase, surrounding punctuation ignored.
fn word_key(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()
}

fn same_phrase(a: &[&str], b: &[&str]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| word_key(x) == word_key(y))
}

/// Replace runs of more than `MAX_REPEATS` identical phrases with the first copy.
fn collapse_repeats<'a>(words: &[&'a str]) -> Vec<&'a str> {
    let mut out = Vec::with_capacity(words.len());
    let mut i = 0;

    'outer: while i < words.len() {
        for n in 1..=LOOKBACK {
            if i + n > words.len() {
                break;
            }
            let phrase = &words[i..i + n];
            let mut copies = 1;
            while i + (copies + 1) * n <= words.len()
                && same_phrase(phrase, &words[i + copies * n..i + (copies + 1) * n])
            {
                copies += 1;
            }
            if copies > MAX_REPEATS {
                out.extend_from_slice(phrase);
                i += copies * n;
                continue 'outer;
            }
        }
        out.push(words[i]);
        i += 1;
    }

    out
}

fn drop_trailing_letter_run(words: &mut Vec<&str>) {
    let Some(last) = words.last().map(|w| word_key(w)) else {
        return;
    };
    if last.chars().count() != 1 || !last.chars().all(|c| c.is_alphabetic()) {
        return;
    }

    let run = words
        .iter()
        .rev()
        .take_while(|w| word_key(w) == last)
        .count();
    if run >= TRAILING_LETTER_RUN {
        words.truncate(words.len() - run);
    }
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_lowercase() => first.to_uppercase().chain(chars).collect(),
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> TextProcessor {
        TextProcessor::new().unwrap()
    }

    fn segment(start: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end: start + 30.0,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_segments_joined_in_start_order() {
        let segments = vec![
            segment(30.0, "  world.  "),
            segment(0.0, "Hello"),
            segment(60.0, ""),
        ];
        assert_eq!(processor().clean(&segments), "Hello world.");
    }

    #[test]
    fn test_control_tokens_and_credits_removed() {
        let text = "<|startoftranscript|> the end. Sottotitoli creati dalla comunità Amara.org QTSS";
        assert_eq!(processor().clean_text(text), "The end.");

        let text = "Subtitles and revision by John QTSS. Welcome back";
        assert_eq!(processor().clean_text(text), "Welcome back");
    }

    #[test]
    fn test_repetition_collapse() {
        let p = processor();
        assert_eq!(p.clean_text("Yes no no no no no"), "Yes no");
        assert_eq!(p.clean_text("Go on, go on, go on, go on, go on."), "Go on,");
        // three copies are tolerated
        assert_eq!(p.clean_text("Ha ha ha"), "Ha ha ha");
        assert_eq!(p.clean_text("I am. I AM. i am. I am. then"), "I am. then");
    }

    #[test]
    fn test_trailing_letter_run() {
        assert_eq!(processor().clean_text("We are done a a a"), "We are done");
        assert_eq!(processor().clean_text("Plan a a"), "Plan a a");
    }

    #[test]
    fn test_whitespace_and_casing() {
        assert_eq!(processor().clean_text("  hello\n\tthere   friend "), "Hello there friend");
        assert_eq!(processor().clean_text("   "), "");
        assert_eq!(processor().clean(&[]), "");
    }

    #[test]
    fn test_clean_is_idempotent() {
        let p = processor();
        let inputs = [
            "x b b b a a a",
            "the the the the cat cat cat cat sat",
            "<|en|> so so so so so <|endoftext|>  fine",
            "Translation and adaptation by someone QTSS okay okay okay okay",
            "one two one two one two one two one two three",
            "  ",
        ];
        for input in inputs {
            let once = p.clean_text(input);
            assert_eq!(p.clean_text(&once), once, "input: {:?}", input);
        }

        let segments = vec![segment(0.0, "so so so so"), segment(30.0, "so so so so")];
        let once = p.clean(&segments);
        assert_eq!(p.clean(&[segment(0.0, &once)]), once);
    }
}
