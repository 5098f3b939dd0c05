//! The dictionary signal.
//!
//! Classifies each token against a bundled word list. Unknown tokens get a
//! second chance: if they are structurally plausible as words (sane vowel
//! ratio, no character spammed, enough distinct characters) they count for
//! half credit, since academic texts are full of vocabulary no fixed list
//! covers.

use std::{
    collections::{BTreeMap, HashSet},
    sync::LazyLock,
};

use crate::{
    prelude::*,
    results::{SignalName, SignalResult},
};

/// The bundled word list, one lowercase word per line.
static WORD_LIST: &str = include_str!("../../data/words.txt");

/// The word list parsed once into an immutable set.
static WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    WORD_LIST
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
});

/// Vowel ratio a plausible word stays within.
const VOWEL_RATIO_RANGE: (f64, f64) = (0.15, 0.65);

/// Maximum times any single character may repeat in a plausible word.
const MAX_CHAR_REPEATS: usize = 4;

/// Minimum unique-character ratio for a plausible word.
const MIN_UNIQUE_RATIO: f64 = 0.4;

/// How a token was classified.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WordClass {
    Known,
    Structured,
    Garbled,
}

/// The dictionary scorer.
#[derive(Debug)]
pub struct DictionarySignal {
    floor: f64,
}

impl DictionarySignal {
    pub fn new(floor: f64) -> Self {
        // Force the word list to parse at construction, not first use.
        let _ = WORDS.len();
        DictionarySignal { floor }
    }

    /// Weighted score: `(known + 0.5·structured) / total` (0 when empty).
    pub fn evaluate(&self, text: &str) -> SignalResult {
        let mut known = 0usize;
        let mut structured = 0usize;
        let mut garbled = 0usize;

        for raw in text.split_whitespace() {
            let token = raw.trim_matches(|c: char| !c.is_alphanumeric());
            if token.is_empty() {
                continue;
            }
            match classify(token) {
                WordClass::Known => known += 1,
                WordClass::Structured => structured += 1,
                WordClass::Garbled => garbled += 1,
            }
        }

        let total = known + structured + garbled;
        let score = if total == 0 {
            0.0
        } else {
            (known as f64 + 0.5 * structured as f64) / total as f64
        };

        let details = BTreeMap::from([
            ("known".to_owned(), json!(known)),
            ("structured".to_owned(), json!(structured)),
            ("garbled".to_owned(), json!(garbled)),
            ("total_words".to_owned(), json!(total)),
        ]);
        SignalResult {
            name: SignalName::Dictionary,
            score,
            passed: score >= self.floor,
            details,
        }
    }
}

fn classify(token: &str) -> WordClass {
    let lower = token.to_lowercase();
    if WORDS.contains(lower.as_str()) {
        return WordClass::Known;
    }
    if is_structured(&lower) {
        WordClass::Structured
    } else {
        WordClass::Garbled
    }
}

/// The three structural heuristics for unknown-but-plausible words.
fn is_structured(word: &str) -> bool {
    let chars = word.chars().collect::<Vec<_>>();
    if chars.is_empty() {
        return false;
    }
    // Pure numbers are structured (page numbers, years).
    if chars.iter().all(|c| c.is_ascii_digit()) {
        return true;
    }

    let letters = chars.iter().filter(|c| c.is_alphabetic()).count();
    if letters == 0 {
        return false;
    }
    let vowels = chars
        .iter()
        .filter(|c| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y' | 'ä' | 'ö' | 'ü' | 'é' | 'è' | 'à'))
        .count();
    let vowel_ratio = vowels as f64 / letters as f64;
    if vowel_ratio < VOWEL_RATIO_RANGE.0 || vowel_ratio > VOWEL_RATIO_RANGE.1 {
        return false;
    }

    let mut counts: BTreeMap<char, usize> = BTreeMap::new();
    for &c in &chars {
        *counts.entry(c).or_insert(0) += 1;
    }
    if counts.values().any(|&n| n > MAX_CHAR_REPEATS) {
        return false;
    }

    let unique_ratio = counts.len() as f64 / chars.len() as f64;
    unique_ratio >= MIN_UNIQUE_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> DictionarySignal {
        DictionarySignal::new(0.4)
    }

    #[test]
    fn known_words_score_full_credit() {
        let result = signal().evaluate("the history of philosophy");
        assert_eq!(result.score, 1.0);
        assert_eq!(result.details["known"], json!(4));
    }

    #[test]
    fn plausible_unknowns_get_half_credit() {
        // Not in the list, but structurally word-like.
        assert_eq!(classify("hermeneutical"), WordClass::Structured);
        // Vowel-free junk is garbled.
        assert_eq!(classify("xkcdqrst"), WordClass::Garbled);
    }

    #[test]
    fn weighted_score_formula() {
        // 1 known + 1 structured + 2 garbled = (1 + 0.5) / 4.
        let result = signal().evaluate("reason spannungsfeld zzzz xxxx");
        assert!((result.score - 0.375).abs() < 1e-9);
        assert!(!result.passed);
    }

    #[test]
    fn empty_text_scores_zero() {
        let result = signal().evaluate("");
        assert_eq!(result.score, 0.0);
        assert_eq!(result.details["total_words"], json!(0));
    }

    #[test]
    fn numbers_are_structured_not_garbled() {
        assert_eq!(classify("1927"), WordClass::Structured);
    }
}
