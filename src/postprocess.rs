//! Deterministic cleanup of OCR output text.
//!
//! OCR engines leave mechanical artifacts behind: words hyphenated across
//! line breaks, hard-wrapped paragraphs, decomposed Unicode, typewriter
//! quotes. The transforms here run in a fixed order — dehyphenation must see
//! the original line breaks, paragraph joining must run before whitespace
//! collapse — and each one increments a named counter when a counter map is
//! supplied, so per-page diagnostics can report what was changed.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use unicode_normalization::{UnicodeNormalization, is_nfc};

/// Per-transform change counters, keyed by transform name.
pub type PostprocessCounts = BTreeMap<String, u64>;

/// Counter keys, in pass order.
pub const DEHYPHENATIONS: &str = "dehyphenations";
pub const PARAGRAPH_JOINS: &str = "paragraph_joins";
pub const UNICODE_NORMALIZATIONS: &str = "unicode_normalizations";
pub const PUNCTUATION_FIXES: &str = "punctuation_fixes";

/// Hyphenated terms that must survive dehyphenation intact.
const HYPHENATED_TERMS: &[&str] = &[
    "Heidegger-Jaspers",
    "Husserl-Archiv",
    "a-priori",
    "being-in-the-world",
    "being-toward-death",
    "for-itself",
    "in-itself",
    "ready-to-hand",
    "present-at-hand",
    "self-consciousness",
    "world-historical",
];

/// Apply the full transform chain. When `counters` is provided, each
/// transform adds its change count under its own key.
pub fn apply_all(text: &str, mut counters: Option<&mut PostprocessCounts>) -> String {
    let mut bump = |key: &str, n: u64| {
        if let Some(counters) = counters.as_deref_mut() {
            *counters.entry(key.to_owned()).or_insert(0) += n;
        }
    };

    let (text, n) = dehyphenate(text);
    bump(DEHYPHENATIONS, n);
    let (text, n) = join_paragraph_lines(&text);
    bump(PARAGRAPH_JOINS, n);
    let (text, n) = normalize_unicode(&text);
    bump(UNICODE_NORMALIZATIONS, n);
    let (text, n) = fix_punctuation(&text);
    bump(PUNCTUATION_FIXES, n);
    text
}

static RE_LINE_BREAK_HYPHEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\p{L}+)-\n[ \t]*(\p{L}+)").expect("bad dehyphenation pattern")
});

/// Join words hyphenated across a line break, keeping whitelisted compounds
/// hyphenated (but still pulling them onto one line).
pub fn dehyphenate(text: &str) -> (String, u64) {
    let mut count = 0;
    let out = RE_LINE_BREAK_HYPHEN.replace_all(text, |caps: &regex::Captures<'_>| {
        count += 1;
        let joined = format!("{}-{}", &caps[1], &caps[2]);
        if HYPHENATED_TERMS
            .iter()
            .any(|term| term.eq_ignore_ascii_case(&joined))
        {
            joined
        } else {
            format!("{}{}", &caps[1], &caps[2])
        }
    });
    (out.into_owned(), count)
}

static RE_PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n+").expect("bad paragraph pattern"));

/// Join hard-wrapped lines within paragraphs, preserving paragraph breaks.
pub fn join_paragraph_lines(text: &str) -> (String, u64) {
    let mut count = 0;
    let paragraphs = RE_PARAGRAPH_BREAK
        .split(text)
        .map(|para| {
            let lines = para
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>();
            if lines.len() > 1 {
                count += (lines.len() - 1) as u64;
            }
            lines.join(" ")
        })
        .collect::<Vec<_>>();
    (paragraphs.join("\n\n"), count)
}

/// Normalize to NFC. Counts the characters whose representation changed.
pub fn normalize_unicode(text: &str) -> (String, u64) {
    if is_nfc(text) {
        return (text.to_owned(), 0);
    }
    let normalized: String = text.nfc().collect();
    let changed = text
        .chars()
        .zip(normalized.chars())
        .filter(|(a, b)| a != b)
        .count() as u64
        + text.chars().count().abs_diff(normalized.chars().count()) as u64;
    (normalized, changed.max(1))
}

static RE_MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("bad whitespace pattern"));

/// Replace smart quotes with plain ones and collapse runs of spaces.
pub fn fix_punctuation(text: &str) -> (String, u64) {
    let mut count = 0;
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\u{2018}' | '\u{2019}' | '\u{201A}' => {
                count += 1;
                out.push('\'');
            }
            '\u{201C}' | '\u{201D}' | '\u{201E}' => {
                count += 1;
                out.push('"');
            }
            other => out.push(other),
        }
    }
    let collapsed = RE_MULTI_SPACE.replace_all(&out, |_: &regex::Captures<'_>| {
        count += 1;
        " ".to_owned()
    });
    (collapsed.into_owned(), count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dehyphenates_across_line_breaks() {
        let (out, n) = dehyphenate("the pheno-\nmenology of spirit");
        assert_eq!(out, "the phenomenology of spirit");
        assert_eq!(n, 1);
    }

    #[test]
    fn whitelisted_compounds_keep_their_hyphen() {
        let (out, n) = dehyphenate("the Heidegger-\nJaspers correspondence");
        assert_eq!(out, "the Heidegger-Jaspers correspondence");
        assert_eq!(n, 1);
    }

    #[test]
    fn joins_lines_but_keeps_paragraphs() {
        let (out, n) = join_paragraph_lines("one\ntwo\n\nthree\nfour");
        assert_eq!(out, "one two\n\nthree four");
        assert_eq!(n, 2);
    }

    #[test]
    fn normalizes_decomposed_umlauts() {
        // "u" + combining diaeresis.
        let (out, n) = normalize_unicode("u\u{0308}ber");
        assert_eq!(out, "über");
        assert!(n >= 1);
    }

    #[test]
    fn fixes_quotes_and_collapses_spaces() {
        let (out, n) = fix_punctuation("\u{201C}Sein\u{201D}  und  Zeit");
        assert_eq!(out, "\"Sein\" und Zeit");
        assert_eq!(n, 4);
    }

    #[test]
    fn full_chain_counts_every_transform() {
        let mut counts = PostprocessCounts::new();
        let text = "philo-\nsophy of\nmind\n\n\u{201C}quoted\u{201D}  text";
        let out = apply_all(text, Some(&mut counts));
        assert_eq!(out, "philosophy of mind\n\n\"quoted\" text");
        assert_eq!(counts[DEHYPHENATIONS], 1);
        assert_eq!(counts[PARAGRAPH_JOINS], 1);
        assert_eq!(counts[PUNCTUATION_FIXES], 3);
        assert_eq!(counts[UNICODE_NORMALIZATIONS], 0);
    }
}
