//! The garbled-token signal.
//!
//! Runs a set of precompiled patterns over each whitespace-delimited token
//! and counts the ones that look like OCR noise. Domain vocabulary from the
//! academic corpus this pipeline targets (German idealism and phenomenology,
//! plus French, Greek and Latin terms of art) is whitelisted, as are
//! structural tokens like ISBN codes and footnote markers.

use std::{
    collections::{BTreeMap, HashSet},
    sync::LazyLock,
};

use regex::Regex;

use crate::{
    prelude::*,
    results::{SignalName, SignalResult},
};

/// Maximum number of offending tokens kept in the details sample.
const MAX_SAMPLES: usize = 5;

/// Tokens ending in these German suffixes legitimately carry long consonant
/// clusters, so they skip that check.
const GERMAN_SUFFIXES: &[&str] = &[
    "keit", "heit", "ung", "schaft", "lich", "isch", "tum", "nis",
];

/// Domain terms that look garbled to the patterns but are real vocabulary.
static WHITELIST: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // German.
        "angst",
        "anschauung",
        "anwesenheit",
        "aufhebung",
        "begriff",
        "bildung",
        "dasein",
        "entfremdung",
        "ereignis",
        "erscheinung",
        "geist",
        "gestell",
        "geworfenheit",
        "lichtung",
        "nichts",
        "sorge",
        "urteil",
        "vernunft",
        "verstand",
        "vorhandenheit",
        "vorstellung",
        "weltanschauung",
        "wirklichkeit",
        "wissenschaft",
        "zeitgeist",
        "zuhandenheit",
        // French.
        "differance",
        "différance",
        "épochè",
        "l'être",
        "néant",
        // Greek and Latin.
        "aletheia",
        "apriori",
        "aposteriori",
        "cogito",
        "eidos",
        "epoche",
        "logos",
        "noema",
        "noesis",
        "ousia",
        "physis",
        "telos",
    ]
    .into_iter()
    .collect()
});

/// Long consonant cluster (six or more).
static RE_CONSONANT_CLUSTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[bcdfghjklmnpqrstvwxz]{6,}").expect("bad cluster pattern")
});

/// Digits wedged between letters, as in `th3` or `wor1d`.
static RE_INTERIOR_DIGIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{L}\d+\p{L}").expect("bad digit pattern"));

/// Stray control characters.
static RE_CONTROL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F]").expect("bad control pattern")
});

/// Runs of glyphs OCR habitually confuses (`l`, `I`, `1`, `|`).
static RE_CONFUSABLE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[lI1|]{4,}").expect("bad confusable pattern"));

/// ISBN-style digit groups, kept even though they trip the digit patterns.
static RE_ISBN_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:ISBN[-: ]?)?(?:\d[- ]?){9,12}[\dXx]$").expect("bad isbn pattern")
});

/// Footnote markers such as `12n3` or `[7]`.
static RE_FOOTNOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[\d+\]|\(\d+\)|\d+n\d*)$").expect("bad footnote pattern")
});

/// The garbled-token scorer.
#[derive(Debug)]
pub struct GarbledSignal {
    floor: f64,
}

impl GarbledSignal {
    pub fn new(floor: f64) -> Self {
        GarbledSignal { floor }
    }

    /// Score `text`, returning `1 − garbled / total` (0 when empty).
    pub fn evaluate(&self, text: &str) -> SignalResult {
        let mut total_words = 0usize;
        let mut garbled_count = 0usize;
        let mut samples: Vec<Value> = vec![];

        let tokens = text.split_whitespace().collect::<Vec<_>>();
        for (idx, raw) in tokens.iter().enumerate() {
            let token = raw.trim_matches(|c: char| !c.is_alphanumeric());
            if token.is_empty() {
                continue;
            }
            total_words += 1;
            if is_garbled(token) {
                garbled_count += 1;
                if samples.len() < MAX_SAMPLES {
                    let context = context_around(&tokens, idx);
                    samples.push(json!({ "token": token, "context": context }));
                }
            }
        }

        let score = if total_words == 0 {
            0.0
        } else {
            1.0 - garbled_count as f64 / total_words as f64
        };

        let details = BTreeMap::from([
            ("garbled_count".to_owned(), json!(garbled_count)),
            ("total_words".to_owned(), json!(total_words)),
            ("samples".to_owned(), Value::Array(samples)),
        ]);
        SignalResult {
            name: SignalName::Garbled,
            score,
            passed: score >= self.floor,
            details,
        }
    }
}

/// Classify one stripped token.
fn is_garbled(token: &str) -> bool {
    let lower = token.to_lowercase();
    if WHITELIST.contains(lower.as_str()) {
        return false;
    }
    if RE_ISBN_LIKE.is_match(token) || RE_FOOTNOTE.is_match(token) {
        return false;
    }
    if RE_CONTROL.is_match(token) {
        return true;
    }
    if has_triple_repeat(token) {
        return true;
    }
    if RE_INTERIOR_DIGIT.is_match(token) {
        return true;
    }
    if RE_CONFUSABLE_RUN.is_match(token) {
        return true;
    }
    let skip_cluster_check = GERMAN_SUFFIXES
        .iter()
        .any(|suffix| lower.ends_with(suffix));
    if !skip_cluster_check && RE_CONSONANT_CLUSTER.is_match(token) {
        return true;
    }
    false
}

/// Three or more identical characters in a row. The `regex` crate has no
/// backreferences, so this is a manual scan.
fn has_triple_repeat(token: &str) -> bool {
    let mut run = 1;
    let mut prev: Option<char> = None;
    for ch in token.chars() {
        if Some(ch) == prev {
            run += 1;
            if run >= 3 {
                return true;
            }
        } else {
            run = 1;
            prev = Some(ch);
        }
    }
    false
}

/// A little surrounding context for a sample token.
fn context_around(tokens: &[&str], idx: usize) -> String {
    let start = idx.saturating_sub(2);
    let end = (idx + 3).min(tokens.len());
    tokens[start..end].join(" ")
}
