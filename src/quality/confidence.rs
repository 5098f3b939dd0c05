//! The OCR-confidence signal.
//!
//! Consumes the per-word `{text, conf}` records that the word-level OCR data
//! extractor produces from a 300-DPI render of the page. The signal itself
//! is pure; rendering and extraction happen in the worker, which may skip
//! them entirely (no pixmap available), in which case the compositor
//! reweights over the remaining signals.

use std::collections::BTreeMap;

use crate::{
    prelude::*,
    results::{SignalName, SignalResult},
};

/// One word as reported by the OCR data extractor. `conf` is 0–100.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct WordConfidence {
    pub text: String,
    pub conf: f64,
}

/// The confidence scorer.
#[derive(Debug)]
pub struct ConfidenceSignal {
    floor: f64,
}

impl ConfidenceSignal {
    pub fn new(floor: f64) -> Self {
        ConfidenceSignal { floor }
    }

    /// Length-weighted mean of `conf / 100`. Neutral 0.5 on empty input.
    pub fn evaluate(&self, words: &[WordConfidence]) -> SignalResult {
        let usable = words
            .iter()
            .filter(|w| w.conf > 0.0 && !w.text.trim().is_empty())
            .collect::<Vec<_>>();

        let (score, mean_conf, min_conf) = if usable.is_empty() {
            (0.5, None, None)
        } else {
            let mut weighted_sum = 0.0;
            let mut weight_total = 0.0;
            let mut conf_sum = 0.0;
            let mut min = f64::MAX;
            for word in &usable {
                let weight = word.text.trim().chars().count().max(1) as f64;
                weighted_sum += (word.conf / 100.0) * weight;
                weight_total += weight;
                conf_sum += word.conf;
                min = min.min(word.conf);
            }
            (
                weighted_sum / weight_total,
                Some(conf_sum / usable.len() as f64),
                Some(min),
            )
        };

        let details = BTreeMap::from([
            ("word_count".to_owned(), json!(usable.len())),
            ("mean_conf".to_owned(), json!(mean_conf)),
            ("min_conf".to_owned(), json!(min_conf)),
        ]);
        SignalResult {
            name: SignalName::Confidence,
            score,
            passed: score >= self.floor,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, conf: f64) -> WordConfidence {
        WordConfidence {
            text: text.to_owned(),
            conf,
        }
    }

    #[test]
    fn empty_input_is_neutral() {
        let result = ConfidenceSignal::new(0.3).evaluate(&[]);
        assert_eq!(result.score, 0.5);
        assert!(result.passed);
        assert_eq!(result.details["word_count"], json!(0));
    }

    #[test]
    fn zero_conf_and_empty_words_are_filtered() {
        let words = [word("", 95.0), word("ghost", 0.0), word("real", 80.0)];
        let result = ConfidenceSignal::new(0.3).evaluate(&words);
        assert_eq!(result.details["word_count"], json!(1));
        assert!((result.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn longer_words_weigh_more() {
        // "a" (conf 100, weight 1) + "philosophy" (conf 50, weight 10).
        let words = [word("a", 100.0), word("philosophy", 50.0)];
        let result = ConfidenceSignal::new(0.3).evaluate(&words);
        let expected = (1.0 * 1.0 + 0.5 * 10.0) / 11.0;
        assert!((result.score - expected).abs() < 1e-9);
        assert_eq!(result.details["min_conf"], json!(50.0));
    }
}
