//! Page quality analysis.
//!
//! Three independent signals each score a page in `[0, 1]`; the compositor
//! combines whichever of them are available into one composite score, flags
//! pages against the threshold and per-signal floors, and derives the
//! descriptive struggle categories that explain *why* a page scored badly.

pub mod confidence;
pub mod dictionary;
pub mod garbled;

use std::collections::{BTreeMap, BTreeSet};

use crate::results::{ImageQuality, SignalDisagreement, SignalName, SignalResult, StruggleCategory};

use self::{
    confidence::{ConfidenceSignal, WordConfidence},
    dictionary::DictionarySignal,
    garbled::GarbledSignal,
};

/// Composite scores within this margin of the threshold are "gray zone".
pub const GRAY_ZONE_MARGIN: f64 = 0.05;

/// Pairwise signal gap above which the signals are considered to disagree.
pub const DISAGREEMENT_LIMIT: f64 = 0.3;

/// Thresholds and per-signal floors.
#[derive(Clone, Copy, Debug)]
pub struct QualityConfig {
    /// Page flagging cutoff for the composite score.
    pub threshold: f64,
    pub confidence_floor: f64,
    pub garbled_floor: f64,
    pub dictionary_floor: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            threshold: 0.85,
            confidence_floor: 0.3,
            garbled_floor: 0.5,
            dictionary_floor: 0.4,
        }
    }
}

/// Everything the compositor learned about one page.
#[derive(Clone, Debug)]
pub struct PageQuality {
    /// Combined score in `[0, 1]`.
    pub composite: f64,
    /// Below threshold, or some signal under its floor.
    pub flagged: bool,
    /// Composite within [`GRAY_ZONE_MARGIN`] of the threshold.
    pub gray_zone: bool,
    /// The signals that actually ran.
    pub signals: Vec<SignalResult>,
    /// The weight vector actually used.
    pub weights: BTreeMap<String, f64>,
    /// Pairwise `|a − b|` for every available pair.
    pub disagreements: Vec<SignalDisagreement>,
    pub has_signal_disagreement: bool,
    pub struggles: BTreeSet<StruggleCategory>,
}

impl PageQuality {
    /// Look up one signal's score by name, if that signal ran.
    pub fn signal_score(&self, name: SignalName) -> Option<f64> {
        self.signals.iter().find(|s| s.name == name).map(|s| s.score)
    }
}

/// The signal compositor.
#[derive(Debug)]
pub struct QualityAnalyzer {
    config: QualityConfig,
    garbled: GarbledSignal,
    dictionary: DictionarySignal,
    confidence: ConfidenceSignal,
}

impl QualityAnalyzer {
    pub fn new(config: QualityConfig) -> Self {
        QualityAnalyzer {
            garbled: GarbledSignal::new(config.garbled_floor),
            dictionary: DictionarySignal::new(config.dictionary_floor),
            confidence: ConfidenceSignal::new(config.confidence_floor),
            config,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Score one page. `word_confs` is `None` when no pixmap was available
    /// for the confidence signal; `image` carries the gated image-quality
    /// metrics when diagnostics mode is on.
    pub fn analyze(
        &self,
        text: &str,
        word_confs: Option<&[WordConfidence]>,
        image: Option<&ImageQuality>,
    ) -> PageQuality {
        let mut signals = vec![self.garbled.evaluate(text), self.dictionary.evaluate(text)];
        if let Some(words) = word_confs {
            signals.push(self.confidence.evaluate(words));
        }

        let weights = weights_for(&signals);
        let mut composite = signals
            .iter()
            .map(|s| s.score * weights[s.name.as_str()])
            .sum::<f64>();

        // Short-circuits apply only when the confidence signal ran.
        let confidence_score = signals
            .iter()
            .find(|s| s.name == SignalName::Confidence)
            .map(|s| s.score);
        if let Some(conf) = confidence_score {
            if conf > 0.95 {
                composite = composite.max(0.9);
            } else if conf < 0.2 {
                composite = composite.min(0.3);
            }
        }

        let threshold = self.config.threshold;
        let any_floor_miss = signals.iter().any(|s| !s.passed);
        let flagged = composite < threshold || any_floor_miss;
        let gray_zone = (composite - threshold).abs() < GRAY_ZONE_MARGIN;

        let disagreements = pairwise_disagreements(&signals);
        let has_signal_disagreement = disagreements
            .iter()
            .any(|d| d.magnitude > DISAGREEMENT_LIMIT);

        let struggles = self.struggle_categories(
            composite,
            flagged,
            gray_zone,
            has_signal_disagreement,
            &signals,
            image,
        );

        PageQuality {
            composite,
            flagged,
            gray_zone,
            signals,
            weights,
            disagreements,
            has_signal_disagreement,
            struggles,
        }
    }

    /// Apply the struggle rules. Each is independent.
    fn struggle_categories(
        &self,
        composite: f64,
        flagged: bool,
        gray_zone: bool,
        has_signal_disagreement: bool,
        signals: &[SignalResult],
        image: Option<&ImageQuality>,
    ) -> BTreeSet<StruggleCategory> {
        let score = |name: SignalName| {
            signals.iter().find(|s| s.name == name).map(|s| s.score)
        };
        let garbled = score(SignalName::Garbled);
        let dictionary = score(SignalName::Dictionary);
        let confidence = score(SignalName::Confidence);

        let mut out = BTreeSet::new();

        let bad_scan = match image {
            Some(metrics) => {
                metrics.blur_score.is_some_and(|b| b < 50.0)
                    || metrics.contrast.is_some_and(|c| c < 0.1)
            }
            None => {
                confidence.is_some_and(|c| c < 0.3) && garbled.is_some_and(|g| g < 0.4)
            }
        };
        if bad_scan {
            out.insert(StruggleCategory::BadScan);
        }
        if garbled.is_some_and(|g| g < 0.7) && dictionary.is_some_and(|d| d > 0.5) {
            out.insert(StruggleCategory::CharacterConfusion);
        }
        if dictionary.is_some_and(|d| d < 0.6) && garbled.is_some_and(|g| g > 0.7) {
            out.insert(StruggleCategory::VocabularyMiss);
        }
        if confidence.is_some_and(|c| c > 0.7) && composite < self.config.threshold {
            out.insert(StruggleCategory::LayoutError);
        }
        if dictionary.is_some_and(|d| d < 0.4)
            && garbled.is_some_and(|g| g > 0.4 && g < 0.7)
        {
            out.insert(StruggleCategory::LanguageConfusion);
        }
        if has_signal_disagreement {
            out.insert(StruggleCategory::SignalDisagreement);
        }
        if gray_zone {
            out.insert(StruggleCategory::GrayZone);
        }
        // SuryaInsufficient is added in Phase 2, never here.
        let _ = flagged;
        out
    }
}

/// The weight vector for the available signals.
///
/// The two fixed vectors from the scoring design; any other combination
/// (a signal failed to run) renormalizes the base weights over what's left.
fn weights_for(signals: &[SignalResult]) -> BTreeMap<String, f64> {
    let has = |name: SignalName| signals.iter().any(|s| s.name == name);
    let all_three = has(SignalName::Garbled)
        && has(SignalName::Dictionary)
        && has(SignalName::Confidence);

    if all_three {
        return BTreeMap::from([
            ("garbled".to_owned(), 0.4),
            ("dictionary".to_owned(), 0.3),
            ("confidence".to_owned(), 0.3),
        ]);
    }
    if has(SignalName::Garbled) && has(SignalName::Dictionary) && !has(SignalName::Confidence)
    {
        return BTreeMap::from([
            ("garbled".to_owned(), 0.55),
            ("dictionary".to_owned(), 0.45),
        ]);
    }

    // Degenerate availability: renormalize the base weights.
    let base = |name: SignalName| match name {
        SignalName::Garbled => 0.4,
        SignalName::Dictionary => 0.3,
        SignalName::Confidence => 0.3,
    };
    let total: f64 = signals.iter().map(|s| base(s.name)).sum();
    signals
        .iter()
        .map(|s| (s.name.as_str().to_owned(), base(s.name) / total))
        .collect()
}

/// `|a − b|` for every unordered pair of available signals.
fn pairwise_disagreements(signals: &[SignalResult]) -> Vec<SignalDisagreement> {
    let mut out = vec![];
    for (i, a) in signals.iter().enumerate() {
        for b in &signals[i + 1..] {
            out.push(SignalDisagreement {
                a: a.name,
                b: b.name,
                magnitude: (a.score - b.score).abs(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN: &str = "the history of philosophy is a history of problems \
                         and the problems of history are problems of reason";

    fn analyzer() -> QualityAnalyzer {
        QualityAnalyzer::new(QualityConfig::default())
    }

    fn confs(conf: f64, n: usize) -> Vec<WordConfidence> {
        (0..n)
            .map(|i| WordConfidence {
                text: format!("word{i}"),
                conf,
            })
            .collect()
    }

    #[test]
    fn all_three_signals_use_the_full_weight_vector() {
        let words = confs(90.0, 10);
        let quality = analyzer().analyze(CLEAN, Some(&words), None);
        assert_eq!(quality.weights["garbled"], 0.4);
        assert_eq!(quality.weights["dictionary"], 0.3);
        assert_eq!(quality.weights["confidence"], 0.3);
        assert!(!quality.flagged);
    }

    #[test]
    fn missing_confidence_reweights_to_two_signals() {
        let quality = analyzer().analyze(CLEAN, None, None);
        assert_eq!(quality.weights["garbled"], 0.55);
        assert_eq!(quality.weights["dictionary"], 0.45);
        assert!(quality.signal_score(SignalName::Confidence).is_none());
    }

    #[test]
    fn high_confidence_short_circuit_raises_composite() {
        // Garbled text, but the extractor is very sure of every word.
        let words = confs(99.0, 10);
        let quality = analyzer().analyze("zzzzzzzz xxxxxxxx qqqqqqq", Some(&words), None);
        assert!(quality.composite >= 0.9);
    }

    #[test]
    fn low_confidence_short_circuit_caps_composite() {
        let words = confs(10.0, 10);
        let quality = analyzer().analyze(CLEAN, Some(&words), None);
        assert!(quality.composite <= 0.3);
        assert!(quality.flagged);
    }

    #[test]
    fn floor_miss_flags_even_with_good_composite() {
        // Dictionary-rich text with confidence just under its floor: the
        // composite can stay high, but the floor check still flags.
        let words = confs(25.0, 10);
        let quality = analyzer().analyze(CLEAN, Some(&words), None);
        assert!(quality.flagged);
    }

    #[test]
    fn signal_disagreement_scenario() {
        // Mostly real words but confidence 0.1: the disagreement pair
        // exceeds the limit, layout_error must not fire.
        let words = confs(10.0, 10);
        let quality = analyzer().analyze(CLEAN, Some(&words), None);
        assert!(quality.has_signal_disagreement);
        assert!(
            quality
                .disagreements
                .iter()
                .any(|d| d.magnitude > DISAGREEMENT_LIMIT)
        );
        assert!(
            quality
                .struggles
                .contains(&StruggleCategory::SignalDisagreement)
        );
        assert!(!quality.struggles.contains(&StruggleCategory::LayoutError));
    }

    #[test]
    fn layout_error_needs_high_confidence_and_low_composite() {
        // Confident extractor, garbled text: composite sinks below the
        // threshold while confidence stays above 0.7.
        let words = confs(85.0, 10);
        let quality =
            analyzer().analyze("zzzzzzzz xxxxxxxx qqqqqqq wwwwwww", Some(&words), None);
        assert!(quality.struggles.contains(&StruggleCategory::LayoutError));
    }

    #[test]
    fn bad_scan_from_image_metrics() {
        let image = ImageQuality {
            blur_score: Some(12.0),
            contrast: Some(0.5),
            ..ImageQuality::default()
        };
        let quality = analyzer().analyze(CLEAN, None, Some(&image));
        assert!(quality.struggles.contains(&StruggleCategory::BadScan));
    }

    #[test]
    fn gray_zone_is_detected() {
        // Two-signal path: pick text whose composite lands near 0.85.
        // 0.55·garbled + 0.45·dictionary with garbled = 1.0 needs
        // dictionary ≈ 0.67: two known words + two structured ones.
        // garbled = 1.0, dictionary = (2 + 0.5·2)/4 = 0.75, so the
        // composite is 0.55 + 0.45·0.75 = 0.8875, inside the margin.
        let quality = analyzer().analyze("reason history spannungsfeld wesenhaft", None, None);
        assert!((quality.composite - 0.8875).abs() < 1e-9);
        assert!(quality.gray_zone);
        assert!(quality.struggles.contains(&StruggleCategory::GrayZone));
        assert!(!quality.flagged);
    }
}
