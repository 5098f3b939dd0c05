//! Per-page diagnostics.
//!
//! The always-on block is assembled from the quality results the worker
//! already has; the gated block (image metrics, kept fast-engine text, the
//! engine diff) costs real work and only runs in diagnostics mode.
//! Diagnostic failures never propagate: a metric that cannot be computed is
//! recorded as `None`.

use std::collections::BTreeMap;

use image::GenericImageView;
use similar::{ChangeTag, TextDiff};

use crate::{
    postprocess::PostprocessCounts,
    prelude::*,
    quality::PageQuality,
    results::{DiffSummary, EngineDiff, ImageQuality, PageDiagnostics, Substitution},
};

/// Build the always-captured diagnostics block for one page.
pub fn build_page_diagnostics(
    quality: &PageQuality,
    postprocess_counts: &PostprocessCounts,
) -> PageDiagnostics {
    let mut signal_scores = BTreeMap::new();
    let mut signal_details = BTreeMap::new();
    for signal in &quality.signals {
        signal_scores.insert(signal.name.as_str().to_owned(), signal.score);
        signal_details.insert(
            signal.name.as_str().to_owned(),
            json!(signal.details.clone()),
        );
    }
    PageDiagnostics {
        signal_scores,
        signal_details,
        composite_weights: quality.weights.clone(),
        signal_disagreements: quality.disagreements.clone(),
        has_signal_disagreement: quality.has_signal_disagreement,
        postprocess_counts: postprocess_counts.clone(),
        struggle_categories: quality.struggles.clone(),
        image_quality: None,
        tesseract_text: None,
        engine_diff: None,
    }
}

/// Word-level diff between two engines' text for the same page.
///
/// Adjacent delete/insert runs are paired up as substitutions; the leftovers
/// become plain additions or deletions.
pub fn word_diff(old: &str, new: &str) -> EngineDiff {
    let diff = TextDiff::from_words(old, new);

    let mut additions = vec![];
    let mut deletions = vec![];
    let mut substitutions = vec![];
    let mut pending_deletes: Vec<String> = vec![];
    let mut pending_inserts: Vec<String> = vec![];

    let mut flush =
        |deletes: &mut Vec<String>, inserts: &mut Vec<String>| {
            let paired = deletes.len().min(inserts.len());
            for (old_word, new_word) in deletes.drain(..paired).zip(inserts.drain(..paired))
            {
                substitutions.push(Substitution {
                    old: old_word,
                    new: new_word,
                });
            }
            deletions.append(deletes);
            additions.append(inserts);
        };

    for change in diff.iter_all_changes() {
        let word = change.value().trim();
        if word.is_empty() {
            continue;
        }
        match change.tag() {
            ChangeTag::Delete => pending_deletes.push(word.to_owned()),
            ChangeTag::Insert => pending_inserts.push(word.to_owned()),
            ChangeTag::Equal => flush(&mut pending_deletes, &mut pending_inserts),
        }
    }
    flush(&mut pending_deletes, &mut pending_inserts);

    let summary = DiffSummary {
        additions: additions.len(),
        deletions: deletions.len(),
        substitutions: substitutions.len(),
    };
    EngineDiff {
        additions,
        deletions,
        substitutions,
        summary,
    }
}

/// Compute image-quality metrics from a rendered page pixmap.
///
/// Returns `None` when the image cannot be decoded; individual metrics are
/// `None` when their kernel fails.
pub fn image_quality_from_png(png: &[u8], dpi: u32) -> Option<ImageQuality> {
    let decoded = match image::load_from_memory(png) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!("cannot decode pixmap for image metrics: {err}");
            return None;
        }
    };
    let gray = decoded.to_luma8();
    let (width, height) = decoded.dimensions();
    if width < 3 || height < 3 {
        return None;
    }

    Some(ImageQuality {
        dpi: Some(dpi as f64),
        contrast: Some(contrast(&gray)),
        blur_score: Some(laplacian_variance(&gray)),
        skew_angle: skew_angle(&gray),
    })
}

/// RMS contrast: standard deviation of luma, normalized to `[0, 1]`.
fn contrast(gray: &image::GrayImage) -> f64 {
    let n = gray.len() as f64;
    let mean = gray.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = gray
        .iter()
        .map(|&p| {
            let d = p as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt() / 255.0
}

/// Variance of the 3×3 Laplacian. Sharp text scores in the hundreds;
/// blurred scans fall toward zero.
fn laplacian_variance(gray: &image::GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    let mut values = Vec::with_capacity(((width - 2) * (height - 2)) as usize);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = gray.get_pixel(x, y)[0] as f64;
            let neighbors = gray.get_pixel(x, y - 1)[0] as f64
                + gray.get_pixel(x, y + 1)[0] as f64
                + gray.get_pixel(x - 1, y)[0] as f64
                + gray.get_pixel(x + 1, y)[0] as f64;
            values.push(4.0 * center - neighbors);
        }
    }
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

/// Estimate page skew from the orientation of the dark-pixel mass, in
/// degrees. `None` when the page has too little ink to measure.
fn skew_angle(gray: &image::GrayImage) -> Option<f64> {
    const INK_THRESHOLD: u8 = 128;
    let mut count = 0f64;
    let mut sum_x = 0f64;
    let mut sum_y = 0f64;
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel[0] < INK_THRESHOLD {
            count += 1.0;
            sum_x += x as f64;
            sum_y += y as f64;
        }
    }
    if count < 100.0 {
        return None;
    }
    let (cx, cy) = (sum_x / count, sum_y / count);

    let (mut mu20, mut mu02, mut mu11) = (0f64, 0f64, 0f64);
    for (x, y, pixel) in gray.enumerate_pixels() {
        if pixel[0] < INK_THRESHOLD {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            mu20 += dx * dx;
            mu02 += dy * dy;
            mu11 += dx * dy;
        }
    }
    let angle = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);
    Some(angle.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{QualityAnalyzer, QualityConfig};

    #[test]
    fn diff_classifies_substitutions_additions_deletions() {
        let old = "the quiek brown fox jumps";
        let new = "the quick brown fox jumps high";
        let diff = word_diff(old, new);
        assert_eq!(
            diff.substitutions,
            vec![Substitution {
                old: "quiek".to_owned(),
                new: "quick".to_owned(),
            }]
        );
        assert_eq!(diff.additions, vec!["high".to_owned()]);
        assert!(diff.deletions.is_empty());
        assert_eq!(diff.summary.substitutions, 1);
        assert_eq!(diff.summary.additions, 1);
    }

    #[test]
    fn identical_text_diffs_empty() {
        let diff = word_diff("same words here", "same words here");
        assert_eq!(diff.summary, DiffSummary::default());
    }

    #[test]
    fn diagnostics_carry_quality_results() {
        let analyzer = QualityAnalyzer::new(QualityConfig::default());
        let quality = analyzer.analyze("the history of reason", None, None);
        let counts = PostprocessCounts::from([("dehyphenations".to_owned(), 2u64)]);
        let diag = build_page_diagnostics(&quality, &counts);
        assert!(diag.signal_scores.contains_key("garbled"));
        assert!(diag.signal_scores.contains_key("dictionary"));
        assert!(!diag.signal_scores.contains_key("confidence"));
        assert_eq!(diag.composite_weights["garbled"], 0.55);
        assert_eq!(diag.postprocess_counts["dehyphenations"], 2);
        assert!(diag.image_quality.is_none());
    }

    #[test]
    fn image_metrics_from_synthetic_pixmap() {
        // Half black, half white: strong contrast, sharp edge.
        let mut img = image::GrayImage::new(64, 64);
        for (x, _y, pixel) in img.enumerate_pixels_mut() {
            pixel[0] = if x < 32 { 0 } else { 255 };
        }
        let mut png = std::io::Cursor::new(vec![]);
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();

        let metrics = image_quality_from_png(png.get_ref(), 300).unwrap();
        assert_eq!(metrics.dpi, Some(300.0));
        assert!(metrics.contrast.unwrap() > 0.4);
        assert!(metrics.blur_score.unwrap() > 50.0);
        assert!(metrics.skew_angle.is_some());
    }

    #[test]
    fn undecodable_image_yields_no_metrics() {
        assert!(image_quality_from_png(b"not a png", 300).is_none());
    }
}
