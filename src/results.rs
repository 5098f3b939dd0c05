//! The result tree returned by a pipeline run.
//!
//! `BatchResult` → `FileResult` → `PageResult`, plus the per-page quality and
//! diagnostic records that hang off them. Everything here is a plain value:
//! workers build these, hand them back across the task boundary, and the
//! scheduler owns the only growing collection.

use std::collections::{BTreeMap, BTreeSet};

use crate::prelude::*;

/// Which engine produced the text currently attached to a page (or file).
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// The PDF's existing text layer was good enough.
    Existing,
    /// Text came from the fast Tesseract pass.
    Tesseract,
    /// Text was rewritten by the neural pass.
    Surya,
    /// A file whose pages disagree.
    Mixed,
    /// No engine produced text (failures, empty files).
    #[default]
    None,
}

/// Combine two page engines into a file-level aggregate, ignoring `None`.
///
/// This is associative with `None` as the unit, so files can be folded in any
/// grouping.
fn combine_engines(a: Engine, b: Engine) -> Engine {
    match (a, b) {
        (Engine::None, e) | (e, Engine::None) => e,
        (a, b) if a == b => a,
        _ => Engine::Mixed,
    }
}

/// Compute the deterministic file-level engine from its pages.
pub fn compute_engine<'a>(pages: impl IntoIterator<Item = &'a PageResult>) -> Engine {
    pages
        .into_iter()
        .map(|p| p.engine)
        .fold(Engine::None, combine_engines)
}

/// Quality verdict for a single page.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// The page met the quality threshold.
    #[default]
    Good,
    /// The page is below threshold and is a candidate for the neural pass.
    Flagged,
    /// Processing failed outright for this page.
    Failed,
}

/// Names of the quality signals.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SignalName {
    Garbled,
    Dictionary,
    Confidence,
}

impl SignalName {
    /// The stable string form used as a key in diagnostics maps.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalName::Garbled => "garbled",
            SignalName::Dictionary => "dictionary",
            SignalName::Confidence => "confidence",
        }
    }
}

/// One quality signal's verdict for one page.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SignalResult {
    /// Which signal produced this.
    pub name: SignalName,
    /// Score in `[0, 1]`, higher is better.
    pub score: f64,
    /// Did the score clear this signal's floor?
    pub passed: bool,
    /// Signal-specific counters and samples.
    pub details: BTreeMap<String, Value>,
}

/// Descriptive labels for *why* a page scored badly. Each rule is independent,
/// so a page may carry several.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StruggleCategory {
    BadScan,
    CharacterConfusion,
    VocabularyMiss,
    LayoutError,
    LanguageConfusion,
    SignalDisagreement,
    GrayZone,
    SuryaInsufficient,
}

/// A pairwise disagreement between two signals.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SignalDisagreement {
    /// First signal of the (unordered) pair.
    pub a: SignalName,
    /// Second signal of the pair.
    pub b: SignalName,
    /// `|score_a - score_b|`.
    pub magnitude: f64,
}

/// One word-level substitution in an [`EngineDiff`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Substitution {
    pub old: String,
    pub new: String,
}

/// Counts summarizing an [`EngineDiff`].
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiffSummary {
    pub additions: usize,
    pub deletions: usize,
    pub substitutions: usize,
}

/// Word-level comparison of two engines' text for the same page.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EngineDiff {
    /// Words only the newer text contains.
    pub additions: Vec<String>,
    /// Words only the older text contains.
    pub deletions: Vec<String>,
    /// Paired old/new words where one replaced the other.
    pub substitutions: Vec<Substitution>,
    /// Counts of the lists above.
    pub summary: DiffSummary,
}

/// Image-quality metrics for a rendered page. Only captured when diagnostics
/// mode is on; individual metrics may be missing if their kernel failed.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ImageQuality {
    pub dpi: Option<f64>,
    pub contrast: Option<f64>,
    pub blur_score: Option<f64>,
    pub skew_angle: Option<f64>,
}

/// Per-page diagnostics. The always-captured block is cheap and attached to
/// every page after Phase 1; the gated fields are present only when
/// diagnostics mode is enabled.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PageDiagnostics {
    /// Score per available signal, keyed by signal name.
    pub signal_scores: BTreeMap<String, f64>,
    /// Details map per available signal.
    pub signal_details: BTreeMap<String, Value>,
    /// The weight vector actually used by the compositor.
    pub composite_weights: BTreeMap<String, f64>,
    /// All pairwise signal disagreements.
    pub signal_disagreements: Vec<SignalDisagreement>,
    /// True if any pair differs by more than 0.3.
    pub has_signal_disagreement: bool,
    /// Per-transform change counters from post-processing.
    pub postprocess_counts: BTreeMap<String, u64>,
    /// Why the page struggled, if it did.
    pub struggle_categories: BTreeSet<StruggleCategory>,

    /// Gated: image-quality metrics for the rendered page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_quality: Option<ImageQuality>,
    /// Gated: the fast engine's text for this page, kept for comparison.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tesseract_text: Option<String>,
    /// Gated: word-level diff between the fast and neural text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_diff: Option<EngineDiff>,
}

/// One page of one input file.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PageResult {
    /// 0-indexed, dense within the file.
    pub page_number: usize,
    pub status: PageStatus,
    /// Most recent composite analyzer output, in `[0, 1]`.
    pub quality_score: f64,
    pub engine: Engine,
    /// Redundant with `status == Flagged`, kept for flat consumers.
    pub flagged: bool,
    /// The page's current text. Omitted from metadata sidecars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<PageDiagnostics>,
}

impl PageResult {
    /// Serialize, optionally stripping the (potentially large) page text.
    pub fn to_json(&self, include_text: bool) -> Result<Value> {
        let mut value = serde_json::to_value(self)
            .context("failed to serialize page result")?;
        if !include_text {
            if let Value::Object(map) = &mut value {
                map.remove("text");
            }
        }
        Ok(value)
    }
}

/// One input file's outcome.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FileResult {
    pub filename: String,
    pub success: bool,
    /// Deterministic aggregate of the per-page engines.
    pub engine: Engine,
    /// Mean page quality, in `[0, 1]`.
    pub quality_score: f64,
    pub page_count: usize,
    /// Sorted by `page_number` ascending, no gaps.
    pub pages: Vec<PageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub time_seconds: f64,
    pub phase_timings: BTreeMap<String, f64>,
}

impl FileResult {
    /// Build a failure result: no output, no usable pages.
    pub fn failure(filename: impl Into<String>, error: impl Into<String>) -> Self {
        FileResult {
            filename: filename.into(),
            success: false,
            engine: Engine::None,
            quality_score: 0.0,
            page_count: 0,
            pages: vec![],
            error: Some(error.into()),
            output_path: None,
            time_seconds: 0.0,
            phase_timings: BTreeMap::new(),
        }
    }

    /// Recompute the file-level engine from the pages. Called once at Phase 2
    /// close; the value is frozen afterwards.
    pub fn recompute_engine(&mut self) {
        self.engine = compute_engine(&self.pages);
    }

    /// Recompute the file-level quality score as the mean of page scores.
    pub fn recompute_quality(&mut self) {
        if self.pages.is_empty() {
            self.quality_score = 0.0;
        } else {
            self.quality_score = self.pages.iter().map(|p| p.quality_score).sum::<f64>()
                / self.pages.len() as f64;
        }
    }

    /// Serialize for the metadata sidecar, optionally without page text.
    pub fn to_json(&self, include_text: bool) -> Result<Value> {
        let mut value = serde_json::to_value(self)
            .context("failed to serialize file result")?;
        if !include_text {
            if let Value::Object(map) = &mut value {
                if let Some(Value::Array(pages)) = map.get_mut("pages") {
                    for page in pages {
                        if let Value::Object(page_map) = page {
                            page_map.remove("text");
                        }
                    }
                }
            }
        }
        Ok(value)
    }
}

/// The outcome of one whole pipeline run.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BatchResult {
    /// Sorted by filename.
    pub files: Vec<FileResult>,
    pub total_files: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_time: f64,
    pub phase_timings: BTreeMap<String, f64>,
}

impl BatchResult {
    /// Build a batch result from collected file results, sorting and counting.
    pub fn from_files(
        mut files: Vec<FileResult>,
        total_time: f64,
        phase_timings: BTreeMap<String, f64>,
    ) -> Self {
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        let total_files = files.len();
        let successful = files.iter().filter(|f| f.success).count();
        let failed = total_files - successful;
        BatchResult {
            files,
            total_files,
            successful,
            failed,
            total_time,
            phase_timings,
        }
    }

    /// The `{summary: ..., files: [...]}` JSON shape used by front-ends.
    pub fn to_json(&self, include_text: bool) -> Result<Value> {
        let files = self
            .files
            .iter()
            .map(|f| f.to_json(include_text))
            .collect::<Result<Vec<_>>>()?;
        Ok(json!({
            "summary": {
                "total_files": self.total_files,
                "successful": self.successful,
                "failed": self.failed,
                "total_time": self.total_time,
                "phase_timings": self.phase_timings,
            },
            "files": files,
        }))
    }
}

/// A page selected for the neural pass, identified by (file, page) plus its
/// position in the combined batch PDF.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlaggedPage {
    pub source_file: PathBuf,
    pub source_page_index: usize,
    /// Position in the combined PDF. Unique and sequential from zero across
    /// a batch.
    pub batch_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: usize, engine: Engine) -> PageResult {
        PageResult {
            page_number: n,
            status: PageStatus::Good,
            quality_score: 0.9,
            engine,
            flagged: false,
            text: None,
            diagnostics: None,
        }
    }

    #[test]
    fn engine_aggregate_rules() {
        let no_pages: Vec<PageResult> = vec![];
        assert_eq!(compute_engine(&no_pages), Engine::None);
        assert_eq!(compute_engine(&[page(0, Engine::None)]), Engine::None);
        assert_eq!(
            compute_engine(&[page(0, Engine::Existing), page(1, Engine::Existing)]),
            Engine::Existing
        );
        assert_eq!(
            compute_engine(&[page(0, Engine::Tesseract), page(1, Engine::Surya)]),
            Engine::Mixed
        );
        // `None` pages are ignored, not counted as disagreement.
        assert_eq!(
            compute_engine(&[page(0, Engine::Surya), page(1, Engine::None)]),
            Engine::Surya
        );
    }

    #[test]
    fn engine_aggregate_is_associative() {
        let pages = [
            page(0, Engine::Existing),
            page(1, Engine::None),
            page(2, Engine::Tesseract),
            page(3, Engine::Tesseract),
        ];
        for split in 0..=pages.len() {
            let (left, right) = pages.split_at(split);
            let folded =
                combine_engines(compute_engine(left), compute_engine(right));
            assert_eq!(folded, compute_engine(&pages));
        }
    }

    #[test]
    fn file_result_round_trips_through_json() {
        let mut fr = FileResult {
            filename: "kant_critique.pdf".to_owned(),
            success: true,
            engine: Engine::Mixed,
            quality_score: 0.78,
            page_count: 2,
            pages: vec![page(0, Engine::Existing), page(1, Engine::Surya)],
            error: None,
            output_path: Some(PathBuf::from("/out/final/kant_critique.pdf")),
            time_seconds: 12.5,
            phase_timings: BTreeMap::from([("tesseract".to_owned(), 10.0)]),
        };
        fr.pages[1].diagnostics = Some(PageDiagnostics {
            signal_scores: BTreeMap::from([("garbled".to_owned(), 0.4)]),
            struggle_categories: BTreeSet::from([
                StruggleCategory::CharacterConfusion,
                StruggleCategory::GrayZone,
            ]),
            ..PageDiagnostics::default()
        });

        let value = serde_json::to_value(&fr).unwrap();
        let back: FileResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, fr);
    }

    #[test]
    fn sidecar_json_strips_text_but_keeps_pages() {
        let mut fr = FileResult::failure("x.pdf", "boom");
        fr.pages = vec![PageResult {
            text: Some("secret page text".to_owned()),
            ..page(0, Engine::Tesseract)
        }];
        let value = fr.to_json(false).unwrap();
        let pages = value.get("pages").and_then(Value::as_array).unwrap();
        assert!(pages[0].get("text").is_none());
        assert_eq!(pages[0].get("page_number"), Some(&json!(0)));
    }

    #[test]
    fn batch_result_counts_and_sorts() {
        let batch = BatchResult::from_files(
            vec![
                FileResult::failure("b.pdf", "bad"),
                FileResult {
                    success: true,
                    error: None,
                    ..FileResult::failure("a.pdf", "")
                },
            ],
            3.0,
            BTreeMap::new(),
        );
        assert_eq!(batch.total_files, 2);
        assert_eq!(batch.successful, 1);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.files[0].filename, "a.pdf");
        assert_eq!(batch.successful + batch.failed, batch.total_files);
    }
}
