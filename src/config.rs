//! Pipeline configuration and input discovery.

use clap::Args;

use crate::{prelude::*, quality::QualityConfig};

/// Canonical ISO 639-1 codes with their per-engine spellings:
/// `(iso, tesseract, surya)`.
const LANGUAGE_MAP: &[(&str, &str, &str)] = &[
    ("de", "deu", "de"),
    ("el", "ell", "el"),
    ("en", "eng", "en"),
    ("es", "spa", "es"),
    ("fr", "fra", "fr"),
    ("it", "ita", "it"),
    ("la", "lat", "la"),
    ("nl", "nld", "nl"),
    ("pt", "por", "pt"),
    ("ru", "rus", "ru"),
];

/// Map an ISO 639-1 code to the fast engine's format.
pub fn iso_to_tesseract(code: &str) -> Option<&'static str> {
    LANGUAGE_MAP
        .iter()
        .find(|(iso, _, _)| *iso == code)
        .map(|(_, tess, _)| *tess)
}

/// Map an ISO 639-1 code to the neural engine's format.
pub fn iso_to_surya(code: &str) -> Option<&'static str> {
    LANGUAGE_MAP
        .iter()
        .find(|(iso, _, _)| *iso == code)
        .map(|(_, _, surya)| *surya)
}

/// Configuration recognized by the pipeline core.
#[derive(Args, Clone, Debug)]
pub struct PipelineConfig {
    /// Directory containing the input PDFs.
    pub input_dir: PathBuf,

    /// Root output directory; `final/`, `work/` and `logs/` are created
    /// underneath.
    #[clap(short = 'o', long)]
    pub output_dir: PathBuf,

    /// Page flagging cutoff for the composite quality score.
    #[clap(long, default_value = "0.85")]
    pub quality_threshold: f64,

    /// Skip the existing-text path; always run the fast engine.
    #[clap(long)]
    pub force_tesseract: bool,

    /// Treat every page as flagged regardless of score.
    #[clap(long)]
    pub force_surya: bool,

    /// Upper bound on Phase 1 parallelism. Defaults to the CPU count.
    #[clap(long)]
    pub max_workers: Option<usize>,

    /// Languages as ISO 639-1 codes, comma-separated.
    #[clap(long, default_value = "en")]
    pub langs: String,

    /// Override the fast engine's language codes (engine format,
    /// comma-separated). Derived from `--langs` when absent.
    #[clap(long)]
    pub langs_tesseract: Option<String>,

    /// Override the neural engine's language codes (engine format,
    /// comma-separated). Derived from `--langs` when absent.
    #[clap(long)]
    pub langs_surya: Option<String>,

    /// Explicit file list relative to the input directory. When empty,
    /// every `*.pdf` under the input directory is processed.
    #[clap(long = "file")]
    pub files: Vec<PathBuf>,

    /// Recurse into subdirectories when globbing.
    #[clap(long)]
    pub recursive: bool,

    /// Keep per-page `.txt` files (and write the full-text file) in
    /// `final/`.
    #[clap(long)]
    pub extract_text: bool,

    /// Capture gated diagnostics: image metrics, engine diffs, and
    /// `.diagnostics.json` sidecars.
    #[clap(long)]
    pub diagnostics: bool,

    /// Preserve `work/` after the run.
    #[clap(long)]
    pub keep_intermediates: bool,

    /// Per-file Phase 1 timeout, in seconds.
    #[clap(long, default_value = "600")]
    pub timeout: u64,

    /// Maximum pages per Phase 2 sub-batch.
    #[clap(long, default_value = "50")]
    pub batch_size: usize,

    /// Device for the neural engine (for example `cuda`). Defaults to CPU.
    #[clap(long)]
    pub device: Option<String>,
}

impl PipelineConfig {
    pub fn final_dir(&self) -> PathBuf {
        self.output_dir.join("final")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.output_dir.join("work")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }

    /// ISO codes as listed, trimmed and de-blanked.
    pub fn iso_languages(&self) -> Vec<String> {
        self.langs
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Fast-engine language codes, from the override or the ISO map.
    /// Unknown ISO codes pass through unchanged so uncommon tesseract
    /// packs remain reachable.
    pub fn tesseract_languages(&self) -> Vec<String> {
        match &self.langs_tesseract {
            Some(codes) => split_codes(codes),
            None => self
                .iso_languages()
                .iter()
                .map(|code| {
                    iso_to_tesseract(code).map(str::to_owned).unwrap_or_else(|| code.clone())
                })
                .collect(),
        }
    }

    /// Neural-engine language codes, from the override or the ISO map.
    pub fn surya_languages(&self) -> Vec<String> {
        match &self.langs_surya {
            Some(codes) => split_codes(codes),
            None => self
                .iso_languages()
                .iter()
                .map(|code| {
                    iso_to_surya(code).map(str::to_owned).unwrap_or_else(|| code.clone())
                })
                .collect(),
        }
    }

    /// The quality thresholds derived from this configuration.
    pub fn quality_config(&self) -> QualityConfig {
        QualityConfig {
            threshold: self.quality_threshold,
            ..QualityConfig::default()
        }
    }

    /// Reject configurations that cannot possibly work, with a clear
    /// message, before anything runs.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(anyhow!(
                "quality threshold must be between 0 and 1, got {}",
                self.quality_threshold
            ));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("batch size must be at least 1"));
        }
        if self.iso_languages().is_empty() {
            return Err(anyhow!("at least one language is required"));
        }
        Ok(())
    }

    /// Resolve the input files: the explicit list when given, otherwise a
    /// `*.pdf` glob over the input directory.
    pub fn discover_inputs(&self) -> Result<Vec<PathBuf>> {
        if !self.files.is_empty() {
            return self
                .files
                .iter()
                .map(|rel| {
                    let path = self.input_dir.join(rel);
                    if path.is_file() {
                        Ok(path)
                    } else {
                        Err(anyhow!("input file {:?} does not exist", path.display()))
                    }
                })
                .collect();
        }

        let mut found = vec![];
        let mut stack = vec![self.input_dir.clone()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("cannot read input directory {:?}", dir.display()))?;
            for entry in entries {
                let path = entry?.path();
                if path.is_dir() {
                    if self.recursive {
                        stack.push(path);
                    }
                } else if path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
                {
                    found.push(path);
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

fn split_codes(codes: &str) -> Vec<String> {
    codes
        .split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_owned)
        .collect()
}
