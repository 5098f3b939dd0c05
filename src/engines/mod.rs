//! Ports to the external OCR engines.
//!
//! The pipeline core only knows these traits. The default implementations
//! wrap the `ocrmypdf`, `marker_single` and `tesseract` CLI tools, but tests
//! substitute their own.

pub mod marker;
pub mod ocrmypdf;
pub mod tesseract_data;

use thiserror::Error;

use crate::{prelude::*, quality::confidence::WordConfidence};

/// Failure kinds from the fast engine that callers must distinguish.
#[derive(Debug, Error)]
pub enum FastOcrError {
    /// The file already carries an OCR layer. Treated as success upstream.
    #[error("prior OCR found in {path:?}")]
    PriorOcrFound { path: PathBuf },

    /// A system dependency of the engine is missing.
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One fast-engine invocation.
#[derive(Clone, Debug)]
pub struct FastOcrRequest {
    pub input_pdf: PathBuf,
    pub output_pdf: PathBuf,
    /// Engine-format language codes (e.g. `deu`, `eng`).
    pub languages: Vec<String>,
    /// Rasterize and re-OCR even where a text layer exists.
    pub redo_ocr: bool,
    /// Run the engine's page cleaner before OCR.
    pub clean: bool,
    /// Worker threads the engine may use for this file.
    pub jobs: usize,
    /// Per-invocation tesseract timeout, seconds.
    pub tesseract_timeout: u64,
    /// Skip images above this many megapixels.
    pub skip_big_megapixels: u32,
}

/// The fast OCR engine: PDF in, searchable PDF/A out.
#[async_trait]
pub trait FastOcrEngine: Send + Sync + 'static {
    async fn ocr(&self, request: FastOcrRequest) -> Result<(), FastOcrError>;
}

/// An opaque handle to loaded neural models. Borrowed by callers for the
/// duration of a conversion; the model cache owns the long-lived copy.
#[derive(Clone, Debug)]
pub struct ModelHandle {
    pub model_name: String,
    pub device: String,
    /// How long the load took, for the `ModelEvent(ready)` announcement.
    pub load_seconds: f64,
}

/// The neural OCR engine: page range of a PDF in, Markdown out.
#[async_trait]
pub trait NeuralOcrEngine: Send + Sync + 'static {
    /// Load (or warm) the model set on the given device.
    async fn load_models(&self, device: Option<&str>) -> Result<ModelHandle>;

    /// Convert an inclusive 0-based page range (whole file when `None`).
    async fn convert_pdf(
        &self,
        input_pdf: &Path,
        models: &ModelHandle,
        languages: &[String],
        force_ocr: bool,
        page_range: Option<(usize, usize)>,
    ) -> Result<String>;

    /// Ask the accelerator to drop its cached allocations, if it has any.
    /// Must not unload the models themselves.
    async fn release_accelerator_memory(&self) -> Result<()>;
}

/// The word-level OCR data extractor behind the confidence signal.
#[async_trait]
pub trait WordDataExtractor: Send + Sync + 'static {
    /// Run word OCR over a rendered page image.
    async fn image_to_data(
        &self,
        image_png: &[u8],
        languages: &[String],
    ) -> Result<Vec<WordConfidence>>;
}
