//! The fast OCR engine, wrapping the `ocrmypdf` CLI tool.

use tokio::process::Command;

use crate::{async_utils::tail_lines, cpu_limit::with_cpu_semaphore, prelude::*};

use super::{FastOcrEngine, FastOcrError, FastOcrRequest};

/// `ocrmypdf` exit code for "this file already has an OCR layer".
const EXIT_ALREADY_DONE_OCR: i32 = 6;

/// `ocrmypdf` exit code for a missing system dependency.
const EXIT_MISSING_DEPENDENCY: i32 = 3;

/// OCR engine wrapping the `ocrmypdf` CLI tool.
#[non_exhaustive]
pub struct OcrMyPdfEngine {}

impl OcrMyPdfEngine {
    pub fn new() -> Self {
        OcrMyPdfEngine {}
    }
}

impl Default for OcrMyPdfEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastOcrEngine for OcrMyPdfEngine {
    #[instrument(level = "debug", skip_all, fields(input = %request.input_pdf.display()))]
    async fn ocr(&self, request: FastOcrRequest) -> Result<(), FastOcrError> {
        let mut cmd = Command::new("ocrmypdf");
        cmd.arg("--output-type")
            .arg("pdfa")
            .arg("--skip-big")
            .arg(request.skip_big_megapixels.to_string())
            .arg("--jobs")
            .arg(request.jobs.to_string())
            .arg("--tesseract-timeout")
            .arg(request.tesseract_timeout.to_string());
        if request.redo_ocr {
            cmd.arg("--redo-ocr");
        }
        if request.clean {
            cmd.arg("--clean");
        }
        if !request.languages.is_empty() {
            cmd.arg("-l").arg(request.languages.join("+"));
        }
        cmd.arg(&request.input_pdf).arg(&request.output_pdf);

        let output = with_cpu_semaphore(|| async {
            cmd.output().await.with_context(|| {
                format!("failed to run ocrmypdf on {:?}", request.input_pdf.display())
            })
        })
        .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();
        if code == Some(EXIT_ALREADY_DONE_OCR) || stderr.contains("PriorOcrFoundError") {
            return Err(FastOcrError::PriorOcrFound {
                path: request.input_pdf.clone(),
            });
        }
        if code == Some(EXIT_MISSING_DEPENDENCY)
            || stderr.contains("MissingDependencyError")
        {
            return Err(FastOcrError::MissingDependency(tail_lines(&stderr, 3)));
        }
        Err(FastOcrError::Other(anyhow!(
            "ocrmypdf failed with exit code {:?}: {}",
            code,
            tail_lines(&stderr, 8)
        )))
    }
}
