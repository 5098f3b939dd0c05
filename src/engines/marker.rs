//! The neural OCR engine, wrapping the Surya-based `marker_single` CLI tool.
//!
//! `marker_single` keeps its model weights in an on-disk cache, so "loading
//! models" here means one warmup invocation that forces the download and a
//! first import; conversions after that start fast. The returned handle
//! records the device and load duration for the model events.

use std::time::Instant;

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::{ModelHandle, NeuralOcrEngine};

/// The model set name reported in model events.
pub const MODEL_NAME: &str = "surya";

/// Neural engine wrapping the `marker_single` CLI tool.
pub struct MarkerEngine {
    binary: String,
}

impl MarkerEngine {
    pub fn new() -> Self {
        MarkerEngine {
            binary: "marker_single".to_owned(),
        }
    }
}

impl Default for MarkerEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NeuralOcrEngine for MarkerEngine {
    #[instrument(level = "debug", skip_all, fields(device))]
    async fn load_models(&self, device: Option<&str>) -> Result<ModelHandle> {
        let started = Instant::now();
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--version");
        if let Some(device) = device {
            cmd.env("TORCH_DEVICE", device);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to run {} for model warmup", self.binary))?;
        check_for_command_failure(&self.binary, &output)?;
        let load_seconds = started.elapsed().as_secs_f64();
        info!(load_seconds, "neural model warmup complete");
        Ok(ModelHandle {
            model_name: MODEL_NAME.to_owned(),
            device: device.unwrap_or("cpu").to_owned(),
            load_seconds,
        })
    }

    #[instrument(
        level = "debug",
        skip_all,
        fields(input = %input_pdf.display(), ?page_range)
    )]
    async fn convert_pdf(
        &self,
        input_pdf: &Path,
        models: &ModelHandle,
        languages: &[String],
        force_ocr: bool,
        page_range: Option<(usize, usize)>,
    ) -> Result<String> {
        let tmpdir = tempfile::TempDir::with_prefix("marker")?;
        let mut cmd = Command::new(&self.binary);
        cmd.arg(input_pdf)
            .arg("--output_format")
            .arg("markdown")
            .arg("--output_dir")
            .arg(tmpdir.path())
            .env("TORCH_DEVICE", &models.device);
        if force_ocr {
            cmd.arg("--force_ocr");
        }
        if !languages.is_empty() {
            cmd.arg("--languages").arg(languages.join(","));
        }
        if let Some((first, last)) = page_range {
            cmd.arg("--page_range").arg(format!("{first}-{last}"));
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to run {} on {:?}", self.binary, input_pdf.display()))?;
        check_for_command_failure(&self.binary, &output)?;

        // The tool writes `{stem}/{stem}.md` under the output directory.
        let markdown_path = find_markdown(tmpdir.path())?;
        std::fs::read_to_string(&markdown_path).with_context(|| {
            format!("cannot read markdown output {:?}", markdown_path.display())
        })
    }

    async fn release_accelerator_memory(&self) -> Result<()> {
        // Each conversion is its own process, so the accelerator cache dies
        // with it. Nothing to release from here.
        debug!("accelerator release requested; no resident allocations");
        Ok(())
    }
}

/// Find the single `.md` file the converter wrote.
fn find_markdown(dir: &Path) -> Result<PathBuf> {
    let mut found = vec![];
    let mut stack = vec![dir.to_owned()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("cannot read {:?}", current.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "md") {
                found.push(path);
            }
        }
    }
    found.sort();
    found
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("converter produced no markdown under {:?}", dir.display()))
}
