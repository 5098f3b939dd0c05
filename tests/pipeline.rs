//! End-to-end pipeline tests with stub engines.
//!
//! These drive the real scheduler, worker and planner over tiny PDFs built
//! by hand, substituting stub engines at the ports. They need the Poppler
//! tools (and the other gate-checked binaries) on PATH and skip themselves
//! when the environment cannot provide them.

use std::{
    fmt::Write as _,
    path::Path,
    sync::{Arc, Mutex},
};

use scholardoc_ocr::{
    config::PipelineConfig,
    engines::{
        FastOcrEngine, FastOcrError, FastOcrRequest, ModelHandle, NeuralOcrEngine,
        WordDataExtractor,
    },
    events::{ModelEvent, PhaseEvent, PipelineCallback, ProgressEvent},
    quality::confidence::WordConfidence,
    results::Engine,
    run_pipeline_with_engines,
    scheduler::PipelineEngines,
};

const CLEAN_TEXT: &str = "the history of philosophy is a long conversation \
                          about the nature of reason and the limits of human knowledge";

const GARBLED_TEXT: &str = "zzzzzzzz xxxxxxxx qqqqqqqq wwwwwwww kkkkkkkk \
                            mmmmmmmm nnnnnnnn pppppppp rrrrrrrr tttttttt";

/// Can this machine run the full pipeline?
fn env_ready() -> bool {
    let binaries = [
        "ocrmypdf",
        "tesseract",
        "pdfinfo",
        "pdftotext",
        "pdfseparate",
        "pdfunite",
        "pdftoppm",
    ];
    for binary in binaries {
        if which::which(binary).is_err() {
            eprintln!("skipping pipeline test: `{binary}` not on PATH");
            return false;
        }
    }
    let langs = std::process::Command::new("tesseract")
        .arg("--list-langs")
        .output()
        .map(|out| {
            format!(
                "{}{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            )
        })
        .unwrap_or_default();
    if !langs.lines().any(|line| line.trim() == "eng") {
        eprintln!("skipping pipeline test: tesseract `eng` pack missing");
        return false;
    }
    true
}

/// Assemble a minimal valid PDF with one text line per page.
fn write_pdf(path: &Path, pages: &[&str]) {
    let n = pages.len();
    let font_id = 3 + 2 * n;
    let mut objects: Vec<String> = vec![];

    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_owned());
    let kids = (0..n)
        .map(|i| format!("{} 0 R", 3 + 2 * i))
        .collect::<Vec<_>>()
        .join(" ");
    objects.push(format!(
        "<< /Type /Pages /Kids [{kids}] /Count {n} >>"
    ));
    for (i, text) in pages.iter().enumerate() {
        let content = format!("BT /F1 12 Tf 72 720 Td ({text}) Tj ET");
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
             /Contents {} 0 R /Resources << /Font << /F1 {font_id} 0 R >> >> >>",
            4 + 2 * i
        ));
        objects.push(format!(
            "<< /Length {} >>\nstream\n{content}\nendstream",
            content.len()
        ));
    }
    objects.push(
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_owned(),
    );

    let mut body = String::from("%PDF-1.4\n");
    let mut offsets = vec![];
    for (i, object) in objects.iter().enumerate() {
        offsets.push(body.len());
        write!(body, "{} 0 obj\n{}\nendobj\n", i + 1, object).unwrap();
    }
    let xref_offset = body.len();
    write!(body, "xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).unwrap();
    for offset in offsets {
        write!(body, "{offset:010} 00000 n \n").unwrap();
    }
    write!(
        body,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
        objects.len() + 1
    )
    .unwrap();
    std::fs::write(path, body).unwrap();
}

/// A fast engine that must not run; calling it fails the file.
struct RefusingFastEngine;

#[async_trait::async_trait]
impl FastOcrEngine for RefusingFastEngine {
    async fn ocr(&self, request: FastOcrRequest) -> Result<(), FastOcrError> {
        Err(FastOcrError::Other(anyhow::anyhow!(
            "fast engine unexpectedly invoked for {:?}",
            request.input_pdf
        )))
    }
}

/// A fast engine that "re-OCRs" by copying the input to the output.
struct CopyingFastEngine;

#[async_trait::async_trait]
impl FastOcrEngine for CopyingFastEngine {
    async fn ocr(&self, request: FastOcrRequest) -> Result<(), FastOcrError> {
        tokio::fs::copy(&request.input_pdf, &request.output_pdf)
            .await
            .map_err(|err| FastOcrError::Other(err.into()))?;
        Ok(())
    }
}

/// A fast engine that never finishes.
struct HangingFastEngine;

#[async_trait::async_trait]
impl FastOcrEngine for HangingFastEngine {
    async fn ocr(&self, _request: FastOcrRequest) -> Result<(), FastOcrError> {
        tokio::time::sleep(std::time::Duration::from_secs(120)).await;
        Ok(())
    }
}

/// A neural engine that returns clean prose for every requested page.
struct StubNeuralEngine;

#[async_trait::async_trait]
impl NeuralOcrEngine for StubNeuralEngine {
    async fn load_models(&self, device: Option<&str>) -> anyhow::Result<ModelHandle> {
        Ok(ModelHandle {
            model_name: "surya".to_owned(),
            device: device.unwrap_or("cpu").to_owned(),
            load_seconds: 0.01,
        })
    }

    async fn convert_pdf(
        &self,
        _input_pdf: &Path,
        _models: &ModelHandle,
        _languages: &[String],
        _force_ocr: bool,
        page_range: Option<(usize, usize)>,
    ) -> anyhow::Result<String> {
        let pages = page_range.map(|(a, b)| b - a + 1).unwrap_or(1);
        let body = (0..pages)
            .map(|_| CLEAN_TEXT.to_owned())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        Ok(body)
    }

    async fn release_accelerator_memory(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A word extractor reporting uniformly confident words.
struct ConfidentWords;

#[async_trait::async_trait]
impl WordDataExtractor for ConfidentWords {
    async fn image_to_data(
        &self,
        _image_png: &[u8],
        _languages: &[String],
    ) -> anyhow::Result<Vec<WordConfidence>> {
        Ok((0..10)
            .map(|i| WordConfidence {
                text: format!("word{i}"),
                conf: 95.0,
            })
            .collect())
    }
}

/// Records every event for ordering assertions.
#[derive(Default)]
struct RecordingCallback {
    events: Mutex<Vec<String>>,
}

impl RecordingCallback {
    fn lines(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl PipelineCallback for RecordingCallback {
    fn on_phase(&self, event: PhaseEvent) {
        self.events
            .lock()
            .unwrap()
            .push(format!("phase:{:?}:{:?}", event.phase, event.status));
    }

    fn on_progress(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap()
            .push(format!("progress:{:?}", event.phase));
    }

    fn on_model(&self, event: ModelEvent) {
        self.events
            .lock()
            .unwrap()
            .push(format!("model:{:?}", event.status));
    }
}

fn base_config(input_dir: &Path, output_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        input_dir: input_dir.to_owned(),
        output_dir: output_dir.to_owned(),
        quality_threshold: 0.85,
        force_tesseract: false,
        force_surya: false,
        max_workers: Some(2),
        langs: "en".to_owned(),
        langs_tesseract: None,
        langs_surya: None,
        files: vec![],
        recursive: false,
        extract_text: false,
        diagnostics: false,
        keep_intermediates: false,
        timeout: 120,
        batch_size: 50,
        device: None,
    }
}

#[tokio::test]
async fn happy_path_takes_the_existing_text_route() {
    if !env_ready() {
        return;
    }
    let input = tempfile::TempDir::new().unwrap();
    let output = tempfile::TempDir::new().unwrap();
    write_pdf(&input.path().join("alpha.pdf"), &[CLEAN_TEXT, CLEAN_TEXT]);
    write_pdf(&input.path().join("beta.pdf"), &[CLEAN_TEXT]);

    let callback = Arc::new(RecordingCallback::default());
    let engines = PipelineEngines {
        fast: Arc::new(RefusingFastEngine),
        neural: Arc::new(StubNeuralEngine),
        word_data: Arc::new(ConfidentWords),
    };
    let batch = run_pipeline_with_engines(
        base_config(input.path(), output.path()),
        engines,
        callback.clone(),
    )
    .await
    .unwrap();

    assert_eq!(batch.total_files, 2);
    assert_eq!(batch.successful, 2);
    assert_eq!(batch.failed, 0);
    assert_eq!(batch.files[0].filename, "alpha.pdf");
    for file in &batch.files {
        assert!(file.success);
        assert_eq!(file.engine, Engine::Existing);
        assert!(file.quality_score >= 0.85);
        assert!(file.output_path.as_ref().unwrap().exists());
    }
    assert!(output.path().join("final/alpha.json").exists());
    assert!(output.path().join("final/beta.json").exists());
    // Work directory removed, no neural phase ran.
    assert!(!output.path().join("work").exists());
    let lines = callback.lines();
    assert!(lines.contains(&"phase:Tesseract:Started".to_owned()));
    assert!(lines.contains(&"phase:Tesseract:Completed".to_owned()));
    assert!(!lines.iter().any(|l| l.starts_with("model:")));
}

#[tokio::test]
async fn garbled_page_is_rewritten_by_the_neural_pass() {
    if !env_ready() {
        return;
    }
    let input = tempfile::TempDir::new().unwrap();
    let output = tempfile::TempDir::new().unwrap();
    write_pdf(
        &input.path().join("mixed.pdf"),
        &[CLEAN_TEXT, GARBLED_TEXT],
    );

    let callback = Arc::new(RecordingCallback::default());
    let engines = PipelineEngines {
        fast: Arc::new(CopyingFastEngine),
        neural: Arc::new(StubNeuralEngine),
        word_data: Arc::new(ConfidentWords),
    };
    let batch = run_pipeline_with_engines(
        base_config(input.path(), output.path()),
        engines,
        callback.clone(),
    )
    .await
    .unwrap();

    assert_eq!(batch.successful, 1);
    let file = &batch.files[0];
    assert_eq!(file.engine, Engine::Mixed);
    assert_eq!(file.pages[0].engine, Engine::Tesseract);
    assert_eq!(file.pages[1].engine, Engine::Surya);
    assert!(!file.pages[1].flagged);
    assert!(file.pages[1].quality_score >= 0.85);

    let lines = callback.lines();
    let loading = lines.iter().filter(|l| *l == "model:Loading").count();
    let ready = lines.iter().filter(|l| *l == "model:Ready").count();
    assert_eq!(loading, 1);
    assert_eq!(ready, 1);
    // Phase ordering: surya never starts before tesseract completes.
    let tesseract_done = lines
        .iter()
        .position(|l| l == "phase:Tesseract:Completed")
        .unwrap();
    let surya_start = lines
        .iter()
        .position(|l| l == "phase:Surya:Started")
        .unwrap();
    assert!(tesseract_done < surya_start);
}

#[tokio::test]
async fn timed_out_file_fails_without_hurting_the_rest() {
    if !env_ready() {
        return;
    }
    let input = tempfile::TempDir::new().unwrap();
    let output = tempfile::TempDir::new().unwrap();
    write_pdf(&input.path().join("clean.pdf"), &[CLEAN_TEXT]);
    write_pdf(&input.path().join("stuck.pdf"), &[GARBLED_TEXT]);

    let mut config = base_config(input.path(), output.path());
    config.timeout = 10;
    let engines = PipelineEngines {
        fast: Arc::new(HangingFastEngine),
        neural: Arc::new(StubNeuralEngine),
        word_data: Arc::new(ConfidentWords),
    };
    let batch = run_pipeline_with_engines(
        config,
        engines,
        Arc::new(RecordingCallback::default()),
    )
    .await
    .unwrap();

    assert_eq!(batch.total_files, 2);
    assert_eq!(batch.successful, 1);
    assert_eq!(batch.failed, 1);
    let stuck = batch
        .files
        .iter()
        .find(|f| f.filename == "stuck.pdf")
        .unwrap();
    assert!(!stuck.success);
    assert_eq!(stuck.engine, Engine::None);
    assert!(stuck.error.as_ref().unwrap().contains("timed out after 10s"));
    assert!(stuck.output_path.is_none());
    let clean = batch
        .files
        .iter()
        .find(|f| f.filename == "clean.pdf")
        .unwrap();
    assert!(clean.success);
}
