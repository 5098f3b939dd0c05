//! Terminal UI: progress bars driven by pipeline events.
//!
//! The core emits typed events; this module renders them with `indicatif`.
//! Nothing here is required for library use — the RPC front-end installs its
//! own callback instead.

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::events::{
    ModelEvent, ModelStatus, Phase, PhaseEvent, PhaseStatus, PipelineCallback,
    ProgressEvent,
};

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    /// Our progress bars.
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI.
    pub fn init() -> Ui {
        let multi_progress = Arc::new(MultiProgress::new());
        Ui { multi_progress }
    }

    /// Hide all our progress bars completely.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer that can be used to write to stderr without tearing
    /// through the progress bars, for use with `tracing`.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Get a reference to our progress bars.
    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi_progress
    }

    /// Create a new progress bar with default settings.
    pub fn new_progress_bar(&self, emoji: &str, msg: &str, len: u64) -> ProgressBar {
        let pb = ProgressBar::new(len).with_style(default_progress_style());
        let pb = self.multi_progress.add(pb);
        pb.set_prefix(emoji.to_owned());
        pb.set_message(msg.to_owned());
        pb.enable_steady_tick(Duration::from_millis(250));
        pb
    }

    /// Create a new spinner with default settings.
    pub fn new_spinner(&self, emoji: &str, msg: &str) -> ProgressBar {
        let sp = ProgressBar::new_spinner().with_style(default_spinner_style());
        let sp = self.multi_progress.add(sp);
        sp.set_prefix(emoji.to_owned());
        sp.set_message(msg.to_owned());
        sp.enable_steady_tick(Duration::from_millis(250));
        sp
    }
}

fn default_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {prefix:3}{msg:25} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
        .expect("bad progress bar template")
}

fn default_spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg}")
        .expect("bad progress bar template")
}

/// The pipeline callback that renders progress bars.
pub struct ProgressUi {
    ui: Ui,
    bars: Mutex<Bars>,
}

#[derive(Default)]
struct Bars {
    tesseract: Option<ProgressBar>,
    surya: Option<ProgressBar>,
    model: Option<ProgressBar>,
}

impl ProgressUi {
    pub fn new(ui: Ui) -> Self {
        ProgressUi {
            ui,
            bars: Mutex::new(Bars::default()),
        }
    }
}

impl PipelineCallback for ProgressUi {
    fn on_phase(&self, event: PhaseEvent) {
        let mut bars = self.bars.lock().expect("ui lock poisoned");
        match (event.phase, event.status) {
            (Phase::Tesseract, PhaseStatus::Started) => {
                let len = event.files_count.unwrap_or(0) as u64;
                bars.tesseract =
                    Some(self.ui.new_progress_bar("📄", "Fast OCR", len));
            }
            (Phase::Tesseract, PhaseStatus::Completed) => {
                if let Some(pb) = bars.tesseract.take() {
                    pb.finish_with_message("Fast OCR complete");
                }
            }
            (Phase::Surya, PhaseStatus::Started) => {
                let msg = match event.detail {
                    Some(detail) => format!("Neural OCR ({detail})"),
                    None => "Neural OCR".to_owned(),
                };
                bars.surya = Some(self.ui.new_spinner("🧠", &msg));
            }
            (Phase::Surya, PhaseStatus::Completed) => {
                if let Some(pb) = bars.surya.take() {
                    pb.finish_with_message("Neural OCR complete");
                }
            }
            _ => {}
        }
    }

    fn on_progress(&self, event: ProgressEvent) {
        let bars = self.bars.lock().expect("ui lock poisoned");
        let bar = match event.phase {
            Phase::Tesseract => bars.tesseract.as_ref(),
            Phase::Surya => bars.surya.as_ref(),
            Phase::Quality => None,
        };
        if let Some(bar) = bar {
            if let Some(current) = event.current {
                bar.set_position(current as u64);
            }
            bar.set_message(event.message);
        }
    }

    fn on_model(&self, event: ModelEvent) {
        let mut bars = self.bars.lock().expect("ui lock poisoned");
        match event.status {
            ModelStatus::Loading => {
                bars.model = Some(self.ui.new_spinner(
                    "⏳",
                    &format!("Loading {} models", event.model_name),
                ));
            }
            ModelStatus::Ready => {
                if let Some(pb) = bars.model.take() {
                    let time = event
                        .time_seconds
                        .map(|t| format!(" in {t:.1}s"))
                        .unwrap_or_default();
                    pb.finish_with_message(format!(
                        "{} models ready{time}",
                        event.model_name
                    ));
                }
            }
        }
    }
}

/// A writer which can be used to write to `stderr`. It will hide and show
/// progress bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress().suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress().suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .multi_progress()
            .suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
