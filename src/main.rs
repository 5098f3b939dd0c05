use std::{process::ExitCode, str::FromStr, sync::Arc};

use clap::Parser;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use scholardoc_ocr::{
    config::PipelineConfig,
    events::PipelineCallback,
    prelude::*,
    scheduler,
    ui::{ProgressUi, Ui},
};

/// Exit code reported when the run is interrupted.
const EXIT_INTERRUPTED: u8 = 130;

/// OCR scanned academic PDFs with Tesseract, escalating bad pages to Surya.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - SCHOLARDOC_MODEL_TTL_SECS (optional): Neural model cache TTL.
  - RUST_LOG (optional): Console log filter.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(flatten)]
    config: PipelineConfig,

    /// Print the batch result as JSON on stdout.
    #[clap(long)]
    json: bool,
}

/// Our entry point. Errors before the run starts (bad configuration, broken
/// environment) print through [`anyhow::Result`] handling.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<ExitCode> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // The progress bars would tear JSON output apart.
    if opts.json {
        ui.hide_progress_bars();
    }

    let callback: Arc<dyn PipelineCallback> = Arc::new(ProgressUi::new(ui.clone()));
    let run = scheduler::run_pipeline(opts.config, callback);

    let batch = tokio::select! {
        batch = run => batch?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&batch.to_json(false)?)?);
    } else {
        info!(
            total = batch.total_files,
            successful = batch.successful,
            failed = batch.failed,
            total_time_seconds = batch.total_time,
            "run complete"
        );
        for file in batch.files.iter().filter(|f| !f.success) {
            warn!(
                file = %file.filename,
                error = file.error.as_deref().unwrap_or("unknown"),
                "file failed"
            );
        }
    }

    if batch.failed == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
