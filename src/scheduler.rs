//! The two-phase orchestrator.
//!
//! Phase 1 fans the input files out to parallel workers, each bounded by the
//! per-file timeout. Phase 2 gathers every flagged page into one shared
//! neural pass through the model cache. After environment validation the
//! scheduler never raises: all failure ends up inside the returned
//! [`BatchResult`], and the log relay is stopped on every exit path.

use std::{collections::BTreeMap, sync::Arc, time::{Duration, Instant}};

use futures::StreamExt as _;

use crate::{
    config::PipelineConfig,
    engines::{
        FastOcrEngine, NeuralOcrEngine, WordDataExtractor, marker::MarkerEngine,
        ocrmypdf::OcrMyPdfEngine, tesseract_data::TesseractWordData,
    },
    env_gate,
    events::{
        ModelEvent, ModelStatus, Phase, PhaseEvent, PhaseStatus, PipelineCallback,
        ProgressEvent,
    },
    logging::{LogRelay, format_error_chain},
    model_cache,
    planner,
    prelude::*,
    quality::QualityAnalyzer,
    results::{BatchResult, FileResult},
    sidecar,
    worker::{self, WorkerContext},
};

/// The engine set a run uses. Tests substitute stubs here.
pub struct PipelineEngines {
    pub fast: Arc<dyn FastOcrEngine>,
    pub neural: Arc<dyn NeuralOcrEngine>,
    pub word_data: Arc<dyn WordDataExtractor>,
}

impl Default for PipelineEngines {
    fn default() -> Self {
        PipelineEngines {
            fast: Arc::new(OcrMyPdfEngine::new()),
            neural: Arc::new(MarkerEngine::new()),
            word_data: Arc::new(TesseractWordData::new()),
        }
    }
}

/// Run the pipeline with the default CLI-backed engines.
pub async fn run_pipeline(
    config: PipelineConfig,
    callback: Arc<dyn PipelineCallback>,
) -> Result<BatchResult> {
    run_pipeline_with_engines(config, PipelineEngines::default(), callback).await
}

/// Run the pipeline with explicit engines.
#[instrument(level = "debug", skip_all)]
pub async fn run_pipeline_with_engines(
    config: PipelineConfig,
    engines: PipelineEngines,
    callback: Arc<dyn PipelineCallback>,
) -> Result<BatchResult> {
    // Configuration and environment problems are the only errors that may
    // cross the public boundary, and they surface before any work starts.
    config.validate()?;
    env_gate::validate_environment(&config).await?;

    let inputs = config.discover_inputs()?;
    for dir in [config.final_dir(), config.work_dir(), config.logs_dir()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create {:?}", dir.display()))?;
    }
    let relay = LogRelay::start(&config.logs_dir())?;

    let started = Instant::now();
    let result = run_phases(&config, &engines, &callback, &relay, inputs).await;

    // Deferred cleanup on every exit path: the relay's listener must stop
    // even if a phase panicked its task or errored.
    relay.stop();
    let (files, phase_timings) = result;
    Ok(BatchResult::from_files(
        files,
        started.elapsed().as_secs_f64(),
        phase_timings,
    ))
}

/// Both phases plus finalization. Infallible by construction: every failure
/// is recorded on a file result or logged.
async fn run_phases(
    config: &PipelineConfig,
    engines: &PipelineEngines,
    callback: &Arc<dyn PipelineCallback>,
    relay: &LogRelay,
    inputs: Vec<PathBuf>,
) -> (Vec<FileResult>, BTreeMap<String, f64>) {
    let mut phase_timings = BTreeMap::new();
    let total_files = inputs.len();

    // Phase 1: parallel fast OCR.
    let tesseract_started = Instant::now();
    callback.on_phase(PhaseEvent {
        phase: Phase::Tesseract,
        status: PhaseStatus::Started,
        files_count: Some(total_files),
        detail: None,
    });
    relay.record("INFO", &format!("phase 1 started over {total_files} files"));

    let mut files = dispatch_workers(config, engines, callback, relay, inputs).await;

    callback.on_phase(PhaseEvent {
        phase: Phase::Tesseract,
        status: PhaseStatus::Completed,
        files_count: Some(total_files),
        detail: None,
    });
    phase_timings.insert(
        "tesseract".to_owned(),
        tesseract_started.elapsed().as_secs_f64(),
    );

    // Phase 2: the shared neural pass over flagged pages.
    let flagged = planner::collect_flagged_pages(&files);
    if !flagged.is_empty() {
        let surya_started = Instant::now();
        run_neural_phase(config, engines, callback, relay, &mut files, flagged).await;
        phase_timings.insert("surya".to_owned(), surya_started.elapsed().as_secs_f64());
    } else if total_files == 0 {
        // An empty run still announces both phases.
        callback.on_phase(PhaseEvent {
            phase: Phase::Surya,
            status: PhaseStatus::Started,
            files_count: Some(0),
            detail: None,
        });
        callback.on_phase(PhaseEvent {
            phase: Phase::Surya,
            status: PhaseStatus::Completed,
            files_count: Some(0),
            detail: None,
        });
    }

    finalize(config, relay, &mut files).await;
    (files, phase_timings)
}

/// Dispatch Phase 1 workers with bounded parallelism and per-file timeouts.
async fn dispatch_workers(
    config: &PipelineConfig,
    engines: &PipelineEngines,
    callback: &Arc<dyn PipelineCallback>,
    relay: &LogRelay,
    inputs: Vec<PathBuf>,
) -> Vec<FileResult> {
    let total_files = inputs.len();
    if total_files == 0 {
        return vec![];
    }

    let cores = num_cpus::get().max(1);
    let pool_workers = pool_size(config.max_workers, total_files, cores);
    let jobs_per_file = jobs_per_file(cores, pool_workers);
    let timeout = Duration::from_secs(config.timeout);
    info!(pool_workers, jobs_per_file, "dispatching file workers");

    let ctx = WorkerContext {
        analyzer: Arc::new(QualityAnalyzer::new(config.quality_config())),
        fast_engine: engines.fast.clone(),
        word_data: engines.word_data.clone(),
        callback: callback.clone(),
        languages: config.tesseract_languages(),
        jobs_per_file,
        tesseract_timeout: config.timeout,
        force_tesseract: config.force_tesseract,
        force_surya: config.force_surya,
        diagnostics_mode: config.diagnostics,
        final_dir: config.final_dir(),
    };

    let mut stream = futures::stream::iter(inputs.into_iter().enumerate().map(
        |(worker_id, input_pdf)| {
            let ctx = ctx.clone();
            let log = relay.worker_log(worker_id);
            async move {
                let filename = input_pdf
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| input_pdf.to_string_lossy().into_owned());
                let log = match log {
                    Ok(log) => log,
                    Err(err) => {
                        return FileResult::failure(&filename, format_error_chain(&err));
                    }
                };
                match tokio::time::timeout(
                    timeout,
                    worker::process_file(input_pdf, worker_id, ctx, log),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => FileResult::failure(
                        &filename,
                        format!("timed out after {}s", timeout.as_secs()),
                    ),
                }
            }
        },
    ))
    .buffer_unordered(pool_workers);

    let mut files = Vec::with_capacity(total_files);
    while let Some(result) = stream.next().await {
        files.push(result);
        let done = files.len();
        let file = files.last().map(|f| f.filename.clone());
        callback.on_progress(ProgressEvent {
            file,
            current: Some(done),
            total: Some(total_files),
            ..ProgressEvent::message(
                Phase::Tesseract,
                format!("fast OCR {done}/{total_files}"),
            )
        });
    }
    files
}

/// Phase 1 worker pool size: `min(max_workers, file_count, cores)`, at
/// least one.
fn pool_size(max_workers: Option<usize>, file_count: usize, cores: usize) -> usize {
    max_workers
        .unwrap_or(cores)
        .min(file_count)
        .min(cores)
        .max(1)
}

/// Fast-engine threads per file, keeping `pool × jobs ≤ cores`.
fn jobs_per_file(cores: usize, pool_workers: usize) -> usize {
    (cores / pool_workers).max(1)
}

/// Phase 2: load models through the cache and run the batch planner.
async fn run_neural_phase(
    config: &PipelineConfig,
    engines: &PipelineEngines,
    callback: &Arc<dyn PipelineCallback>,
    relay: &LogRelay,
    files: &mut [FileResult],
    flagged: Vec<crate::results::FlaggedPage>,
) {
    callback.on_phase(PhaseEvent {
        phase: Phase::Surya,
        status: PhaseStatus::Started,
        files_count: None,
        detail: Some(format!("{} flagged pages", flagged.len())),
    });
    relay.record(
        "INFO",
        &format!("phase 2 started over {} flagged pages", flagged.len()),
    );

    let cache = model_cache::global();
    callback.on_model(ModelEvent {
        model_name: crate::engines::marker::MODEL_NAME.to_owned(),
        status: ModelStatus::Loading,
        time_seconds: None,
    });
    let models = match cache
        .get_models(engines.neural.as_ref(), config.device.as_deref())
        .await
    {
        Ok(models) => models,
        Err(err) => {
            // Model load failure is fatal to Phase 2 only: flagged pages
            // keep their Phase 1 values.
            let chain = format_error_chain(&err);
            error!("neural model load failed: {chain}");
            relay.record("ERROR", &format!("neural model load failed: {chain}"));
            callback.on_phase(PhaseEvent {
                phase: Phase::Surya,
                status: PhaseStatus::Completed,
                files_count: None,
                detail: Some("model load failed".to_owned()),
            });
            return;
        }
    };
    callback.on_model(ModelEvent {
        model_name: models.model_name.clone(),
        status: ModelStatus::Ready,
        time_seconds: Some(models.load_seconds),
    });

    let analyzer = QualityAnalyzer::new(config.quality_config());
    if let Err(err) = planner::run_neural_pass(
        files,
        flagged,
        engines.neural.as_ref(),
        &models,
        cache,
        &analyzer,
        &config.surya_languages(),
        config.batch_size,
        config.diagnostics,
        &config.work_dir(),
        callback.as_ref(),
    )
    .await
    {
        let chain = format_error_chain(&err);
        error!("neural pass failed: {chain}");
        relay.record("ERROR", &format!("neural pass failed: {chain}"));
    }

    callback.on_phase(PhaseEvent {
        phase: Phase::Surya,
        status: PhaseStatus::Completed,
        files_count: None,
        detail: None,
    });
}

/// Steps 11–14: recompute engines, write sidecars, prune text files,
/// remove the work directory.
async fn finalize(config: &PipelineConfig, relay: &LogRelay, files: &mut [FileResult]) {
    let final_dir = config.final_dir();
    for file in files.iter_mut() {
        file.recompute_engine();
    }

    for file in files.iter() {
        if config.diagnostics {
            if let Err(err) = sidecar::write_diagnostics(file, &final_dir).await {
                warn!(file = %file.filename, "diagnostics sidecar failed: {err:?}");
            }
        }
        if file.success {
            if let Err(err) = sidecar::write_metadata(file, &final_dir).await {
                warn!(file = %file.filename, "metadata sidecar failed: {err:?}");
            }
            if config.extract_text {
                if let Err(err) = sidecar::write_full_text(file, &final_dir).await {
                    warn!(file = %file.filename, "full-text sidecar failed: {err:?}");
                }
            }
        }
    }

    if !config.extract_text {
        remove_page_text_files(&final_dir).await;
    }
    if !config.keep_intermediates {
        if let Err(err) = tokio::fs::remove_dir_all(config.work_dir()).await {
            debug!("work directory cleanup: {err}");
        }
    }
    relay.record("INFO", "run finalized");
}

/// Delete the leftover per-page `{stem}.pageNNNN.txt` files.
async fn remove_page_text_files(final_dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(final_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let is_page_text = name
            .as_deref()
            .is_some_and(|n| n.ends_with(".txt") && n.contains(".page"));
        if is_page_text {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!("cannot remove {:?}: {err}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_never_exceeds_files_or_cores() {
        assert_eq!(pool_size(None, 3, 8), 3);
        assert_eq!(pool_size(None, 20, 8), 8);
        assert_eq!(pool_size(Some(4), 20, 8), 4);
        assert_eq!(pool_size(Some(0), 20, 8), 1);
    }

    #[test]
    fn jobs_times_pool_stays_within_cores() {
        for cores in 1..=16 {
            for files in 1..=8 {
                let pool = pool_size(None, files, cores);
                let jobs = jobs_per_file(cores, pool);
                if jobs > 1 {
                    assert!(pool * jobs <= cores, "pool {pool} jobs {jobs} cores {cores}");
                }
            }
        }
    }
}
