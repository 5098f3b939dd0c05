//! The per-file worker.
//!
//! Given one PDF, it decides whether the existing text layer is good
//! enough, runs the fast engine when it is not, re-scores every page, and
//! returns a complete [`FileResult`]. It never raises to the scheduler:
//! every failure becomes a failure result with a truncated error chain.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use crate::{
    diagnostics::{build_page_diagnostics, image_quality_from_png},
    engines::{FastOcrEngine, FastOcrError, FastOcrRequest, WordDataExtractor},
    events::{Phase, PipelineCallback, ProgressEvent},
    logging::{WorkerLog, format_error_chain},
    pdf,
    planner::{page_text_path, write_atomically},
    postprocess::{self, PostprocessCounts},
    prelude::*,
    quality::{QualityAnalyzer, confidence::WordConfidence},
    results::{Engine, FileResult, ImageQuality, PageResult, PageStatus, compute_engine},
};

/// DPI used when rendering pages for the confidence signal.
const CONFIDENCE_DPI: u32 = 300;

/// Megapixel cutoff passed to the fast engine.
const SKIP_BIG_MEGAPIXELS: u32 = 100;

/// Everything a worker needs beyond the file itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub analyzer: Arc<QualityAnalyzer>,
    pub fast_engine: Arc<dyn FastOcrEngine>,
    pub word_data: Arc<dyn WordDataExtractor>,
    pub callback: Arc<dyn PipelineCallback>,
    /// Engine-format language codes for the fast engine.
    pub languages: Vec<String>,
    /// Threads the fast engine may use for this one file.
    pub jobs_per_file: usize,
    /// Tesseract timeout passed through to the fast engine, seconds.
    pub tesseract_timeout: u64,
    pub force_tesseract: bool,
    pub force_surya: bool,
    pub diagnostics_mode: bool,
    pub final_dir: PathBuf,
}

/// Result of scoring one page.
struct ScoredPage {
    text: String,
    quality: crate::quality::PageQuality,
    counts: PostprocessCounts,
    image: Option<ImageQuality>,
}

/// Process one file end to end. Always returns a `FileResult`.
#[instrument(level = "debug", skip_all, fields(file = %input_pdf.display(), worker_id))]
pub async fn process_file(
    input_pdf: PathBuf,
    worker_id: usize,
    ctx: WorkerContext,
    log: WorkerLog,
) -> FileResult {
    let started = Instant::now();
    let filename = input_pdf
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| input_pdf.to_string_lossy().into_owned());

    let mut result = match process_file_inner(&input_pdf, &filename, worker_id, &ctx, &log).await
    {
        Ok(result) => result,
        Err(err) => {
            let chain = format_error_chain(&err);
            log.log("ERROR", &format!("{filename}: {chain}"));
            FileResult::failure(&filename, chain)
        }
    };
    result.time_seconds = started.elapsed().as_secs_f64();
    result
}

/// The fallible inner body of [`process_file`].
async fn process_file_inner(
    input_pdf: &Path,
    filename: &str,
    worker_id: usize,
    ctx: &WorkerContext,
    log: &WorkerLog,
) -> Result<FileResult> {
    let mut phase_timings = BTreeMap::new();
    let output_pdf = ctx.final_dir.join(filename);

    // Fail non-PDF inputs immediately, with the detected type in the error.
    let mime_type = infer::get_from_path(input_pdf)
        .with_context(|| format!("cannot read {:?}", input_pdf.display()))?
        .map(|kind| kind.mime_type().to_owned());
    if mime_type.as_deref() != Some("application/pdf") {
        return Err(anyhow!(
            "{filename} is not a PDF (detected {})",
            mime_type.as_deref().unwrap_or("unknown type")
        ));
    }

    // Extract and score the existing text layer.
    let extract_started = Instant::now();
    let texts = pdf::extract_text_by_page(input_pdf).await?;
    let page_count = texts.len();
    phase_timings.insert("extract".to_owned(), extract_started.elapsed().as_secs_f64());
    log.log(
        "INFO",
        &format!("{filename}: extracted {page_count} pages of existing text"),
    );

    let score_started = Instant::now();
    let scored = score_pages(input_pdf, &texts, worker_id, filename, ctx, log).await;
    phase_timings.insert("score".to_owned(), score_started.elapsed().as_secs_f64());

    let all_good = scored.iter().all(|page| !page.quality.flagged);
    if all_good && !ctx.force_tesseract && page_count > 0 {
        // The existing layer is sufficient: copy the input verbatim.
        tokio::fs::copy(input_pdf, &output_pdf)
            .await
            .with_context(|| format!("cannot copy {:?} to output", input_pdf.display()))?;
        let pages =
            build_pages(&output_pdf, scored, Engine::Existing, ctx).await?;
        log.log("INFO", &format!("{filename}: existing text sufficient"));
        return Ok(assemble(
            filename,
            pages,
            Some(output_pdf),
            phase_timings,
            None,
        ));
    }

    // Run the fast engine over the whole file.
    let tesseract_started = Instant::now();
    let request = FastOcrRequest {
        input_pdf: input_pdf.to_owned(),
        output_pdf: output_pdf.clone(),
        languages: ctx.languages.clone(),
        redo_ocr: true,
        clean: false,
        jobs: ctx.jobs_per_file,
        tesseract_timeout: ctx.tesseract_timeout,
        skip_big_megapixels: SKIP_BIG_MEGAPIXELS,
    };
    match ctx.fast_engine.ocr(request).await {
        Ok(()) => {}
        Err(FastOcrError::PriorOcrFound { .. }) => {
            // Re-OCR was unnecessary; the input is already searchable.
            log.log("INFO", &format!("{filename}: prior OCR found, keeping input"));
            if !output_pdf.exists() {
                tokio::fs::copy(input_pdf, &output_pdf).await.with_context(|| {
                    format!("cannot copy {:?} to output", input_pdf.display())
                })?;
            }
        }
        Err(err) => {
            return Err(anyhow::Error::from(err)
                .context(format!("fast engine failed on {filename}")));
        }
    }
    phase_timings.insert(
        "tesseract".to_owned(),
        tesseract_started.elapsed().as_secs_f64(),
    );

    // Re-extract and re-score from the OCR'd output.
    let texts = pdf::extract_text_by_page(&output_pdf).await?;
    let scored = score_pages(&output_pdf, &texts, worker_id, filename, ctx, log).await;
    let flagged = scored.iter().filter(|page| page.quality.flagged).count();
    log.log(
        "INFO",
        &format!("{filename}: fast OCR complete, {flagged} pages flagged"),
    );

    let pages = build_pages(&output_pdf, scored, Engine::Tesseract, ctx).await?;
    Ok(assemble(
        filename,
        pages,
        Some(output_pdf),
        phase_timings,
        None,
    ))
}

/// Score every page: post-process, run the signals, and (when possible)
/// render a pixmap for the confidence signal and image metrics.
async fn score_pages(
    pdf_path: &Path,
    texts: &[String],
    worker_id: usize,
    filename: &str,
    ctx: &WorkerContext,
    log: &WorkerLog,
) -> Vec<ScoredPage> {
    let mut out = Vec::with_capacity(texts.len());
    for (page_idx, raw_text) in texts.iter().enumerate() {
        let mut counts = PostprocessCounts::new();
        let text = postprocess::apply_all(raw_text, Some(&mut counts));

        // Confidence data and image metrics come from the same render. A
        // failed render just means the signal is unavailable.
        let (word_confs, image) =
            page_ocr_data(pdf_path, page_idx, ctx, log, filename).await;

        let quality = ctx
            .analyzer
            .analyze(&text, word_confs.as_deref(), image.as_ref());
        if quality.gray_zone {
            ctx.callback.on_progress(ProgressEvent {
                file: Some(filename.to_owned()),
                page: Some(page_idx),
                worker_id: Some(worker_id),
                ..ProgressEvent::message(
                    Phase::Quality,
                    format!(
                        "gray-zone analysis: composite {:.3} vs threshold {:.2}",
                        quality.composite,
                        ctx.analyzer.threshold()
                    ),
                )
            });
        }
        out.push(ScoredPage {
            text,
            quality,
            counts,
            image,
        });
    }
    out
}

/// Render one page and run the word-level extractor over it.
async fn page_ocr_data(
    pdf_path: &Path,
    page_idx: usize,
    ctx: &WorkerContext,
    log: &WorkerLog,
    filename: &str,
) -> (Option<Vec<WordConfidence>>, Option<ImageQuality>) {
    let png = match pdf::render_page_to_pixmap(pdf_path, page_idx, CONFIDENCE_DPI).await {
        Ok(png) => png,
        Err(err) => {
            log.log(
                "WARN",
                &format!(
                    "{filename} page {page_idx}: no pixmap, confidence signal skipped: {}",
                    format_error_chain(&err)
                ),
            );
            return (None, None);
        }
    };
    let image = if ctx.diagnostics_mode {
        image_quality_from_png(&png, CONFIDENCE_DPI)
    } else {
        None
    };
    let words = match ctx.word_data.image_to_data(&png, &ctx.languages).await {
        Ok(words) => Some(words),
        Err(err) => {
            log.log(
                "WARN",
                &format!(
                    "{filename} page {page_idx}: word data unavailable: {}",
                    format_error_chain(&err)
                ),
            );
            None
        }
    };
    (words, image)
}

/// Turn scored pages into page results, write their text files, and attach
/// diagnostics.
async fn build_pages(
    output_pdf: &Path,
    scored: Vec<ScoredPage>,
    engine: Engine,
    ctx: &WorkerContext,
) -> Result<Vec<PageResult>> {
    let mut pages = Vec::with_capacity(scored.len());
    for (page_number, page) in scored.into_iter().enumerate() {
        let flagged = page.quality.flagged || ctx.force_surya;
        let mut diag = build_page_diagnostics(&page.quality, &page.counts);
        if ctx.diagnostics_mode {
            diag.image_quality = page.image;
            diag.tesseract_text = Some(page.text.clone());
        }

        write_atomically(&page_text_path(output_pdf, page_number), &page.text).await?;

        pages.push(PageResult {
            page_number,
            status: if flagged {
                PageStatus::Flagged
            } else {
                PageStatus::Good
            },
            quality_score: page.quality.composite,
            engine,
            flagged,
            text: Some(page.text),
            diagnostics: Some(diag),
        });
    }
    Ok(pages)
}

/// Assemble the final `FileResult` from its parts.
fn assemble(
    filename: &str,
    pages: Vec<PageResult>,
    output_path: Option<PathBuf>,
    phase_timings: BTreeMap<String, f64>,
    error: Option<String>,
) -> FileResult {
    let engine = compute_engine(&pages);
    let quality_score = if pages.is_empty() {
        0.0
    } else {
        pages.iter().map(|p| p.quality_score).sum::<f64>() / pages.len() as f64
    };
    FileResult {
        filename: filename.to_owned(),
        success: error.is_none(),
        engine,
        quality_score,
        page_count: pages.len(),
        pages,
        error,
        output_path,
        time_seconds: 0.0,
        phase_timings,
    }
}
