//! The Phase 2 batch planner.
//!
//! Collects flagged pages across every file, splices them into combined
//! PDFs sized to fit memory, runs the neural engine over each sub-batch,
//! and maps the returned Markdown back onto the source pages. A sub-batch
//! failure never aborts the run; its pages simply keep their Phase 1 state.

use crate::{
    diagnostics::{build_page_diagnostics, word_diff},
    engines::{ModelHandle, NeuralOcrEngine},
    events::{Phase, PipelineCallback, ProgressEvent},
    model_cache::ModelCache,
    pdf,
    postprocess::{self, PostprocessCounts},
    prelude::*,
    quality::QualityAnalyzer,
    results::{Engine, FileResult, FlaggedPage, PageStatus, StruggleCategory},
};

/// Available-memory level below which we log memory pressure.
pub const MEMORY_PRESSURE_BYTES: u64 = 4 * GIB;

/// Estimated neural-engine memory cost per page.
pub const PER_PAGE_BYTES: u64 = 7 * GIB / 10;

/// Hard cap on sub-batch size without an accelerator.
pub const CPU_PAGE_CAP: usize = 32;

const GIB: u64 = 1024 * 1024 * 1024;

/// Collect flagged pages from every successful file, assigning sequential
/// batch indices in traversal order.
pub fn collect_flagged_pages(files: &[FileResult]) -> Vec<FlaggedPage> {
    let mut batch_index = 0;
    let mut out = vec![];
    for file in files {
        let Some(output_path) = file.output_path.as_ref() else {
            continue;
        };
        for page in &file.pages {
            if page.flagged {
                out.push(FlaggedPage {
                    source_file: output_path.clone(),
                    source_page_index: page.page_number,
                    batch_index,
                });
                batch_index += 1;
            }
        }
    }
    out
}

/// How many pages one sub-batch can safely hold, from available memory.
pub fn safe_batch_size(available_bytes: u64, has_accelerator: bool) -> usize {
    if available_bytes < MEMORY_PRESSURE_BYTES {
        warn!(
            available_bytes,
            "available memory below pressure threshold; shrinking sub-batches"
        );
    }
    let safe = (available_bytes / 2 / PER_PAGE_BYTES) as usize;
    let safe = if has_accelerator {
        safe
    } else {
        safe.min(CPU_PAGE_CAP)
    };
    safe.max(1)
}

/// Split the flagged collection into sub-batches of at most
/// `min(safe_size, max_batch_size)`, preserving the original batch indices.
pub fn plan_sub_batches(
    flagged: Vec<FlaggedPage>,
    safe_size: usize,
    max_batch_size: usize,
) -> Vec<Vec<FlaggedPage>> {
    let chunk = safe_size.min(max_batch_size).max(1);
    let mut out = vec![];
    let mut current = vec![];
    for page in flagged {
        current.push(page);
        if current.len() == chunk {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Split one converted Markdown document into per-page strings.
///
/// Tries horizontal-rule separators first, then runs of blank lines; when
/// neither yields the expected page count, all text goes to the first page
/// and the caller is told to warn.
pub fn split_markdown_pages(markdown: &str, expected: usize) -> (Vec<String>, bool) {
    if expected == 0 {
        return (vec![], false);
    }
    if expected == 1 {
        return (vec![markdown.trim().to_owned()], false);
    }

    let by_rule = split_on_horizontal_rules(markdown);
    if by_rule.len() == expected {
        return (by_rule, false);
    }

    let by_blanks = markdown
        .split("\n\n\n")
        .map(|page| page.trim().to_owned())
        .collect::<Vec<_>>();
    if by_blanks.len() == expected {
        return (by_blanks, false);
    }

    // Documented fallback: everything on the first page.
    let mut pages = vec![String::new(); expected];
    pages[0] = markdown.trim().to_owned();
    (pages, true)
}

fn split_on_horizontal_rules(markdown: &str) -> Vec<String> {
    let mut pages = vec![];
    let mut current = String::new();
    for line in markdown.lines() {
        let trimmed = line.trim();
        let is_rule = trimmed.len() >= 3
            && (trimmed.chars().all(|c| c == '-')
                || trimmed.chars().all(|c| c == '*')
                || trimmed.chars().all(|c| c == '_'));
        if is_rule {
            pages.push(std::mem::take(&mut current).trim().to_owned());
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    pages.push(current.trim().to_owned());
    pages
}

/// Run the whole neural pass over the flagged pages.
///
/// `files` is the scheduler's result list; updated pages are mutated in
/// place and their per-page text files rewritten on disk.
#[allow(clippy::too_many_arguments)]
#[instrument(level = "debug", skip_all, fields(flagged = flagged.len()))]
pub async fn run_neural_pass(
    files: &mut [FileResult],
    flagged: Vec<FlaggedPage>,
    engine: &dyn NeuralOcrEngine,
    models: &ModelHandle,
    cache: &ModelCache,
    analyzer: &QualityAnalyzer,
    languages: &[String],
    max_batch_size: usize,
    diagnostics_mode: bool,
    work_dir: &Path,
    callback: &dyn PipelineCallback,
) -> Result<()> {
    if flagged.is_empty() {
        return Ok(());
    }

    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let has_accelerator = models.device != "cpu";
    let safe = safe_batch_size(system.available_memory(), has_accelerator);
    let sub_batches = plan_sub_batches(flagged, safe, max_batch_size);
    let total = sub_batches.len();
    info!(total, safe, "planned neural sub-batches");

    for (batch_no, sub_batch) in sub_batches.into_iter().enumerate() {
        let result = process_sub_batch(
            files,
            &sub_batch,
            engine,
            models,
            analyzer,
            languages,
            diagnostics_mode,
            work_dir,
            batch_no,
            callback,
        )
        .await;
        if let Err(err) = result {
            // Keep Phase 1 values for the affected pages and move on.
            error!(batch_no, "neural sub-batch failed: {err:?}");
        }
        callback.on_progress(ProgressEvent {
            current: Some(batch_no + 1),
            total: Some(total),
            ..ProgressEvent::message(
                Phase::Surya,
                format!("sub-batch {}/{} complete", batch_no + 1, total),
            )
        });
        if batch_no + 1 < total {
            cache.cleanup_between_documents(engine).await?;
        }
    }
    Ok(())
}

/// Convert one sub-batch and write its results back.
#[allow(clippy::too_many_arguments)]
async fn process_sub_batch(
    files: &mut [FileResult],
    sub_batch: &[FlaggedPage],
    engine: &dyn NeuralOcrEngine,
    models: &ModelHandle,
    analyzer: &QualityAnalyzer,
    languages: &[String],
    diagnostics_mode: bool,
    work_dir: &Path,
    batch_no: usize,
    callback: &dyn PipelineCallback,
) -> Result<()> {
    if sub_batch.is_empty() {
        return Ok(());
    }

    // Splice the referenced pages into one combined PDF. Each source is
    // opened at most once inside the combine call.
    let specs = sub_batch
        .iter()
        .map(|page| (page.source_file.clone(), page.source_page_index))
        .collect::<Vec<_>>();
    let combined = work_dir.join(format!("batch-{batch_no:03}.pdf"));
    pdf::combine_pages_from_multiple_pdfs(&specs, &combined).await?;

    let markdown = engine
        .convert_pdf(
            &combined,
            models,
            languages,
            true,
            Some((0, sub_batch.len() - 1)),
        )
        .await?;

    let (pages, fallback) = split_markdown_pages(&markdown, sub_batch.len());
    if fallback {
        warn!(
            batch_no,
            "could not find page separators in converted markdown; \
             assigning all text to the first page"
        );
        callback.on_progress(ProgressEvent::message(
            Phase::Surya,
            format!("sub-batch {batch_no}: page separators missing, using first-page fallback"),
        ));
    }

    for (flagged_page, new_text) in sub_batch.iter().zip(pages) {
        apply_page_update(files, flagged_page, &new_text, analyzer, diagnostics_mode)
            .await?;
    }
    Ok(())
}

/// Overwrite one page's text and re-score it.
async fn apply_page_update(
    files: &mut [FileResult],
    flagged_page: &FlaggedPage,
    new_text: &str,
    analyzer: &QualityAnalyzer,
    diagnostics_mode: bool,
) -> Result<()> {
    let file = files
        .iter_mut()
        .find(|f| f.output_path.as_deref() == Some(flagged_page.source_file.as_path()))
        .ok_or_else(|| {
            anyhow!(
                "no file result for batch source {:?}",
                flagged_page.source_file.display()
            )
        })?;
    let page = file
        .pages
        .get_mut(flagged_page.source_page_index)
        .ok_or_else(|| {
            anyhow!(
                "page {} out of range in {}",
                flagged_page.source_page_index,
                file.filename
            )
        })?;

    let mut counts = PostprocessCounts::new();
    let cleaned = postprocess::apply_all(new_text, Some(&mut counts));
    let quality = analyzer.analyze(&cleaned, None, None);

    let previous_text = page.text.take();
    let previous_diag = page.diagnostics.take();

    let mut diag = build_page_diagnostics(&quality, &counts);
    if quality.flagged {
        diag.struggle_categories
            .insert(StruggleCategory::SuryaInsufficient);
    }
    if diagnostics_mode {
        diag.image_quality = previous_diag.as_ref().and_then(|d| d.image_quality.clone());
        diag.tesseract_text = previous_text.clone();
        diag.engine_diff = Some(word_diff(
            previous_text.as_deref().unwrap_or(""),
            &cleaned,
        ));
    }

    page.engine = Engine::Surya;
    page.quality_score = quality.composite;
    page.status = if quality.flagged {
        PageStatus::Flagged
    } else {
        PageStatus::Good
    };
    page.flagged = quality.flagged;
    page.text = Some(cleaned.clone());
    page.diagnostics = Some(diag);

    // Rewrite the per-page text file atomically.
    let page_text_path = page_text_path(
        &flagged_page.source_file,
        flagged_page.source_page_index,
    );
    write_atomically(&page_text_path, &cleaned).await?;

    file.recompute_quality();
    Ok(())
}

/// Path of the per-page text file beside an output PDF.
pub fn page_text_path(output_pdf: &Path, page_index: usize) -> PathBuf {
    let stem = output_pdf
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_pdf.with_file_name(format!("{stem}.page{page_index:04}.txt"))
}

/// Write via a temp file in the same directory, then rename into place.
pub async fn write_atomically(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {:?}", path.display()))?;
    let contents = contents.to_owned();
    let path = path.to_owned();
    let dir = dir.to_owned();
    crate::async_utils::spawn_blocking_propagating_panics(move || {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .context("cannot create temp file for atomic write")?;
        std::io::Write::write_all(&mut tmp, contents.as_bytes())
            .context("cannot write temp file")?;
        tmp.persist(&path)
            .with_context(|| format!("cannot rename temp file into {:?}", path.display()))?;
        Ok(())
    })
    .await
}
