//! PDF primitives, backed by the Poppler CLI tools.
//!
//! Everything here shells out to `pdfinfo`, `pdftotext`, `pdfseparate`,
//! `pdfunite` and `pdftoppm`, holding the CPU semaphore around the heavy
//! calls. Scratch space lives in [`tempfile::TempDir`]s so every exit path,
//! including errors, releases the extracted pages.

use std::collections::BTreeMap;

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// Page separator `pdftotext` emits between pages.
const FORM_FEED: char = '\x0C';

/// Number of pages in a PDF, via `pdfinfo`.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output)?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix("Pages:") {
            return rest
                .trim()
                .parse::<usize>()
                .with_context(|| format!("unparseable page count in {:?}", path.display()));
        }
    }
    Err(anyhow!("pdfinfo reported no page count for {:?}", path.display()))
}

/// Extract the existing text layer, one string per page.
///
/// `pdftotext` separates pages with form feeds; the result is padded or
/// truncated to the real page count so callers always get a dense vector.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn extract_text_by_page(path: &Path) -> Result<Vec<String>> {
    let pages = page_count(path).await?;
    let tmpdir = tempfile::TempDir::with_prefix("extract")?;
    let out_path = tmpdir.path().join("text.txt");

    let output = Command::new("pdftotext")
        .arg("-layout")
        .arg(path)
        .arg(&out_path)
        .output()
        .await
        .with_context(|| format!("failed to run pdftotext on {:?}", path.display()))?;
    check_for_command_failure("pdftotext", &output)?;

    let text = tokio::fs::read_to_string(&out_path)
        .await
        .context("cannot read pdftotext output file")?;
    Ok(split_text_pages(&text, pages))
}

/// Split `pdftotext` output into exactly `pages` strings.
pub fn split_text_pages(text: &str, pages: usize) -> Vec<String> {
    let mut out = text
        .split(FORM_FEED)
        .map(|page| page.trim_end_matches('\n').to_owned())
        .collect::<Vec<_>>();
    // A trailing form feed leaves one empty slot too many.
    if out.len() == pages + 1 && out.last().is_some_and(|s| s.is_empty()) {
        out.pop();
    }
    out.resize(pages, String::new());
    out
}

/// Copy the given 0-based pages of `src` into a new PDF at `dst`.
#[instrument(level = "debug", skip_all, fields(src = %src.display()))]
pub async fn extract_pages(src: &Path, indices: &[usize], dst: &Path) -> Result<()> {
    let specs = indices
        .iter()
        .map(|&idx| (src.to_owned(), idx))
        .collect::<Vec<_>>();
    combine_pages_from_multiple_pdfs(&specs, dst).await
}

/// Build `dst` from `orig` with the pages at `indices` replaced by the
/// corresponding pages of `replacement` (matched positionally).
#[instrument(level = "debug", skip_all, fields(orig = %orig.display()))]
pub async fn replace_pages(
    orig: &Path,
    replacement: &Path,
    indices: &[usize],
    dst: &Path,
) -> Result<()> {
    let total = page_count(orig).await?;
    let replacement_for: BTreeMap<usize, usize> = indices
        .iter()
        .enumerate()
        .map(|(pos, &idx)| (idx, pos))
        .collect();
    let specs = (0..total)
        .map(|page| match replacement_for.get(&page) {
            Some(&pos) => (replacement.to_owned(), pos),
            None => (orig.to_owned(), page),
        })
        .collect::<Vec<_>>();
    combine_pages_from_multiple_pdfs(&specs, dst).await
}

/// Splice pages from several PDFs into one, in spec order.
///
/// Each distinct source is separated at most once, no matter how many of its
/// pages appear in `specs`.
#[instrument(level = "debug", skip_all, fields(page_count = specs.len()))]
pub async fn combine_pages_from_multiple_pdfs(
    specs: &[(PathBuf, usize)],
    dst: &Path,
) -> Result<()> {
    if specs.is_empty() {
        return Err(anyhow!("refusing to build an empty combined PDF"));
    }

    // Separate each distinct source once.
    let tmpdir = tempfile::TempDir::with_prefix("combine")?;
    let mut separated: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    for (src, _) in specs {
        if separated.contains_key(src) {
            continue;
        }
        let src_dir = tmpdir.path().join(format!("src{}", separated.len()));
        tokio::fs::create_dir(&src_dir).await?;
        separate_into(src, &src_dir).await?;
        separated.insert(src.clone(), src_dir);
    }

    // Collect the requested page files in order.
    let mut page_paths = vec![];
    for (src, page_idx) in specs {
        let dir = separated
            .get(src)
            .expect("source separated above");
        // pdfseparate numbers pages from 1.
        let page_path = dir.join(format!("page-{}.pdf", page_idx + 1));
        if !page_path.exists() {
            return Err(anyhow!(
                "page {} does not exist in {:?}",
                page_idx,
                src.display()
            ));
        }
        page_paths.push(page_path);
    }

    // `pdfunite` wants at least two inputs; a single page is just a copy.
    if let [only] = page_paths.as_slice() {
        tokio::fs::copy(only, dst)
            .await
            .context("cannot copy single-page combined PDF")?;
        return Ok(());
    }
    let mut cmd = Command::new("pdfunite");
    for page_path in &page_paths {
        cmd.arg(page_path);
    }
    cmd.arg(dst);
    let output = cmd
        .output()
        .await
        .context("failed to run pdfunite")?;
    check_for_command_failure("pdfunite", &output)
}

/// Run `pdfseparate` on `src`, writing `page-%d.pdf` files into `dir`.
async fn separate_into(src: &Path, dir: &Path) -> Result<()> {
    let pattern = dir.join("page-%d.pdf");
    with_cpu_semaphore(|| async {
        let output = Command::new("pdfseparate")
            .arg(src)
            .arg(&pattern)
            .output()
            .await
            .with_context(|| format!("failed to run pdfseparate on {:?}", src.display()))?;
        check_for_command_failure("pdfseparate", &output)
    })
    .await
}

/// Render one 0-based page to a PNG pixmap at the given DPI.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), page_index, dpi))]
pub async fn render_page_to_pixmap(
    path: &Path,
    page_index: usize,
    dpi: u32,
) -> Result<Vec<u8>> {
    let tmpdir = tempfile::TempDir::with_prefix("pixmap")?;
    let out_prefix = tmpdir.path().join("page");
    let page_arg = (page_index + 1).to_string();

    with_cpu_semaphore(|| async {
        let output = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(&page_arg)
            .arg("-l")
            .arg(&page_arg)
            .arg(path)
            .arg(&out_prefix)
            .output()
            .await
            .with_context(|| format!("failed to run pdftoppm on {:?}", path.display()))?;
        check_for_command_failure("pdftoppm", &output)
    })
    .await?;

    // pdftoppm pads the page number, so find whatever single file it wrote.
    let mut entries = std::fs::read_dir(tmpdir.path())
        .context("cannot read pixmap directory")?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.path());
    let entry = entries
        .first()
        .ok_or_else(|| anyhow!("pdftoppm produced no output for page {}", page_index))?;
    std::fs::read(entry.path()).context("cannot read rendered pixmap")
}
