//! JSON sidecars written next to each produced PDF.

use crate::{planner::write_atomically, prelude::*, results::FileResult};

/// Version stamp recorded in every metadata sidecar.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The filename stem for a result's sidecars.
fn stem(file: &FileResult) -> String {
    Path::new(&file.filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.filename.clone())
}

/// Write `{stem}.json`: the file result without page text, plus the
/// pipeline version.
pub async fn write_metadata(file: &FileResult, final_dir: &Path) -> Result<PathBuf> {
    let mut value = file.to_json(false)?;
    if let Value::Object(map) = &mut value {
        map.insert("pipeline_version".to_owned(), json!(PIPELINE_VERSION));
    }
    let path = final_dir.join(format!("{}.json", stem(file)));
    let body = serde_json::to_string_pretty(&value)
        .context("cannot serialize metadata sidecar")?;
    write_atomically(&path, &body).await?;
    Ok(path)
}

/// Write `{stem}.diagnostics.json`: every page's diagnostics block.
pub async fn write_diagnostics(file: &FileResult, final_dir: &Path) -> Result<PathBuf> {
    let pages = file
        .pages
        .iter()
        .map(|page| {
            json!({
                "page_number": page.page_number,
                "quality_score": page.quality_score,
                "diagnostics": page.diagnostics,
            })
        })
        .collect::<Vec<_>>();
    let value = json!({
        "filename": file.filename,
        "pipeline_version": PIPELINE_VERSION,
        "pages": pages,
    });
    let path = final_dir.join(format!("{}.diagnostics.json", stem(file)));
    let body = serde_json::to_string_pretty(&value)
        .context("cannot serialize diagnostics sidecar")?;
    write_atomically(&path, &body).await?;
    Ok(path)
}

/// Write `{stem}.txt`: the full text, pages separated by form feeds.
pub async fn write_full_text(file: &FileResult, final_dir: &Path) -> Result<PathBuf> {
    let text = file
        .pages
        .iter()
        .map(|page| page.text.as_deref().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n\x0C\n");
    let path = final_dir.join(format!("{}.txt", stem(file)));
    write_atomically(&path, &text).await?;
    Ok(path)
}
