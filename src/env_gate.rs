//! Startup validation of the external environment.
//!
//! Checks every required binary, language pack and writable directory, and
//! reports all problems in one error rather than failing on the first. Each
//! missing language carries an actionable install hint.

use thiserror::Error;
use tokio::process::Command;

use crate::{config::PipelineConfig, prelude::*};

/// Binaries the pipeline shells out to.
const REQUIRED_BINARIES: &[&str] = &[
    "ocrmypdf",
    "tesseract",
    "pdfinfo",
    "pdftotext",
    "pdfseparate",
    "pdfunite",
    "pdftoppm",
];

/// Every environment problem found at startup, aggregated.
#[derive(Debug, Error)]
#[error("environment validation failed:\n  - {}", problems.join("\n  - "))]
pub struct EnvironmentError {
    pub problems: Vec<String>,
}

/// Validate the environment for `config`. Collects every problem before
/// returning.
#[instrument(level = "debug", skip_all)]
pub async fn validate_environment(config: &PipelineConfig) -> Result<(), EnvironmentError> {
    let mut problems = vec![];

    // Required binaries.
    let mut tesseract_available = false;
    for binary in REQUIRED_BINARIES {
        match which::which(binary) {
            Ok(path) => {
                debug!(binary, path = %path.display(), "found binary");
                if *binary == "tesseract" {
                    tesseract_available = true;
                }
            }
            Err(_) => problems.push(format!(
                "required binary `{binary}` not found on PATH"
            )),
        }
    }

    // Language packs, only checkable when tesseract itself exists.
    if tesseract_available {
        match installed_tesseract_languages().await {
            Ok(installed) => {
                for lang in config.tesseract_languages() {
                    // Packs like `deu+eng` are several packs at once.
                    for part in lang.split('+') {
                        if !installed.iter().any(|have| have == part) {
                            problems.push(format!(
                                "tesseract language pack `{part}` is not installed \
                                 (try: apt install tesseract-ocr-{part})"
                            ));
                        }
                    }
                }
            }
            Err(err) => {
                problems.push(format!("could not list tesseract languages: {err}"));
            }
        }
    }

    // Temporary directory must be writable.
    if let Err(err) = tempfile::NamedTempFile::new() {
        problems.push(format!(
            "temporary directory {:?} is not writable: {err}",
            std::env::temp_dir().display()
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(EnvironmentError { problems })
    }
}

/// Query `tesseract --list-langs` for the installed packs.
async fn installed_tesseract_languages() -> Result<Vec<String>> {
    let output = Command::new("tesseract")
        .arg("--list-langs")
        .output()
        .await
        .context("cannot run tesseract --list-langs")?;
    // The tool prints the list on stdout but some builds use stderr.
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(parse_language_list(&text))
}

/// Parse the `--list-langs` output, skipping the banner line.
fn parse_language_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.starts_with("List of available languages")
                && line.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_langs_output() {
        let output = "List of available languages (3):\ndeu\neng\nosd\n";
        assert_eq!(parse_language_list(output), vec!["deu", "eng", "osd"]);
    }

    #[test]
    fn aggregate_error_lists_every_problem() {
        let err = EnvironmentError {
            problems: vec![
                "required binary `ocrmypdf` not found on PATH".to_owned(),
                "tesseract language pack `deu` is not installed (try: apt install tesseract-ocr-deu)".to_owned(),
            ],
        };
        let message = err.to_string();
        assert!(message.contains("ocrmypdf"));
        assert!(message.contains("tesseract-ocr-deu"));
    }
}
