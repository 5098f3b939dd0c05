//! Word-level OCR data via the `tesseract` CLI tool's TSV output.

use std::{fs::File, io::Write as _};

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    prelude::*,
    quality::confidence::WordConfidence,
};

use super::WordDataExtractor;

/// TSV row level for word entries.
const WORD_LEVEL: &str = "5";

/// Word data extractor wrapping the `tesseract` CLI tool.
#[non_exhaustive]
pub struct TesseractWordData {}

impl TesseractWordData {
    pub fn new() -> Self {
        TesseractWordData {}
    }
}

impl Default for TesseractWordData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WordDataExtractor for TesseractWordData {
    #[instrument(level = "debug", skip_all, fields(image_bytes = image_png.len()))]
    async fn image_to_data(
        &self,
        image_png: &[u8],
        languages: &[String],
    ) -> Result<Vec<WordConfidence>> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let mut input_file =
            File::create(&input_path).context("cannot create tesseract input file")?;
        input_file
            .write_all(image_png)
            .context("cannot write tesseract input file")?;
        input_file
            .flush()
            .context("cannot flush tesseract input file")?;

        // Run tesseract in TSV mode, capturing stdout.
        let output = with_cpu_semaphore(|| async {
            let mut cmd = Command::new("tesseract");
            cmd.arg(&input_path).arg("stdout");
            if !languages.is_empty() {
                cmd.arg("-l").arg(languages.join("+"));
            }
            cmd.arg("tsv");
            cmd.output().await.context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output)?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        Ok(parse_tsv(&tsv))
    }
}

/// Parse tesseract TSV output into word records.
///
/// Word rows are level 5; `conf` is column 10 and `text` column 11. Header
/// rows and malformed lines are skipped.
pub fn parse_tsv(tsv: &str) -> Vec<WordConfidence> {
    tsv.lines()
        .filter_map(|line| {
            let fields = line.split('\t').collect::<Vec<_>>();
            if fields.len() < 12 || fields[0] != WORD_LEVEL {
                return None;
            }
            let conf = fields[10].parse::<f64>().ok()?;
            let text = fields[11].trim();
            if text.is_empty() {
                return None;
            }
            Some(WordConfidence {
                text: text.to_owned(),
                conf,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
        1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
        5\t1\t1\t1\t1\t1\t10\t10\t40\t12\t96.5\tSein\n\
        5\t1\t1\t1\t1\t2\t55\t10\t40\t12\t91.0\tund\n\
        5\t1\t1\t1\t1\t3\t99\t10\t40\t12\t-1\t \n";

    #[test]
    fn parses_word_rows_only() {
        let words = parse_tsv(SAMPLE);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "Sein");
        assert_eq!(words[0].conf, 96.5);
        assert_eq!(words[1].text, "und");
    }

    #[test]
    fn tolerates_garbage_lines() {
        assert!(parse_tsv("not\ttsv").is_empty());
        assert!(parse_tsv("").is_empty());
    }
}
