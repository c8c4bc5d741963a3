//! Tesseract OCR engine.

use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, errors::ItemError, prelude::*,
    queues::ocr::language::LanguageCode, raster::PageRaster,
};

use super::OcrEngine;

/// Tesseract's LSTM-only engine mode.
const ENGINE_MODE: &str = "1";

/// Tesseract sometimes reports a missing language model on stderr without
/// failing.
static TESSERACT_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(failed loading language|error opening data file)")
        .expect("failed to compile regex")
});

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct TesseractOcrEngine {}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new() -> Self {
        Self {}
    }
}

/// Build the argument list for one tesseract run.
fn tesseract_args(
    input_path: &Path,
    output_base: &Path,
    language: Option<&LanguageCode>,
) -> Vec<String> {
    let mut args = vec![
        input_path.display().to_string(),
        output_base.display().to_string(),
        "--oem".to_owned(),
        ENGINE_MODE.to_owned(),
    ];
    if let Some(language) = language {
        args.push("-l".to_owned());
        args.push(language.as_str().to_owned());
    }
    args
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(lang = ?language.map(|l| l.as_str())))]
    async fn recognize(
        &self,
        raster: &PageRaster,
        language: Option<&LanguageCode>,
    ) -> Result<String, ItemError> {
        self.recognize_inner(raster, language)
            .await
            .map_err(|err| ItemError::model_invocation("tesseract", &err))
    }
}

impl TesseractOcrEngine {
    /// Perform actual work for `recognize`.
    async fn recognize_inner(
        &self,
        raster: &PageRaster,
        language: Option<&LanguageCode>,
    ) -> Result<String> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        let output_path = tmpdir.path().join("output.txt");
        tokio::fs::write(&input_path, raster.to_png()?)
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract on the input file.
        let output = Command::new("tesseract")
            .args(tesseract_args(
                &input_path,
                &output_path.with_extension(""),
                language,
            ))
            .kill_on_drop(true)
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output, Some(&TESSERACT_ERROR_REGEX))?;

        read_tesseract_output(&output_path).await
    }
}

/// Read the text file tesseract wrote.
async fn read_tesseract_output(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .context("cannot read tesseract output file")
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma};

    use super::*;
    use crate::queues::ocr::language::normalize_language;

    #[test]
    fn rough_pass_has_no_language() {
        let args = tesseract_args(Path::new("in.png"), Path::new("out"), None);
        assert_eq!(args, vec!["in.png", "out", "--oem", "1"]);
    }

    #[test]
    fn biased_pass_names_language() {
        let fra = normalize_language("fr").unwrap();
        let args = tesseract_args(Path::new("in.png"), Path::new("out"), Some(&fra));
        assert_eq!(args, vec!["in.png", "out", "--oem", "1", "-l", "fra"]);
    }

    #[tokio::test]
    async fn output_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        std::fs::write(&path, "ACME GmbH\n").unwrap();
        assert_eq!(read_tesseract_output(&path).await.unwrap(), "ACME GmbH\n");
    }

    #[tokio::test]
    async fn missing_output_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_tesseract_output(&dir.path().join("output.txt"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("cannot read tesseract output file"));
    }

    #[tokio::test]
    #[ignore = "Needs tesseract installed"]
    async fn blank_page_yields_no_text() {
        let raster = PageRaster::new(GrayImage::from_pixel(200, 100, Luma([255])));
        let text = TesseractOcrEngine::new()
            .recognize(&raster, None)
            .await
            .unwrap();
        assert!(text.trim().is_empty());
    }
}
