//! Stage 1: turn scanned PDFs into text.

pub mod adaptive;
pub mod engines;
pub mod language;

use std::sync::Arc;

use indicatif::ProgressBar;

use crate::{
    artifacts::{artifact_path, item_id, read_existing_artifact, write_artifact},
    errors::ItemError,
    prelude::*,
    raster::Rasterizer,
};

use self::adaptive::AdaptiveOcr;

use super::work::{BatchResult, WorkItem, WorkOutput, WorkPool};

/// Extracts the text from a single PDF.
pub struct TextExtractor {
    /// Renders and cleans the first page.
    rasterizer: Rasterizer,

    /// Two-pass OCR.
    ocr: AdaptiveOcr,

    /// Where to write `<basename>.txt`, if anywhere.
    text_dir: Option<PathBuf>,

    /// Reuse non-empty text files from earlier runs.
    skip_existing: bool,
}

impl TextExtractor {
    /// Create a new text extractor.
    pub fn new(
        rasterizer: Rasterizer,
        ocr: AdaptiveOcr,
        text_dir: Option<PathBuf>,
        skip_existing: bool,
    ) -> Self {
        Self {
            rasterizer,
            ocr,
            text_dir,
            skip_existing,
        }
    }

    /// Rasterize, clean and OCR the first page of `pdf_path`.
    #[instrument(level = "debug", skip_all, fields(item = %item_id(pdf_path)))]
    pub async fn extract_text(&self, pdf_path: &Path) -> Result<WorkOutput<String>, ItemError> {
        let id = item_id(pdf_path);
        let text_path = match &self.text_dir {
            Some(dir) => Some(
                artifact_path(dir, pdf_path, "txt")
                    .map_err(|err| ItemError::document_load(pdf_path, err))?,
            ),
            None => None,
        };

        if self.skip_existing
            && let Some(text_path) = &text_path
            && let Some(text) = read_existing_artifact(text_path).await
            && !text.trim().is_empty()
        {
            debug!(path = %text_path.display(), "Reusing existing text");
            return Ok(WorkOutput::cached(id, text));
        }

        let mut warnings = vec![];
        let raster = self.rasterizer.rasterize(pdf_path, &mut warnings).await?;
        let text = self.ocr.extract_text(&raster).await?;

        if let Some(text_path) = &text_path {
            write_artifact(text_path, text.as_bytes()).await?;
        }
        let mut output = WorkOutput::new(id, text);
        output.warnings = warnings;
        Ok(output)
    }
}

/// OCR a batch of PDF files.
pub async fn ocr_files(
    pool: &WorkPool,
    extractor: Arc<TextExtractor>,
    paths: Vec<PathBuf>,
    pb: &ProgressBar,
) -> Result<BatchResult<String>> {
    let items = paths
        .into_iter()
        .map(|path| WorkItem {
            id: item_id(&path),
            data: path,
        })
        .collect();
    pool.run(items, pb, |item| {
        let extractor = extractor.clone();
        async move { extractor.extract_text(&item.data).await }
    })
    .await
}
