//! OCR engine interface.

use crate::{errors::ItemError, prelude::*, raster::PageRaster};

use super::language::LanguageCode;

pub mod tesseract;

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize the text on a page. If `language` is given, bias the
    /// engine towards that language.
    async fn recognize(
        &self,
        raster: &PageRaster,
        language: Option<&LanguageCode>,
    ) -> Result<String, ItemError>;
}
