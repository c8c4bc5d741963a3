//! Two-pass OCR with automatic language detection.
//!
//! OCR engines do much better when they know the document's language, but we
//! don't know it up front. So we OCR once with no language hint, identify the
//! language of that rough text, and OCR again biased towards the detected
//! language. Only the second pass is returned.

use std::sync::Arc;

use crate::{errors::ItemError, prelude::*, raster::PageRaster};

use super::{
    engines::OcrEngine,
    language::{LanguageFallback, LanguageIdentifier, normalize_language},
};

/// An OCR extractor which adapts to the language of each page.
pub struct AdaptiveOcr {
    /// The OCR engine, used for both passes.
    engine: Arc<dyn OcrEngine>,

    /// Identifies the language of the rough pass.
    identifier: Arc<dyn LanguageIdentifier>,

    /// What to do if the language can't be normalized.
    fallback: LanguageFallback,
}

impl AdaptiveOcr {
    /// Create a new adaptive OCR extractor.
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        identifier: Arc<dyn LanguageIdentifier>,
        fallback: LanguageFallback,
    ) -> Self {
        Self {
            engine,
            identifier,
            fallback,
        }
    }

    /// Extract the text from a page.
    #[instrument(level = "debug", skip_all)]
    pub async fn extract_text(&self, raster: &PageRaster) -> Result<String, ItemError> {
        // Rough pass. We only keep this text to identify the language.
        let rough = self.engine.recognize(raster, None).await?;

        let detected = self.identifier.identify(&rough).unwrap_or_default();
        let language = match normalize_language(&detected) {
            Ok(language) => language,
            Err(err) => match &self.fallback {
                LanguageFallback::Abort => return Err(err),
                LanguageFallback::Default(language) => {
                    warn!(detected = %detected, fallback = %language, "Using fallback language");
                    language.clone()
                }
                LanguageFallback::RoughPass => {
                    warn!(detected = %detected, "Keeping rough-pass text");
                    return Ok(rough);
                }
            },
        };
        debug!(lang = %language, "Detected language");

        // Language-biased pass. This is our real output.
        self.engine.recognize(raster, Some(&language)).await
    }
}
