//! Item-level errors.
//!
//! Anything that goes wrong while processing a single document or text file
//! is reported as an [`ItemError`]. The batch runner decides whether an
//! [`ItemError`] aborts the batch or is recorded and skipped. Errors which are
//! not tied to a single item (bad command-line arguments, unreadable input
//! directories) use [`anyhow::Error`] instead.

use std::io;

use thiserror::Error;

use crate::prelude::*;

/// An error which prevented us from processing one item.
#[derive(Debug, Error)]
pub enum ItemError {
    /// The source document could not be opened, or it has no pages.
    #[error("could not load {path:?}: {message}")]
    DocumentLoad { path: PathBuf, message: String },

    /// The language identifier returned something we can't map to a
    /// three-letter language code.
    #[error("could not normalize detected language {detected:?}")]
    LanguageNormalization { detected: String },

    /// The OCR engine or the language model failed.
    #[error("{backend} failed: {message}")]
    ModelInvocation {
        backend: &'static str,
        message: String,
    },

    /// The model answered, but not with JSON matching our schema.
    #[error("model output did not match schema: {message}\nOutput: {output}")]
    SchemaValidation { message: String, output: String },

    /// We could not write an output artifact.
    #[error("could not write {path:?}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The prompt template could not be filled in for this item.
    #[error("could not render prompt: {0}")]
    PromptRender(String),

    /// The worker processing this item panicked.
    #[error("worker panicked: {0}")]
    WorkerPanic(String),
}

impl ItemError {
    /// Build a [`ItemError::DocumentLoad`] from any displayable error.
    pub fn document_load(path: &Path, err: impl std::fmt::Display) -> Self {
        ItemError::DocumentLoad {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }

    /// Build a [`ItemError::ModelInvocation`] from an [`anyhow::Error`],
    /// keeping the whole context chain.
    pub fn model_invocation(backend: &'static str, err: &anyhow::Error) -> Self {
        ItemError::ModelInvocation {
            backend,
            message: format!("{err:#}"),
        }
    }
}
