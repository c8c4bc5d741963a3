//! The `ocr` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    artifacts::{ensure_dir, list_inputs},
    prelude::*,
    queues::ocr::{
        TextExtractor,
        adaptive::AdaptiveOcr,
        engines::tesseract::TesseractOcrEngine,
        language::{LanguageFallback, UnknownLanguagePolicy, WhatlangIdentifier},
        ocr_files,
    },
    raster::{PopplerRenderer, Rasterizer},
    ui::{ProgressConfig, Ui},
};

use super::{BatchOpts, finish_batch};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Directory containing the PDF files to OCR.
    #[clap(long, alias = "pdf_dir", value_name = "DIR")]
    pub pdf_dir: PathBuf,

    /// Save the cleaned-up page images here, as `<name>.png`.
    #[clap(long, alias = "image_dir", value_name = "DIR")]
    pub image_dir: Option<PathBuf>,

    /// Save the extracted text here, as `<name>.txt`.
    #[clap(long, alias = "text_dir", value_name = "DIR")]
    pub text_dir: Option<PathBuf>,

    /// What to do when we can't identify a page's language.
    #[clap(long, value_enum, default_value_t = UnknownLanguagePolicy::Abort)]
    pub on_unknown_language: UnknownLanguagePolicy,

    /// Language to use with `--on-unknown-language=default`.
    #[clap(long, default_value = "eng", value_name = "CODE")]
    pub default_language: String,

    #[clap(flatten)]
    pub batch: BatchOpts,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all, fields(pdf_dir = %opts.pdf_dir.display()))]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let fallback =
        LanguageFallback::from_opts(opts.on_unknown_language, &opts.default_language)?;
    opts.batch
        .check_skip_existing(opts.text_dir.as_deref(), "--text-dir");

    // Find our inputs and create our output directories.
    let paths = opts.batch.take(list_inputs(&opts.pdf_dir, "pdf")?);
    for dir in [&opts.image_dir, &opts.text_dir].into_iter().flatten() {
        ensure_dir(dir).await?;
    }
    info!(count = paths.len(), "Found PDF files");

    let extractor = Arc::new(TextExtractor::new(
        Rasterizer::new(Arc::new(PopplerRenderer::new()), opts.image_dir.clone()),
        AdaptiveOcr::new(
            Arc::new(TesseractOcrEngine::new()),
            Arc::new(WhatlangIdentifier),
            fallback,
        ),
        opts.text_dir.clone(),
        opts.batch.skip_existing,
    ));

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing PDFs",
            done_msg: "OCRed PDFs",
        },
        paths.len(),
    );
    let result = ocr_files(&opts.batch.work_pool(), extractor, paths, &pb).await?;
    pb.finish_using_style();
    finish_batch(&ui, &result);
    Ok(())
}
