//! The `extract` subcommand.

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    artifacts::{ensure_dir, list_inputs},
    prelude::*,
    queues::fields::{
        DEFAULT_ANSWER_LANGUAGE, FieldExtractor, FieldExtractorConfig, FieldProcessor,
        model::{DEFAULT_MODEL, DEFAULT_SEED, DecodingOptions, OpenAiModel},
        process_files,
    },
    ui::{ProgressConfig, Ui},
};

use super::{BatchOpts, finish_batch};

/// Field extraction command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// Directory containing the `.txt` files produced by `ocr`.
    #[clap(long, alias = "text_dir", value_name = "DIR")]
    pub text_dir: PathBuf,

    /// Save the extracted fields here, as `<name>.json`.
    #[clap(long, aliases = ["json_dir", "json_save_dir"], value_name = "DIR")]
    pub json_dir: Option<PathBuf>,

    /// The model to use.
    #[clap(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// The language the model should answer in.
    #[clap(long, default_value = DEFAULT_ANSWER_LANGUAGE)]
    pub answer_language: String,

    /// Sampling temperature.
    #[clap(long, default_value_t = 0.0)]
    pub temperature: f32,

    /// Sampling seed.
    #[clap(long, default_value_t = DEFAULT_SEED)]
    pub seed: i64,

    /// Timeout for each model request, in seconds.
    #[clap(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    #[clap(flatten)]
    pub batch: BatchOpts,
}

impl ExtractOpts {
    /// Build our extractor configuration.
    fn extractor_config(&self) -> Result<FieldExtractorConfig> {
        Ok(FieldExtractorConfig {
            answer_language: self.answer_language.clone(),
            decoding: DecodingOptions {
                model: self.model.clone(),
                temperature: self.temperature,
                seed: self.seed,
                timeout: self.timeout.map(Duration::from_secs),
            },
            ..FieldExtractorConfig::business_document()?
        })
    }
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all, fields(text_dir = %opts.text_dir.display()))]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let extractor = FieldExtractor::new(opts.extractor_config()?, Arc::new(OpenAiModel::new()))?;
    opts.batch
        .check_skip_existing(opts.json_dir.as_deref(), "--json-dir");

    // Find our inputs and create our output directory.
    let paths = opts.batch.take(list_inputs(&opts.text_dir, "txt")?);
    if let Some(json_dir) = &opts.json_dir {
        ensure_dir(json_dir).await?;
    }
    info!(count = paths.len(), model = %opts.model, "Found text files");

    let processor = Arc::new(FieldProcessor::new(
        extractor,
        opts.json_dir.clone(),
        opts.batch.skip_existing,
    ));

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔎",
            msg: "Extracting fields",
            done_msg: "Extracted fields",
        },
        paths.len(),
    );
    let result = process_files(&opts.batch.work_pool(), processor, paths, &pb).await?;
    pb.finish_using_style();
    finish_batch(&ui, &result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestOpts {
        #[clap(flatten)]
        extract: ExtractOpts,
    }

    #[test]
    fn legacy_flag_spellings_are_accepted() {
        let opts = TestOpts::parse_from([
            "test",
            "--text_dir",
            "text",
            "--json_save_dir",
            "json",
        ])
        .extract;
        assert_eq!(opts.text_dir, PathBuf::from("text"));
        assert_eq!(opts.json_dir, Some(PathBuf::from("json")));
    }

    #[test]
    fn config_uses_deterministic_defaults() {
        let opts = TestOpts::parse_from(["test", "--text-dir", "text"]).extract;
        let config = opts.extractor_config().unwrap();
        assert_eq!(config.decoding, DecodingOptions::default());
        assert_eq!(config.answer_language, "English");
    }
}
