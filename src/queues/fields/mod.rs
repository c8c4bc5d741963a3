//! Stage 2: turn extracted text into structured fields using an LLM.

pub mod model;
pub mod record;

use std::sync::Arc;

use handlebars::{Handlebars, no_escape};
use indicatif::ProgressBar;
use schemars::schema_for;

use crate::{
    artifacts::{artifact_path, item_id, read_existing_artifact, write_artifact},
    errors::ItemError,
    prelude::*,
};

use self::{
    model::{DecodingOptions, LanguageModel},
    record::StructuredRecord,
};

use super::work::{BatchResult, WorkItem, WorkOutput, WorkPool};

/// Our built-in prompt.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "\
Given the following text extracted from a business document:
{{text}}
What is the Company Name, the Company Identifier, and the purpose of the document.
Give all your answers in {{answer_language}}.
Use the following JSON template:
{{json_template}}";

/// Default language for the model's answers.
pub const DEFAULT_ANSWER_LANGUAGE: &str = "English";

/// Name of our registered prompt template.
const PROMPT_TEMPLATE_NAME: &str = "prompt";

/// Everything that determines what we ask the model and what we accept back.
#[derive(Clone, Debug)]
pub struct FieldExtractorConfig {
    /// Handlebars template with `{{text}}`, `{{json_template}}` and
    /// `{{answer_language}}` slots.
    pub prompt_template: String,

    /// An empty example answer, shown to the model.
    pub json_template: Value,

    /// JSON Schema which every answer must match.
    pub schema: Value,

    /// Language the model should answer in.
    pub answer_language: String,

    /// How to call the model.
    pub decoding: DecodingOptions,
}

impl FieldExtractorConfig {
    /// Extract the [`StructuredRecord`] fields from a business document.
    pub fn business_document() -> Result<Self> {
        Ok(Self {
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_owned(),
            json_template: serde_json::to_value(StructuredRecord::default())
                .context("failed to serialize JSON template")?,
            schema: serde_json::to_value(schema_for!(StructuredRecord))
                .context("failed to serialize schema")?,
            answer_language: DEFAULT_ANSWER_LANGUAGE.to_owned(),
            decoding: DecodingOptions::default(),
        })
    }
}

/// Asks a language model for the structured fields in a text.
pub struct FieldExtractor {
    config: FieldExtractorConfig,
    handlebars: Handlebars<'static>,
    validator: jsonschema::Validator,
    model: Arc<dyn LanguageModel>,
}

impl FieldExtractor {
    /// Create a new extractor, checking the prompt template and schema.
    pub fn new(config: FieldExtractorConfig, model: Arc<dyn LanguageModel>) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(no_escape);
        handlebars.set_strict_mode(true);
        handlebars
            .register_template_string(PROMPT_TEMPLATE_NAME, &config.prompt_template)
            .context("failed to parse prompt template")?;
        let validator = jsonschema::validator_for(&config.schema)
            .map_err(|err| anyhow!("invalid JSON Schema: {err}"))?;
        let extractor = Self {
            config,
            handlebars,
            validator,
            model,
        };

        // Strict mode only catches unknown variables at render time.
        extractor.render_prompt("")?;
        Ok(extractor)
    }

    /// Fill in the prompt template for `text`.
    pub fn render_prompt(&self, text: &str) -> Result<String> {
        let json_template = serde_json::to_string(&self.config.json_template)
            .context("failed to serialize JSON template")?;
        let bindings = json!({
            "text": text,
            "json_template": json_template,
            "answer_language": self.config.answer_language,
        });
        self.handlebars
            .render(PROMPT_TEMPLATE_NAME, &bindings)
            .context("failed to render prompt template")
    }

    /// Parse and validate a model answer, returning it in canonical form.
    ///
    /// Object keys are sorted and whitespace is removed, so the same answer
    /// always serializes to the same bytes.
    pub fn validate(&self, output: &str) -> Result<String, ItemError> {
        let value = serde_json::from_str::<Value>(output).map_err(|err| {
            ItemError::SchemaValidation {
                message: format!("not valid JSON: {err}"),
                output: output.to_owned(),
            }
        })?;
        let errors = self
            .validator
            .iter_errors(&value)
            .map(|err| format!("{}: {}", err.instance_path, err))
            .collect::<Vec<_>>();
        if !errors.is_empty() {
            return Err(ItemError::SchemaValidation {
                message: errors.join("; "),
                output: output.to_owned(),
            });
        }
        serde_json::to_string(&value).map_err(|err| ItemError::SchemaValidation {
            message: format!("could not re-serialize: {err}"),
            output: output.to_owned(),
        })
    }

    /// Extract the structured fields from `text`, as a canonical JSON string.
    #[instrument(level = "debug", skip_all, fields(model = %self.config.decoding.model))]
    pub async fn extract_fields(&self, text: &str) -> Result<String, ItemError> {
        let prompt = self
            .render_prompt(text)
            .map_err(|err| ItemError::PromptRender(format!("{err:#}")))?;
        trace!(%prompt, "Prompt");
        let output = self
            .model
            .complete_json(&prompt, &self.config.schema, &self.config.decoding)
            .await?;
        self.validate(&output)
    }
}

/// Runs the [`FieldExtractor`] over text files.
pub struct FieldProcessor {
    /// The extractor.
    extractor: FieldExtractor,

    /// Where to write `<basename>.json`, if anywhere.
    json_dir: Option<PathBuf>,

    /// Reuse valid JSON files from earlier runs.
    skip_existing: bool,
}

impl FieldProcessor {
    /// Create a new processor.
    pub fn new(extractor: FieldExtractor, json_dir: Option<PathBuf>, skip_existing: bool) -> Self {
        Self {
            extractor,
            json_dir,
            skip_existing,
        }
    }

    /// Extract the structured fields from the text file at `text_path`.
    #[instrument(level = "debug", skip_all, fields(item = %item_id(text_path)))]
    pub async fn process_text(&self, text_path: &Path) -> Result<WorkOutput<String>, ItemError> {
        let id = item_id(text_path);
        let json_path = match &self.json_dir {
            Some(dir) => Some(
                artifact_path(dir, text_path, "json")
                    .map_err(|err| ItemError::document_load(text_path, err))?,
            ),
            None => None,
        };

        if self.skip_existing
            && let Some(json_path) = &json_path
            && let Some(existing) = read_existing_artifact(json_path).await
        {
            match self.extractor.validate(&existing) {
                Ok(record) => {
                    debug!(path = %json_path.display(), "Reusing existing record");
                    return Ok(WorkOutput::cached(id, record));
                }
                Err(err) => debug!(path = %json_path.display(), "Recomputing: {}", err),
            }
        }

        let text = tokio::fs::read_to_string(text_path)
            .await
            .map_err(|err| ItemError::document_load(text_path, err))?;
        let record = self.extractor.extract_fields(&text).await?;

        if let Some(json_path) = &json_path {
            write_artifact(json_path, record.as_bytes()).await?;
        }
        Ok(WorkOutput::new(id, record))
    }
}

/// Extract fields from a batch of text files.
pub async fn process_files(
    pool: &WorkPool,
    processor: Arc<FieldProcessor>,
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
        let processor = processor.clone();
        async move { processor.process_text(&item.data).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::queues::work::{FailurePolicy, WorkStatus};

    /// A model with a canned answer, which remembers its prompts.
    struct FakeModel {
        answer: String,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeModel {
        fn new(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.to_owned(),
                prompts: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        async fn complete_json(
            &self,
            prompt: &str,
            _schema: &Value,
            decoding: &DecodingOptions,
        ) -> Result<String, ItemError> {
            assert_eq!(decoding.temperature, 0.0);
            self.prompts
                .lock()
                .expect("lock poisoned")
                .push(prompt.to_owned());
            Ok(self.answer.clone())
        }
    }

    const ACME: &str = r#"{ "documentPurpose": "Invoice", "companyName": "ACME GmbH",
        "companyIdentifier": "HRB 12345" }"#;
    const ACME_CANONICAL: &str = r#"{"companyIdentifier":"HRB 12345","companyName":"ACME GmbH","documentPurpose":"Invoice"}"#;

    fn extractor(model: Arc<FakeModel>) -> FieldExtractor {
        FieldExtractor::new(FieldExtractorConfig::business_document().unwrap(), model).unwrap()
    }

    #[tokio::test]
    async fn output_is_canonical_and_repeatable() {
        let extractor = extractor(FakeModel::new(ACME));
        let first = extractor.extract_fields("ACME GmbH Rechnung").await.unwrap();
        let second = extractor.extract_fields("ACME GmbH Rechnung").await.unwrap();
        assert_eq!(first, ACME_CANONICAL);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn prompt_contains_text_template_and_language() {
        let model = FakeModel::new(ACME);
        extractor(model.clone())
            .extract_fields("Facture <ACME> & fils")
            .await
            .unwrap();
        let prompts = model.prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert!(prompt.contains("Facture <ACME> & fils"), "{prompt}");
        assert!(prompt.contains("Give all your answers in English."), "{prompt}");
        assert!(prompt.contains(r#""companyName":"""#), "{prompt}");
    }

    #[tokio::test]
    async fn answer_language_is_configurable() {
        let model = FakeModel::new(ACME);
        let config = FieldExtractorConfig {
            answer_language: "French".to_owned(),
            ..FieldExtractorConfig::business_document().unwrap()
        };
        FieldExtractor::new(config, model.clone())
            .unwrap()
            .extract_fields("text")
            .await
            .unwrap();
        assert!(model.prompts.lock().unwrap()[0].contains("answers in French"));
    }

    #[tokio::test]
    async fn malformed_json_is_a_schema_error() {
        let err = extractor(FakeModel::new("Sure! Here is the JSON: {"))
            .extract_fields("text")
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::SchemaValidation { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn extra_fields_are_rejected() {
        let answer = r#"{"companyName":"a","companyIdentifier":"b","documentPurpose":"c","date":"d"}"#;
        let err = extractor(FakeModel::new(answer))
            .extract_fields("text")
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::SchemaValidation { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn missing_and_mistyped_fields_are_rejected() {
        for answer in [
            r#"{"companyName":"a","companyIdentifier":"b"}"#,
            r#"{"companyName":"a","companyIdentifier":12345,"documentPurpose":"c"}"#,
        ] {
            let err = extractor(FakeModel::new(answer))
                .extract_fields("text")
                .await
                .unwrap_err();
            assert!(matches!(err, ItemError::SchemaValidation { .. }), "{err:?}");
        }
    }

    #[tokio::test]
    async fn alternate_configurations_are_supported() {
        let config = FieldExtractorConfig {
            prompt_template: "Find the invoice number in {{text}}. Reply in \
                              {{answer_language}} using {{json_template}}."
                .to_owned(),
            json_template: json!({ "invoiceNumber": "" }),
            schema: json!({
                "type": "object",
                "properties": { "invoiceNumber": { "type": "string" } },
                "required": ["invoiceNumber"],
                "additionalProperties": false,
            }),
            answer_language: "German".to_owned(),
            decoding: DecodingOptions::default(),
        };
        let model = FakeModel::new(r#"{"invoiceNumber": "42"}"#);
        let extractor = FieldExtractor::new(config, model.clone()).unwrap();
        assert_eq!(
            extractor.extract_fields("Invoice 42").await.unwrap(),
            r#"{"invoiceNumber":"42"}"#
        );
        assert_eq!(
            model.prompts.lock().unwrap()[0],
            r#"Find the invoice number in Invoice 42. Reply in German using {"invoiceNumber":""}."#
        );
    }

    #[test]
    fn bad_templates_are_rejected_up_front() {
        let config = FieldExtractorConfig {
            prompt_template: "{{text}} {{unknown_slot}}".to_owned(),
            ..FieldExtractorConfig::business_document().unwrap()
        };
        assert!(FieldExtractor::new(config, FakeModel::new(ACME)).is_err());
    }

    #[tokio::test]
    async fn render_failures_are_prompt_errors() {
        let config = FieldExtractorConfig {
            prompt_template: "{{text}} {{missing}}".to_owned(),
            ..FieldExtractorConfig::business_document().unwrap()
        };
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(no_escape);
        handlebars.set_strict_mode(true);
        handlebars
            .register_template_string(PROMPT_TEMPLATE_NAME, &config.prompt_template)
            .unwrap();
        let validator = jsonschema::validator_for(&config.schema).unwrap();
        let model = FakeModel::new(ACME);
        // Built by hand, because `new` would refuse this template.
        let extractor = FieldExtractor {
            config,
            handlebars,
            validator,
            model: model.clone(),
        };

        let err = extractor.extract_fields("ACME GmbH").await.unwrap_err();
        assert!(matches!(err, ItemError::PromptRender(_)), "{err:?}");
        assert!(err.to_string().starts_with("could not render prompt"));
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    fn processor(model: Arc<FakeModel>, json_dir: &Path, skip_existing: bool) -> Arc<FieldProcessor> {
        Arc::new(FieldProcessor::new(
            extractor(model),
            Some(json_dir.to_owned()),
            skip_existing,
        ))
    }

    #[tokio::test]
    async fn writes_one_json_file_per_text_file() {
        let text_dir = tempfile::tempdir().unwrap();
        let json_dir = tempfile::tempdir().unwrap();
        let mut paths = vec![];
        for name in ["a.txt", "b.txt"] {
            let path = text_dir.path().join(name);
            std::fs::write(&path, "ACME GmbH").unwrap();
            paths.push(path);
        }

        let pool = WorkPool::new(2, FailurePolicy::Abort);
        let result = process_files(
            &pool,
            processor(FakeModel::new(ACME), json_dir.path(), false),
            paths,
            &ProgressBar::hidden(),
        )
        .await
        .unwrap();

        assert_eq!(result.outputs.len(), 2);
        for name in ["a.json", "b.json"] {
            let json = std::fs::read_to_string(json_dir.path().join(name)).unwrap();
            assert_eq!(json, ACME_CANONICAL);
        }
    }

    #[tokio::test]
    async fn missing_text_file_is_a_load_error() {
        let json_dir = tempfile::tempdir().unwrap();
        let err = processor(FakeModel::new(ACME), json_dir.path(), false)
            .process_text(&json_dir.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::DocumentLoad { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn skip_existing_reuses_only_valid_json() {
        let text_dir = tempfile::tempdir().unwrap();
        let json_dir = tempfile::tempdir().unwrap();
        for name in ["good.txt", "bad.txt"] {
            std::fs::write(text_dir.path().join(name), "ACME GmbH").unwrap();
        }
        std::fs::write(json_dir.path().join("good.json"), ACME).unwrap();
        std::fs::write(json_dir.path().join("bad.json"), "{\"companyName\":").unwrap();

        let model = FakeModel::new(ACME);
        let processor = processor(model.clone(), json_dir.path(), true);

        let good = processor
            .process_text(&text_dir.path().join("good.txt"))
            .await
            .unwrap();
        assert_eq!(good.status, WorkStatus::Cached);
        assert_eq!(good.data, ACME_CANONICAL);
        assert!(model.prompts.lock().unwrap().is_empty());

        let bad = processor
            .process_text(&text_dir.path().join("bad.txt"))
            .await
            .unwrap();
        assert_eq!(bad.status, WorkStatus::Ok);
        assert_eq!(model.prompts.lock().unwrap().len(), 1);
        let json = std::fs::read_to_string(json_dir.path().join("bad.json")).unwrap();
        assert_eq!(json, ACME_CANONICAL);
    }
}
