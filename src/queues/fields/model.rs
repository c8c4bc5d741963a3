//! Language model access.
//!
//! We talk to models through the OpenAI chat completions API, which is also
//! served by Ollama, LiteLLM and most other gateways.

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, FinishReason,
        ResponseFormat, ResponseFormatJsonSchema,
    },
};
use tokio::time;

use crate::{errors::ItemError, prelude::*};

/// Default model. Any model served by the endpoint will do.
pub const DEFAULT_MODEL: &str = "llama3.2";

/// Default sampling seed.
pub const DEFAULT_SEED: i64 = 123;

/// Decoding settings for a model call.
///
/// The defaults are deterministic: greedy sampling with a fixed seed. Given
/// the same prompt, a model server should return the same answer every time.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodingOptions {
    /// The model to call.
    pub model: String,

    /// Sampling temperature.
    pub temperature: f32,

    /// Sampling seed.
    pub seed: i64,

    /// Give up on a request after this long.
    pub timeout: Option<Duration>,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_owned(),
            temperature: 0.0,
            seed: DEFAULT_SEED,
            timeout: None,
        }
    }
}

/// A model which answers a prompt with a JSON document.
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Send `prompt`, asking for JSON matching `schema`, and return the raw
    /// response text.
    async fn complete_json(
        &self,
        prompt: &str,
        schema: &Value,
        decoding: &DecodingOptions,
    ) -> Result<String, ItemError>;
}

/// Create an OpenAI-compatible client, configured from `OPENAI_API_KEY` and
/// `OPENAI_API_BASE`.
pub fn create_llm_client() -> Client<OpenAIConfig> {
    let mut client_config = OpenAIConfig::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        client_config = client_config.with_api_key(api_key);
    }
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        client_config = client_config.with_api_base(api_base);
    }
    Client::with_config(client_config)
}

/// A [`LanguageModel`] using an OpenAI-compatible endpoint.
#[derive(Debug)]
pub struct OpenAiModel {
    /// The OpenAI client.
    client: Client<OpenAIConfig>,
}

impl OpenAiModel {
    /// Create a new model using the environment's endpoint settings.
    pub fn new() -> Self {
        Self {
            client: create_llm_client(),
        }
    }

    /// Perform the actual work of `complete_json`.
    async fn complete_json_inner(
        &self,
        prompt: &str,
        schema: &Value,
        decoding: &DecodingOptions,
    ) -> Result<String> {
        let json_schema = ResponseFormatJsonSchema {
            name: schema
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("ResponseFormat")
                .to_owned(),
            schema: Some(schema.to_owned()),
            strict: Some(true),
            description: None,
        };
        let message: ChatCompletionRequestMessage =
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .context("Error building message")?
                .into();
        let req = CreateChatCompletionRequestArgs::default()
            .model(decoding.model.clone())
            .messages(vec![message])
            .temperature(decoding.temperature)
            .seed(decoding.seed)
            .response_format(ResponseFormat::JsonSchema { json_schema })
            .build()
            .context("Error building request")?;
        trace!(?req, "Request");

        let chat = self.client.chat();
        let chat_future = chat.create_byot::<_, Value>(req);
        let chat_result = match decoding.timeout {
            Some(timeout) => time::timeout(timeout, chat_future)
                .await
                .map_err(|_| anyhow!("request timed out after {:?}", timeout))?,
            None => chat_future.await,
        }
        .context("Error calling model")?;
        debug!(%chat_result, "OpenAI response");

        let response = serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
            .context("Error parsing OpenAI response")?;
        let choice = response
            .choices
            .first()
            .ok_or_else(|| anyhow!("No choices in OpenAI response"))?;
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return Err(anyhow!("Content filter triggered"));
        }
        Ok(choice.message.content.clone().unwrap_or_default())
    }
}

impl Default for OpenAiModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    #[instrument(level = "debug", skip_all, fields(model = %decoding.model))]
    async fn complete_json(
        &self,
        prompt: &str,
        schema: &Value,
        decoding: &DecodingOptions,
    ) -> Result<String, ItemError> {
        self.complete_json_inner(prompt, schema, decoding)
            .await
            .map_err(|err| ItemError::model_invocation("language model", &err))
    }
}
