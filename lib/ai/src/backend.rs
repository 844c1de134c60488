//! LLM backend abstraction.

use crate::error::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Known LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Ollama,
    Anthropic,
    OpenAi,
    OpenAiCompatible,
    /// Canned responses, no network.
    Scripted,
}

/// A completion request built from an `ai-agent` node's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Model identifier; `None` lets the backend pick its default.
    pub model: Option<String>,
    pub prompt: String,
    pub system: Option<String>,
    /// JSON schema the response should conform to.
    pub output_schema: Option<JsonValue>,
    /// Sampling temperature (0.0 - 1.0).
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// Creates a request with just a prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            prompt: prompt.into(),
            system: None,
            output_schema: None,
            temperature: None,
            max_tokens: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    #[must_use]
    pub fn with_output_schema(mut self, schema: JsonValue) -> Self {
        self.output_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A response from an LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The generated text.
    pub content: String,
    /// Parsed output when the request carried an output schema.
    pub structured_output: Option<JsonValue>,
    pub usage: TokenUsage,
    /// Model that generated the response.
    pub model: String,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Returns the total number of tokens.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Interface every LLM provider implements.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generates a response for the given request.
    ///
    /// # Errors
    ///
    /// Returns an error if the LLM call fails.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Returns the provider type.
    fn provider(&self) -> LlmProvider;

    /// Returns the default model name.
    fn model(&self) -> &str;
}

/// Backend that replays queued responses, then echoes the prompt.
///
/// Used for dry runs and for testing workflows that contain `ai-agent`
/// nodes without network access.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful response.
    #[must_use]
    pub fn respond(self, content: impl Into<String>) -> Self {
        self.push(Ok(content.into()))
    }

    /// Queues a failure.
    #[must_use]
    pub fn fail(self, error: LlmError) -> Self {
        self.push(Err(error))
    }

    fn push(self, response: Result<String, LlmError>) -> Self {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
        self
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let next = self
            .responses
            .lock()
            .map_err(|_| LlmError::ProviderUnavailable {
                provider: "scripted".to_string(),
                reason: "response queue poisoned".to_string(),
            })?
            .pop_front();
        let content = match next {
            Some(response) => response?,
            None => request.prompt.clone(),
        };
        let structured_output = request
            .output_schema
            .as_ref()
            .and_then(|_| serde_json::from_str(&content).ok());
        Ok(LlmResponse {
            usage: TokenUsage {
                input_tokens: u32::try_from(request.prompt.split_whitespace().count())
                    .unwrap_or(u32::MAX),
                output_tokens: u32::try_from(content.split_whitespace().count())
                    .unwrap_or(u32::MAX),
            },
            content,
            structured_output,
            model: request.model.clone().unwrap_or_else(|| self.model().to_string()),
        })
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Scripted
    }

    fn model(&self) -> &str {
        "scripted"
    }
}
