// Aglogen Assistant — LLM provider abstraction

pub mod anthropic;
pub mod factory;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use factory::ProviderFactory;
pub use openai::OpenAICompatibleProvider;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            ..Self::with_role("assistant", content)
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role("tool", content)
        }
    }
}

/// A tool invocation requested by the model, arguments already decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Provider-neutral completion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIResponse {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
}

impl AIResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// The response returned when the API call itself failed.
    pub fn api_error(provider: &str, model: &str, err: &anyhow::Error) -> Self {
        tracing::error!(provider = %provider, error = %err, "LLM API error");
        Self {
            content: Some(format!("API Error: {}", err)),
            tool_calls: Vec::new(),
            stop_reason: StopReason::Error,
            usage: TokenUsage::default(),
            model: model.to_string(),
            provider: provider.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f64,
    pub system_prompt: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
            system_prompt: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// One implementation per backend. Failed API calls come back as an
/// `AIResponse` with `StopReason::Error`, never as an `Err`.
#[async_trait]
pub trait AIProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> AIResponse;

    /// `tools` are neutral definitions: `{name, description, parameters}`
    /// (an `input_schema` key is accepted in place of `parameters`).
    async fn complete_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        options: &CompletionOptions,
    ) -> AIResponse;

    fn model_info(&self) -> Value {
        json!({"provider": self.provider_name(), "model": self.model_name()})
    }
}

pub(crate) fn tool_schema(tool: &Value) -> Value {
    tool.get("parameters")
        .or_else(|| tool.get("input_schema"))
        .cloned()
        .unwrap_or_else(|| json!({}))
}

pub(crate) fn tool_field<'a>(tool: &'a Value, key: &str) -> &'a str {
    tool.get(key).and_then(Value::as_str).unwrap_or("")
}

// ---------------------------------------------------------------------------
// HTTP plumbing shared by the adapters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

pub(crate) fn http_client() -> anyhow::Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(30))
        .build()?)
}

/// POST `body` as JSON and return the response text. 429 and 5xx responses
/// and network errors are retried per `policy`; other failures are returned
/// at once.
pub(crate) async fn post_json(
    client: &Client,
    url: &str,
    headers: &[(&str, String)],
    body: &Value,
    policy: RetryPolicy,
) -> anyhow::Result<String> {
    let mut last_error = None;
    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            tracing::info!(attempt = attempt, "Retrying API request after {}ms delay", policy.retry_delay_ms);
            tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms)).await;
        }

        tracing::debug!(url = %url, attempt = attempt, "Sending API request");
        let mut request = client.post(url).header("Content-Type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        match request.json(body).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let text = response.text().await?;
                    tracing::debug!(status = %status, body_len = text.len(), "API response received");
                    return Ok(text);
                }

                let is_transient = status.is_server_error() || status.as_u16() == 429;
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "could not read body".to_string());
                if is_transient && attempt < policy.max_retries {
                    tracing::warn!(status = %status, attempt = attempt, "Transient API error: {}", text);
                    last_error = Some(anyhow::anyhow!("API error ({}): {}", status, text));
                    continue;
                }
                anyhow::bail!("API error ({}): {}", status, text);
            }
            Err(e) if attempt < policy.max_retries => {
                tracing::warn!(error = %e, attempt = attempt, "Network error during API request");
                last_error = Some(anyhow::Error::from(e));
            }
            Err(e) => return Err(anyhow::Error::from(e)),
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("API request failed after {} attempts", policy.max_retries + 1)))
}

/// Surface an `{"error": {"message": ..}}` payload as an error.
pub(crate) fn check_api_error(v: &Value) -> anyhow::Result<()> {
    if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        anyhow::bail!("API error: {}", msg);
    }
    Ok(())
}
