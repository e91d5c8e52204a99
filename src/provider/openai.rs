// Aglogen Assistant — OpenAI-compatible provider
//
// Chat completions over HTTP. Groq and xAI expose the same API and are the
// same client pointed at another base URL.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};

use super::*;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";

pub struct OpenAICompatibleProvider {
    provider: String,
    api_key: String,
    api_base: String,
    model: String,
    client: Client,
    retry: RetryPolicy,
}

impl OpenAICompatibleProvider {
    pub fn new(
        provider: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        api_base: Option<&str>,
    ) -> anyhow::Result<Self> {
        let provider = provider.into();
        let api_base = match api_base.filter(|b| !b.is_empty()) {
            Some(base) => base.to_string(),
            None => match provider.as_str() {
                "groq" => GROQ_BASE_URL.to_string(),
                "xai" => XAI_BASE_URL.to_string(),
                _ => OPENAI_BASE_URL.to_string(),
            },
        };
        Ok(Self {
            provider,
            api_key: api_key.into(),
            api_base,
            model: model.into(),
            client: http_client()?,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn format_messages(messages: &[ChatMessage], system_prompt: Option<&str>) -> Vec<Value> {
        let mut formatted = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt.filter(|s| !s.is_empty()) {
            formatted.push(json!({"role": "system", "content": system}));
        }
        for msg in messages {
            match (msg.role.as_str(), &msg.tool_calls) {
                ("tool", _) => formatted.push(json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                })),
                ("assistant", Some(calls)) => {
                    let calls: Vec<Value> = calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {
                                    "name": c.name,
                                    "arguments": Value::Object(c.arguments.clone()).to_string(),
                                }
                            })
                        })
                        .collect();
                    let content = if msg.content.is_empty() { Value::Null } else { json!(msg.content) };
                    formatted.push(json!({"role": "assistant", "content": content, "tool_calls": calls}));
                }
                (role, _) => formatted.push(json!({"role": role, "content": msg.content})),
            }
        }
        formatted
    }

    fn format_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool_field(t, "name"),
                        "description": tool_field(t, "description"),
                        "parameters": tool_schema(t),
                    }
                })
            })
            .collect()
    }

    async fn send(&self, messages: &[ChatMessage], tools: &[Value], options: &CompletionOptions) -> AIResponse {
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let mut body = json!({
            "model": self.model,
            "messages": Self::format_messages(messages, options.system_prompt.as_deref()),
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = json!(Self::format_tools(tools));
        }

        let headers = [("Authorization", format!("Bearer {}", self.api_key))];
        let result = match post_json(&self.client, &url, &headers, &body, self.retry).await {
            Ok(text) => parse_response(&text, &self.provider),
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| AIResponse::api_error(&self.provider, &self.model, &e))
    }
}

#[async_trait]
impl AIProvider for OpenAICompatibleProvider {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> AIResponse {
        self.send(messages, &[], options).await
    }

    async fn complete_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
        options: &CompletionOptions,
    ) -> AIResponse {
        self.send(messages, tools, options).await
    }
}

/// Parse a chat completion body into an [`AIResponse`].
pub(crate) fn parse_response(body: &str, provider: &str) -> anyhow::Result<AIResponse> {
    let v: Value = serde_json::from_str(body)?;
    check_api_error(&v)?;

    let choice = v
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| anyhow::anyhow!("No choices in LLM response"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| anyhow::anyhow!("No message in choice"))?;

    let content = message.get("content").and_then(Value::as_str).map(str::to_string);

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .map(|tc| {
                    let function = tc.get("function");
                    let raw = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    let arguments = match serde_json::from_str::<Value>(raw) {
                        Ok(Value::Object(map)) => map,
                        _ => {
                            let mut map = Map::new();
                            map.insert("raw".into(), json!(raw));
                            map
                        }
                    };
                    ToolCall {
                        id: tc.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                        name: function
                            .and_then(|f| f.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        arguments,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    let usage = v
        .get("usage")
        .map(|u| TokenUsage {
            input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(AIResponse {
        content,
        tool_calls,
        stop_reason,
        usage,
        model: v.get("model").and_then(Value::as_str).unwrap_or("").to_string(),
        provider: provider.to_string(),
    })
}
