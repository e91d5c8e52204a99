// Aglogen Assistant — Anthropic Messages API provider

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::*;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: String,
    api_base: String,
    model: String,
    client: Client,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, api_base: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            api_base: api_base
                .filter(|b| !b.is_empty())
                .unwrap_or(ANTHROPIC_BASE_URL)
                .to_string(),
            model: model.into(),
            client: http_client()?,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// System messages are lifted out by the caller; tool results travel as
    /// `tool_result` blocks inside a user turn.
    fn format_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|msg| match (msg.role.as_str(), &msg.tool_calls) {
                ("tool", _) => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                    }]
                }),
                ("assistant", Some(calls)) => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": msg.content}));
                    }
                    blocks.extend(calls.iter().map(|c| {
                        json!({"type": "tool_use", "id": c.id, "name": c.name, "input": c.arguments})
                    }));
                    json!({"role": "assistant", "content": blocks})
                }
                (role, _) => json!({"role": role, "content": msg.content}),
            })
            .collect()
    }

    fn format_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": tool_field(t, "name"),
                    "description": tool_field(t, "description"),
                    "input_schema": tool_schema(t),
                })
            })
            .collect()
    }

    fn system_prompt(messages: &[ChatMessage], options: &CompletionOptions) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(system) = options.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            parts.push(system);
        }
        parts.extend(messages.iter().filter(|m| m.role == "system").map(|m| m.content.as_str()));
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    async fn send(&self, messages: &[ChatMessage], tools: &[Value], options: &CompletionOptions) -> AIResponse {
        let url = format!("{}/messages", self.api_base.trim_end_matches('/'));
        let mut body = json!({
            "model": self.model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": Self::format_messages(messages),
        });
        if let Some(system) = Self::system_prompt(messages, options) {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = json!(Self::format_tools(tools));
        }

        let headers = [
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ];
        let result = match post_json(&self.client, &url, &headers, &body, self.retry).await {
            Ok(text) => parse_response(&text),
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| AIResponse::api_error("anthropic", &self.model, &e))
    }
}

#[async_trait]
impl AIProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
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

pub(crate) fn parse_response(body: &str) -> anyhow::Result<AIResponse> {
    let v: Value = serde_json::from_str(body)?;
    check_api_error(&v)?;

    let blocks = v
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("No content in Anthropic response"))?;

    let mut content = None;
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                content = block.get("text").and_then(Value::as_str).map(str::to_string);
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                name: block.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                arguments: block
                    .get("input")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            }),
            _ => {}
        }
    }

    let stop_reason = match v.get("stop_reason").and_then(Value::as_str) {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };
    let usage = v
        .get("usage")
        .map(|u| TokenUsage {
            input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(AIResponse {
        content,
        tool_calls,
        stop_reason,
        usage,
        model: v.get("model").and_then(Value::as_str).unwrap_or("").to_string(),
        provider: "anthropic".to_string(),
    })
}
