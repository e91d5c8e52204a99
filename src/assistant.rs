// Aglogen Assistant — AI service
//
// Resolves the user's provider configuration and runs the tool loop:
// call the LLM, execute requested tools, feed results back, repeat.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{AssistantConfig, ToolsConfig};
use crate::crypto::ApiKeyEncryption;
use crate::provider::factory::provider_display;
use crate::provider::{AIProvider, AIResponse, ChatMessage, CompletionOptions, ProviderFactory, StopReason, TokenUsage, ToolCall};
use crate::store::{AIProviderConfig, Store, User};
use crate::tool::executor::internal_error;
use crate::tool::{ToolContext, ToolExecutor, ToolRegistry, ToolResult};

const NO_PROVIDER: &str = "No AI provider configured. Please add a provider configuration in your settings.";
const MAX_ITERATIONS_REPLY: &str = "(Assistant reached maximum tool iterations without a final response)";

/// One executed tool call, as reported back to the client.
#[derive(Debug, Clone, Serialize)]
pub struct ToolTrace {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Value,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub reply: String,
    pub stop_reason: StopReason,
    pub iterations: usize,
    pub usage: TokenUsage,
    pub tool_trace: Vec<ToolTrace>,
    pub model: String,
    pub provider: String,
}

/// Outcome of a provider connection test.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCheck {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response: String,
}

impl ConnectionCheck {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            response: String::new(),
        }
    }
}

#[derive(Clone)]
pub struct AIService {
    store: Store,
    encryption: Arc<ApiKeyEncryption>,
    factory: ProviderFactory,
    settings: AssistantConfig,
    tools: ToolsConfig,
}

impl AIService {
    pub fn new(store: Store, encryption: Arc<ApiKeyEncryption>, settings: AssistantConfig, tools: ToolsConfig) -> Self {
        let factory = ProviderFactory::with_api_bases(settings.api_bases.clone());
        Self {
            store,
            encryption,
            factory,
            settings,
            tools,
        }
    }

    /// Cipher for stored provider API keys.
    pub fn encryption(&self) -> &ApiKeyEncryption {
        &self.encryption
    }

    pub fn options(&self) -> CompletionOptions {
        CompletionOptions {
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system_prompt: Some(self.settings.system_prompt.clone()).filter(|s| !s.is_empty()),
        }
    }

    /// Build the provider from the user's active configuration: the default
    /// one if set, otherwise the newest.
    pub async fn provider_for(&self, user: &User) -> anyhow::Result<Box<dyn AIProvider>> {
        let config = self
            .store
            .active_provider_configs(user.id)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!(NO_PROVIDER))?;
        let api_key = self.encryption.decrypt(&config.api_key_encrypted)?;
        self.factory
            .create_provider(&config.provider, &api_key, &config.model_name)
    }

    pub async fn complete(&self, user: &User, messages: &[ChatMessage], options: &CompletionOptions) -> AIResponse {
        match self.provider_for(user).await {
            Ok(provider) => provider.complete(messages, options).await,
            Err(e) => {
                tracing::error!(user_id = user.id, error = %e, "AI completion error");
                error_response(&e)
            }
        }
    }

    pub async fn complete_with_tools(
        &self,
        user: &User,
        messages: &[ChatMessage],
        tools: &[Value],
        options: &CompletionOptions,
    ) -> AIResponse {
        match self.provider_for(user).await {
            Ok(provider) => provider.complete_with_tools(messages, tools, options).await,
            Err(e) => {
                tracing::error!(user_id = user.id, error = %e, "AI completion with tools error");
                error_response(&e)
            }
        }
    }

    /// Send a one-word prompt through `config` and report whether the
    /// provider answered.
    pub async fn test_connection(&self, config: &AIProviderConfig) -> ConnectionCheck {
        let provider = match self
            .encryption
            .decrypt(&config.api_key_encrypted)
            .map_err(anyhow::Error::from)
            .and_then(|key| self.factory.create_provider(&config.provider, &key, &config.model_name))
        {
            Ok(p) => p,
            Err(e) => return ConnectionCheck::failed(e.to_string()),
        };
        let options = CompletionOptions {
            max_tokens: 10,
            temperature: 0.0,
            system_prompt: None,
        };
        let response = provider
            .complete(&[ChatMessage::user("Say 'connected' in one word.")], &options)
            .await;
        if response.stop_reason == StopReason::Error {
            tracing::warn!(provider = %config.provider, model = %config.model_name, "Provider connection test failed");
            return ConnectionCheck::failed(response.text());
        }
        let display = provider_display(&config.provider).unwrap_or(config.provider.as_str());
        ConnectionCheck {
            success: true,
            message: format!("Connected to {} ({})", display, config.model_name),
            response: response.text().chars().take(100).collect(),
        }
    }

    /// Neutral definitions of the tools the assistant may call.
    pub async fn tool_definitions(&self, registry: &ToolRegistry) -> Vec<Value> {
        registry
            .get_all_tools()
            .await
            .iter()
            .filter(|t| self.tools.is_enabled(&t.category))
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect()
    }

    pub async fn chat(
        &self,
        registry: &ToolRegistry,
        context: ToolContext,
        history: Vec<ChatMessage>,
        message: &str,
    ) -> anyhow::Result<ChatOutcome> {
        let provider = self.provider_for(&context.user).await?;
        Ok(self
            .chat_with_provider(provider.as_ref(), registry, context, history, message)
            .await)
    }

    /// The tool loop against an already-built provider.
    pub async fn chat_with_provider(
        &self,
        provider: &dyn AIProvider,
        registry: &ToolRegistry,
        context: ToolContext,
        history: Vec<ChatMessage>,
        message: &str,
    ) -> ChatOutcome {
        let tools = self.tool_definitions(registry).await;
        let options = self.options();
        let executor = Arc::new(ToolExecutor::new(registry.clone(), context));

        let mut messages = history;
        messages.push(ChatMessage::user(message));

        let mut outcome = ChatOutcome {
            reply: String::new(),
            stop_reason: StopReason::EndTurn,
            iterations: 0,
            usage: TokenUsage::default(),
            tool_trace: Vec::new(),
            model: provider.model_name().to_string(),
            provider: provider.provider_name().to_string(),
        };

        for iteration in 0..self.settings.max_tool_iterations {
            tracing::info!(
                iteration,
                messages = messages.len(),
                model = %provider.model_name(),
                "Running LLM iteration"
            );
            let response = provider.complete_with_tools(&messages, &tools, &options).await;
            outcome.iterations = iteration + 1;
            outcome.usage.input_tokens += response.usage.input_tokens;
            outcome.usage.output_tokens += response.usage.output_tokens;
            outcome.stop_reason = response.stop_reason;

            if !response.has_tool_calls() || response.stop_reason == StopReason::Error {
                outcome.reply = response.text().to_string();
                return outcome;
            }

            tracing::info!(
                count = response.tool_calls.len(),
                names = %response.tool_calls.iter().map(|tc| tc.name.as_str()).collect::<Vec<_>>().join(", "),
                "Executing tool calls"
            );
            messages.push(ChatMessage::assistant_with_tool_calls(
                response.text(),
                response.tool_calls.clone(),
            ));
            for (trace, output) in execute_tools(&executor, &response.tool_calls).await {
                messages.push(ChatMessage::tool_result(&trace.tool_call_id, output));
                outcome.tool_trace.push(trace);
            }
        }

        tracing::warn!(
            iterations = outcome.iterations,
            "Tool loop stopped at the iteration limit"
        );
        outcome.reply = MAX_ITERATIONS_REPLY.to_string();
        outcome
    }
}

fn error_response(err: &anyhow::Error) -> AIResponse {
    AIResponse {
        content: Some(format!("Error: {}", err)),
        tool_calls: Vec::new(),
        stop_reason: StopReason::Error,
        usage: TokenUsage::default(),
        model: String::new(),
        provider: String::new(),
    }
}

async fn execute_tools(executor: &Arc<ToolExecutor>, calls: &[ToolCall]) -> Vec<(ToolTrace, String)> {
    run_tool_calls(calls, |call| {
        let executor = executor.clone();
        async move { executor.execute(&call.name, call.arguments).await }
    })
    .await
}

/// Run each call on its own task; results keep the order of the calls. A
/// task that dies still answers its call id with an error result.
async fn run_tool_calls<F, Fut>(calls: &[ToolCall], run: F) -> Vec<(ToolTrace, String)>
where
    F: Fn(ToolCall) -> Fut,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    let mut set = tokio::task::JoinSet::new();
    let mut slots = HashMap::new();
    for (index, call) in calls.iter().enumerate() {
        let pending = run(call.clone());
        let handle = set.spawn(async move {
            let start = Instant::now();
            let result = pending.await;
            (index, start.elapsed().as_millis() as u64, result)
        });
        slots.insert(handle.id(), index);
    }

    let mut outputs: Vec<Option<(ToolTrace, String)>> = vec![None; calls.len()];
    while let Some(joined) = set.join_next().await {
        let (index, duration_ms, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                let Some(&index) = slots.get(&e.id()) else {
                    continue;
                };
                tracing::error!(tool = %calls[index].name, error = %e, "Tool task failed to complete");
                (index, 0, internal_error())
            }
        };
        let call = &calls[index];
        let trace = ToolTrace {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: Value::Object(call.arguments.clone()),
            success: result.is_success(),
            duration_ms,
        };
        outputs[index] = Some((trace, result.to_dict().to_string()));
    }
    outputs.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{with_state, Arguments, HandlerResult, ToolBuilder};
    use async_trait::async_trait;
    use serde_json::Map;
    use tokio::sync::Mutex;

    /// Replays canned responses in order, recording what it was sent.
    struct ScriptedProvider {
        responses: Mutex<Vec<AIResponse>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<AIResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AIProvider for ScriptedProvider {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "script-1"
        }

        async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> AIResponse {
            self.complete_with_tools(messages, &[], options).await
        }

        async fn complete_with_tools(&self, messages: &[ChatMessage], _: &[Value], _: &CompletionOptions) -> AIResponse {
            self.seen.lock().await.push(messages.to_vec());
            self.responses
                .lock()
                .await
                .pop()
                .unwrap_or_else(|| text_response("done"))
        }
    }

    fn text_response(text: &str) -> AIResponse {
        AIResponse {
            content: Some(text.into()),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
            model: "script-1".into(),
            provider: "scripted".into(),
        }
    }

    fn tool_response(name: &str, args: Value) -> AIResponse {
        let arguments = match args {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        AIResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: format!("call_{}", name),
                name: name.into(),
                arguments,
            }],
            stop_reason: StopReason::ToolUse,
            ..text_response("")
        }
    }

    async fn echo(_: (), args: Arguments) -> HandlerResult {
        Ok(json!({"echo": args.get("text").cloned().unwrap_or(Value::Null)}).into())
    }

    async fn service(store: Store) -> (AIService, ToolRegistry) {
        let key = ApiKeyEncryption::generate_key();
        let encryption = Arc::new(ApiKeyEncryption::new(&key).unwrap());
        let registry = ToolRegistry::new();
        registry
            .register(
                ToolBuilder::new("echo")
                    .doc("Echo text back.\n\nArgs:\n    text: Text to echo.")
                    .param(crate::tool::Param::new("text", "str"))
                    .handler(with_state((), echo)),
            )
            .await;
        let settings = AssistantConfig {
            max_tool_iterations: 3,
            ..AssistantConfig::default()
        };
        (AIService::new(store, encryption, settings, ToolsConfig::default()), registry)
    }

    #[tokio::test]
    async fn test_chat_runs_tool_loop() {
        crate::logger::init_test();
        let (svc, registry) = service(Store::new()).await;
        let provider = ScriptedProvider::new(vec![
            tool_response("echo", json!({"text": "hi"})),
            text_response("The tool said hi."),
        ]);

        let outcome = svc
            .chat_with_provider(&provider, &registry, ToolContext::new(User::new(1, "alice")), Vec::new(), "say hi")
            .await;
        assert_eq!(outcome.reply, "The tool said hi.");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.usage.total_tokens(), 30);
        assert_eq!(outcome.tool_trace.len(), 1);
        assert!(outcome.tool_trace[0].success);

        let seen = provider.seen.lock().await;
        let last = seen.last().unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[2].role, "tool");
        assert!(last[2].content.contains("\"echo\":\"hi\""));
    }

    #[tokio::test]
    async fn test_chat_stops_at_iteration_limit() {
        let (svc, registry) = service(Store::new()).await;
        let provider = ScriptedProvider::new(
            (0..5).map(|_| tool_response("missing_tool", json!({}))).collect(),
        );
        let outcome = svc
            .chat_with_provider(&provider, &registry, ToolContext::new(User::new(1, "alice")), Vec::new(), "loop")
            .await;
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.reply, MAX_ITERATIONS_REPLY);
        assert!(outcome.tool_trace.iter().all(|t| !t.success));
    }

    #[tokio::test]
    async fn test_crashed_tool_task_still_answers_its_call() {
        let call = |id: &str, name: &str| ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: Map::new(),
        };
        let calls = vec![call("call_a", "ok"), call("call_b", "crash"), call("call_c", "ok")];

        let results = run_tool_calls(&calls, |call| async move {
            if call.name == "crash" {
                panic!("tool task died");
            }
            ToolResult::success_result(Map::new())
        })
        .await;

        let ids: Vec<&str> = results.iter().map(|(t, _)| t.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["call_a", "call_b", "call_c"]);
        assert!(results[0].0.success);
        assert!(!results[1].0.success);
        let output: Value = serde_json::from_str(&results[1].1).unwrap();
        assert_eq!(output["success"], false);
        assert_eq!(output["error"]["error_type"], "InternalError");
    }

    #[tokio::test]
    async fn test_no_provider_configured() {
        let store = Store::new();
        let (svc, _) = service(store).await;
        let user = User::new(7, "bob");
        let response = svc.complete(&user, &[ChatMessage::user("hi")], &svc.options()).await;
        assert_eq!(response.stop_reason, StopReason::Error);
        assert!(response.text().contains("No AI provider configured"));

        let unknown = AIProviderConfig::new(7, "mistral", "m-1", svc.encryption.encrypt("k").unwrap());
        let check = svc.test_connection(&unknown).await;
        assert!(!check.success);
        assert!(check.message.starts_with("Unknown provider: mistral"));

        let garbled = AIProviderConfig::new(7, "openai", "gpt-4o", "not-a-token");
        assert!(!svc.test_connection(&garbled).await.success);
    }

    #[tokio::test]
    async fn test_provider_for_prefers_default() {
        let store = Store::new();
        let (svc, _) = service(store.clone()).await;
        let encrypted = svc.encryption.encrypt("sk-test").unwrap();

        let mut first = AIProviderConfig::new(3, "openai", "gpt-4o", encrypted.clone());
        first.is_default = true;
        store.add_provider_config(first).await.unwrap();
        store
            .add_provider_config(AIProviderConfig::new(3, "anthropic", "claude-x", encrypted))
            .await
            .unwrap();

        let provider = svc.provider_for(&User::new(3, "carol")).await.unwrap();
        assert_eq!(provider.provider_name(), "openai");
        assert_eq!(provider.model_name(), "gpt-4o");
    }
}
