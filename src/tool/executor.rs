// Aglogen Assistant — Tool executor
//
// Lookup, project check, validation, context injection, argument filtering,
// invocation and result wrapping. Every outcome is a ToolResult.

use serde_json::{json, Value};
use std::time::Instant;

use super::context::{ContextManager, ToolContext};
use super::validation::validate_and_raise;
use super::{obj, Arguments, ErrorKind, HandlerOutput, ToolDefinition, ToolFailure, ToolRegistry, ToolResult};

pub struct ToolExecutor {
    registry: ToolRegistry,
    context: ToolContext,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, context: ToolContext) -> Self {
        Self { registry, context }
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    pub async fn execute(&self, tool_name: &str, arguments: Arguments) -> ToolResult {
        let start = Instant::now();
        tracing::info!(
            tool = %tool_name,
            request_id = %self.context.request_id,
            user_id = self.context.user.id,
            "Executing tool"
        );

        let result = self.run(tool_name, arguments).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            ToolResult::Success(_) => tracing::debug!(
                tool = %tool_name,
                request_id = %self.context.request_id,
                duration_ms,
                "Tool succeeded"
            ),
            ToolResult::Failure(err) => tracing::debug!(
                tool = %tool_name,
                request_id = %self.context.request_id,
                error_type = %err.error_type,
                duration_ms,
                "Tool failed"
            ),
        }
        result
    }

    async fn run(&self, tool_name: &str, arguments: Arguments) -> ToolResult {
        let Some(tool) = self.registry.get_tool(tool_name).await else {
            return ToolResult::error_result(
                ErrorKind::ToolNotFound,
                format!("Tool '{}' not found", tool_name),
                None,
                false,
            );
        };

        // Reported ahead of schema errors so a missing project is distinct.
        if tool.requires_project && self.context.project_id.is_none() {
            return ToolResult::error_result(
                ErrorKind::Context,
                format!("Tool '{}' requires a project context", tool_name),
                None,
                true,
            );
        }

        if let Err(e) = validate_and_raise(&tool.parameters, &arguments) {
            return ToolResult::error_result(
                ErrorKind::Validation,
                e.message,
                Some(json!({ "errors": e.errors })),
                true,
            );
        }

        let merged = ContextManager::inject_context(&self.context, &arguments, Some(&tool.injected_params));
        let handler_args = filter_handler_args(&tool, merged);

        // Run on its own task so a panicking handler surfaces as a JoinError.
        let handler = tool.handler.clone();
        let outcome = tokio::spawn(async move { handler.call(handler_args).await }).await;

        match outcome {
            Ok(Ok(HandlerOutput::Result(result))) => result,
            Ok(Ok(HandlerOutput::Data(data))) => ToolResult::success_result(obj(data)),
            Ok(Err(failure)) => self.map_failure(tool_name, failure),
            Err(join_err) => {
                tracing::error!(
                    tool = %tool_name,
                    request_id = %self.context.request_id,
                    "Tool handler aborted: {}",
                    join_err
                );
                internal_error()
            }
        }
    }

    fn map_failure(&self, tool_name: &str, failure: ToolFailure) -> ToolResult {
        let request_id = &self.context.request_id;
        match failure {
            ToolFailure::Execution {
                error_type,
                message,
                details,
                recoverable,
            } => {
                tracing::warn!(tool = %tool_name, error_type = %error_type, request_id = %request_id, "Tool execution error: {}", message);
                ToolResult::error_result(error_type, message, details, recoverable)
            }
            ToolFailure::Permission(message) => {
                tracing::warn!(tool = %tool_name, request_id = %request_id, "Permission denied for tool");
                let message = if message.is_empty() {
                    "Permission denied".to_string()
                } else {
                    message
                };
                ToolResult::error_result(ErrorKind::Permission, message, None, false)
            }
            ToolFailure::Value(message) => {
                tracing::warn!(tool = %tool_name, request_id = %request_id, "Value error in tool: {}", message);
                ToolResult::error_result(ErrorKind::Value, message, None, true)
            }
            ToolFailure::Internal(err) => {
                tracing::error!(tool = %tool_name, request_id = %request_id, "Unexpected error executing tool: {:#}", err);
                internal_error()
            }
        }
    }

    /// For asynchronous tools the call still runs inline; the response is
    /// relabelled with a synthetic task id so callers can treat it uniformly.
    pub async fn execute_async(&self, tool_name: &str, arguments: Arguments) -> ToolResult {
        let Some(tool) = self.registry.get_tool(tool_name).await else {
            return ToolResult::error_result(
                ErrorKind::ToolNotFound,
                format!("Tool '{}' not found", tool_name),
                None,
                false,
            );
        };
        if !tool.is_async {
            return self.execute(tool_name, arguments).await;
        }

        tracing::info!(tool = %tool_name, request_id = %self.context.request_id, "Async tool execution requested");
        match self.execute(tool_name, arguments).await {
            ToolResult::Success(data) => ToolResult::success_result(obj(json!({
                "status": "completed",
                "task_id": format!("sync-{}", self.context.request_id),
                "result": Value::Object(data),
            }))),
            failure => failure,
        }
    }
}

pub(crate) fn internal_error() -> ToolResult {
    ToolResult::error_result(ErrorKind::Internal, "An unexpected error occurred", None, false)
}

/// Drop merged keys the handler does not declare.
fn filter_handler_args(tool: &ToolDefinition, args: Arguments) -> Arguments {
    args.into_iter()
        .filter(|(k, _)| tool.accepted.accepts(k))
        .collect()
}
