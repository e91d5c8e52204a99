// Aglogen Assistant — Tool execution context

use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

use super::{Arguments, DEFAULT_INJECTED_PARAMS};
use crate::store::User;

/// The parts of an inbound request a context is derived from.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub user: User,
    pub body: Option<Value>,
    pub query: HashMap<String, String>,
}

impl RequestInfo {
    pub fn new(user: User) -> Self {
        Self {
            user,
            body: None,
            query: HashMap::new(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }
}

/// Per-request data handed to tools. Built fresh for every request.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user: User,
    pub project_id: Option<i64>,
    pub conversation_id: Option<String>,
    pub request_id: String,
}

impl ToolContext {
    pub fn new(user: User) -> Self {
        Self {
            user,
            project_id: None,
            conversation_id: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_project(mut self, project_id: Option<i64>) -> Self {
        self.project_id = project_id;
        self
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn to_dict(&self) -> Value {
        json!({
            "user_id": self.user.id,
            "project_id": self.project_id,
            "conversation_id": self.conversation_id,
            "request_id": self.request_id,
        })
    }
}

pub struct ContextManager;

impl ContextManager {
    /// Build a context. The project id comes from the explicit argument, then
    /// the body's `project_id`, then the query string. A value that does not
    /// parse as an integer yields no project rather than an error.
    pub fn from_request(
        request: &RequestInfo,
        project_id: Option<i64>,
        conversation_id: Option<String>,
    ) -> ToolContext {
        let project_id = project_id.or_else(|| {
            let from_body = request
                .body
                .as_ref()
                .and_then(|b| b.get("project_id"))
                .filter(|v| !v.is_null());
            match from_body {
                Some(v) => parse_project_id(v),
                None => request
                    .query
                    .get("project_id")
                    .and_then(|s| s.trim().parse().ok()),
            }
        });

        ToolContext::new(request.user.clone())
            .with_project(project_id)
            .with_conversation(conversation_id)
    }

    /// Merge context values into a copy of `arguments`. `user` and
    /// `request_id` are always set when requested; `project_id` and
    /// `conversation_id` only when the context has one.
    pub fn inject_context(
        context: &ToolContext,
        arguments: &Arguments,
        injected_params: Option<&BTreeSet<String>>,
    ) -> Arguments {
        let defaults: BTreeSet<String>;
        let injected = match injected_params {
            Some(p) => p,
            None => {
                defaults = DEFAULT_INJECTED_PARAMS.iter().map(|s| s.to_string()).collect();
                &defaults
            }
        };

        let mut merged = arguments.clone();
        if injected.contains("user") {
            merged.insert("user".into(), context.user.to_context_value());
        }
        if injected.contains("project_id") {
            if let Some(id) = context.project_id {
                merged.insert("project_id".into(), json!(id));
            }
        }
        if injected.contains("conversation_id") {
            if let Some(id) = &context.conversation_id {
                merged.insert("conversation_id".into(), json!(id));
            }
        }
        if injected.contains("request_id") {
            merged.insert("request_id".into(), json!(context.request_id));
        }
        merged
    }
}

/// Integers, integral floats such as `3.0`, and numeric strings.
fn parse_project_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
