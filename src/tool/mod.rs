// Aglogen Assistant — Tool system

pub mod analysis;
pub mod context;
pub mod executor;
pub mod knowledge;
pub mod registration;
pub mod registry;
pub mod schema;
pub mod simulation;
pub mod study;
pub mod utility;
pub mod validation;

pub use context::{ContextManager, RequestInfo, ToolContext};
pub use executor::ToolExecutor;
pub use registry::ToolRegistry;
pub use schema::{Param, ParamType, ToolBuilder};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::queue::QueueError;
use crate::store::{StoreError, User};

/// Raw JSON arguments as received from the LLM or the HTTP API.
pub type Arguments = Map<String, Value>;

/// Parameters filled from the execution context unless a tool says otherwise.
pub const DEFAULT_INJECTED_PARAMS: [&str; 2] = ["user", "project_id"];

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Category of a failed tool call. Serialises to the `error_type` strings the
/// frontend and the LLM already understand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    ToolNotFound,
    Context,
    Validation,
    Value,
    Permission,
    Internal,
    Authentication,
    Search,
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::ToolNotFound => "ToolNotFoundError",
            ErrorKind::Context => "ContextError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Permission => "PermissionError",
            ErrorKind::Internal => "InternalError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Search => "SearchError",
            ErrorKind::Other(s) => s,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ToolNotFoundError" => ErrorKind::ToolNotFound,
            "ContextError" => ErrorKind::Context,
            "ValidationError" => ErrorKind::Validation,
            "ValueError" => ErrorKind::Value,
            "PermissionError" => ErrorKind::Permission,
            "InternalError" => ErrorKind::Internal,
            "AuthenticationError" => ErrorKind::Authentication,
            "SearchError" => ErrorKind::Search,
            _ => ErrorKind::Other(s),
        }
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tool result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolError {
    pub error_type: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "details_empty")]
    pub details: Option<Value>,
    pub recoverable: bool,
}

fn details_empty(details: &Option<Value>) -> bool {
    match details {
        None | Some(Value::Null) => true,
        Some(Value::Object(m)) => m.is_empty(),
        Some(_) => false,
    }
}

impl ToolError {
    pub fn new(error_type: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
            recoverable: true,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn to_dict(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outcome of a tool call: success data or a typed error, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(Map<String, Value>),
    Failure(ToolError),
}

impl ToolResult {
    pub fn success_result(data: Map<String, Value>) -> Self {
        ToolResult::Success(data)
    }

    pub fn error_result(
        error_type: ErrorKind,
        message: impl Into<String>,
        details: Option<Value>,
        recoverable: bool,
    ) -> Self {
        ToolResult::Failure(ToolError {
            error_type,
            message: message.into(),
            details,
            recoverable,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success(_))
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        match self {
            ToolResult::Success(data) => Some(data),
            ToolResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ToolError> {
        match self {
            ToolResult::Success(_) => None,
            ToolResult::Failure(err) => Some(err),
        }
    }

    pub fn to_dict(&self) -> Value {
        match self {
            ToolResult::Success(data) => json!({"success": true, "data": data}),
            ToolResult::Failure(err) => json!({"success": false, "error": err.to_dict()}),
        }
    }
}

impl Serialize for ToolResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_dict().serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Business-level failure raised by a handler. The executor maps each variant
/// onto the error taxonomy; `Internal` never reaches the caller verbatim.
#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("{0}")]
    Value(String),
    #[error("{0}")]
    Permission(String),
    #[error("{message}")]
    Execution {
        error_type: ErrorKind,
        message: String,
        details: Option<Value>,
        recoverable: bool,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ToolFailure {
    pub fn value(msg: impl Into<String>) -> Self {
        ToolFailure::Value(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        ToolFailure::Permission(msg.into())
    }
}

impl From<StoreError> for ToolFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) | StoreError::Invalid(_) => ToolFailure::Value(err.to_string()),
            StoreError::Forbidden(_) => ToolFailure::Permission(err.to_string()),
            StoreError::Io(_) | StoreError::Serde(_) => ToolFailure::Internal(err.into()),
        }
    }
}

impl From<QueueError> for ToolFailure {
    fn from(err: QueueError) -> Self {
        ToolFailure::Execution {
            error_type: ErrorKind::Internal,
            message: err.to_string(),
            details: None,
            recoverable: matches!(err, QueueError::Full(_)),
        }
    }
}

/// What a handler hands back before the executor wraps it.
#[derive(Debug, Clone)]
pub enum HandlerOutput {
    Result(ToolResult),
    Data(Value),
}

impl From<ToolResult> for HandlerOutput {
    fn from(r: ToolResult) -> Self {
        HandlerOutput::Result(r)
    }
}

impl From<Value> for HandlerOutput {
    fn from(v: Value) -> Self {
        HandlerOutput::Data(v)
    }
}

pub type HandlerResult = Result<HandlerOutput, ToolFailure>;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Arguments) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, args: Arguments) -> HandlerResult {
        (self)(args).await
    }
}

/// Adapt an `async fn(state, args)` into a handler that owns a clone of
/// `state` for every call.
pub fn with_state<S, F, Fut>(state: S, f: F) -> impl ToolHandler
where
    S: Clone + Send + Sync + 'static,
    F: Fn(S, Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    move |args: Arguments| f(state.clone(), args)
}

/// Deserialize the merged arguments into a handler's typed parameter struct.
pub fn parse_args<T: DeserializeOwned>(args: Arguments) -> Result<T, ToolFailure> {
    serde_json::from_value(Value::Object(args))
        .map_err(|e| ToolFailure::Value(format!("Invalid arguments: {}", e)))
}

// ---------------------------------------------------------------------------
// Tool definition
// ---------------------------------------------------------------------------

/// Which merged argument keys reach the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptedArgs {
    /// Only these names; anything else is dropped before invocation.
    Declared(BTreeSet<String>),
    /// Everything passes through.
    Any,
}

impl AcceptedArgs {
    pub fn accepts(&self, name: &str) -> bool {
        match self {
            AcceptedArgs::Declared(names) => names.contains(name),
            AcceptedArgs::Any => true,
        }
    }
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub handler: Arc<dyn ToolHandler>,
    pub category: String,
    pub requires_project: bool,
    pub is_async: bool,
    pub injected_params: BTreeSet<String>,
    pub accepted: AcceptedArgs,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
            category: "utility".to_string(),
            requires_project: false,
            is_async: false,
            injected_params: DEFAULT_INJECTED_PARAMS.iter().map(|s| s.to_string()).collect(),
            accepted: AcceptedArgs::Any,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_requires_project(mut self, requires_project: bool) -> Self {
        self.requires_project = requires_project;
        self
    }

    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn with_injected_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.injected_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_accepted(mut self, accepted: AcceptedArgs) -> Self {
        self.accepted = accepted;
        self
    }

    pub fn to_anthropic_format(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.parameters,
        })
    }

    pub fn to_openai_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }

    pub fn to_dict(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
            "category": self.category,
            "requires_project": self.requires_project,
            "is_async": self.is_async,
        })
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("requires_project", &self.requires_project)
            .field("is_async", &self.is_async)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the tool collections
// ---------------------------------------------------------------------------

/// Round half away from zero to `places` decimals.
pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// The injected caller. Tools refuse to run without one.
pub(crate) fn caller(user: Option<User>) -> Result<User, ToolFailure> {
    user.ok_or_else(|| ToolFailure::permission("Authentication required"))
}

pub(crate) fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(m) => m,
        other => {
            let mut m = Map::new();
            m.insert("result".to_string(), other);
            m
        }
    }
}
