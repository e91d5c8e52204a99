// Aglogen Assistant — HTTP API handlers

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::AppState;
use crate::provider::factory::{provider_display, SUPPORTED_PROVIDERS};
use crate::provider::ChatMessage;
use crate::queue::{Lane, TaskStatus};
use crate::rag::search::SearchScope;
use crate::rag::SourceType;
use crate::store::{AIProviderConfig, StoreError, User};
use crate::tool::{ContextManager, ErrorKind, RequestInfo, ToolExecutor, ToolResult};

const NO_AI_ACCESS: &str =
    "AI features are not enabled for your account. Contact an administrator to request access.";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into()})))
}

fn store_error(err: StoreError) -> ApiError {
    let status = match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        StoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        StoreError::Io(_) | StoreError::Serde(_) => {
            tracing::error!(error = %err, "Store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, err.to_string())
}

/// The caller, resolved from `Authorization: Bearer <token>`.
pub struct AuthUser(pub User);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Authentication credentials were not provided."))?;

        match state.store.user_for_token(token).await {
            Some(user) => Ok(AuthUser(user)),
            None => {
                tracing::warn!("Rejected request with unknown API token");
                Err(api_error(StatusCode::UNAUTHORIZED, "Invalid token."))
            }
        }
    }
}

/// An authenticated caller allowed to use the assistant: superusers, and
/// users whose AI access is enabled.
pub struct AIUser(pub User);

impl FromRequestParts<Arc<AppState>> for AIUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if user.is_superuser || user.ai_access {
            return Ok(AIUser(user));
        }
        tracing::warn!(user_id = user.id, "AI access denied");
        Err(api_error(StatusCode::FORBIDDEN, NO_AI_ACCESS))
    }
}

/// A superuser. Guards the worker hand-off routes.
pub struct AdminUser(pub User);

impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if user.is_superuser {
            return Ok(AdminUser(user));
        }
        Err(api_error(StatusCode::FORBIDDEN, "Administrator privileges required."))
    }
}

/// HTTP status for a tool outcome.
pub fn status_for(result: &ToolResult) -> StatusCode {
    match result.error().map(|e| &e.error_type) {
        None => StatusCode::OK,
        Some(ErrorKind::ToolNotFound) => StatusCode::NOT_FOUND,
        Some(ErrorKind::Validation | ErrorKind::Context | ErrorKind::Value) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::Permission) => StatusCode::FORBIDDEN,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "tools": state.registry.len().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ToolsQuery {
    pub category: Option<String>,
}

pub async fn list_tools(
    State(state): State<Arc<AppState>>,
    AIUser(_user): AIUser,
    Query(query): Query<ToolsQuery>,
) -> Json<Value> {
    let enabled = &state.config.tools;
    let tools = match query.category.as_deref().filter(|c| !c.is_empty()) {
        Some(category) => state.registry.get_tools_by_category(category).await,
        None => state.registry.get_all_tools().await,
    };
    let tools: Vec<Value> = tools
        .iter()
        .filter(|t| enabled.is_enabled(&t.category))
        .map(|t| t.to_dict())
        .collect();
    let categories: Vec<String> = state
        .registry
        .get_categories()
        .await
        .into_iter()
        .filter(|c| enabled.is_enabled(c))
        .collect();

    Json(json!({
        "count": tools.len(),
        "tools": tools,
        "categories": categories,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub project_id: Option<Value>,
    pub conversation_id: Option<String>,
}

pub async fn execute_tool(
    State(state): State<Arc<AppState>>,
    AIUser(user): AIUser,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<ExecuteRequest>,
) -> Response {
    let request = query.into_iter().fold(
        RequestInfo::new(user).with_body(json!({"project_id": body.project_id})),
        |request, (key, value)| request.with_query(key, value),
    );
    let context = ContextManager::from_request(&request, None, body.conversation_id);

    let result = if state.config.tools.is_enabled(&tool_category(&state, &name).await) {
        ToolExecutor::new(state.registry.clone(), context)
            .execute(&name, body.arguments)
            .await
    } else {
        ToolResult::error_result(ErrorKind::ToolNotFound, format!("Tool '{}' not found", name), None, false)
    };
    (status_for(&result), Json(result.to_dict())).into_response()
}

async fn tool_category(state: &AppState, name: &str) -> String {
    state
        .registry
        .get_tool(name)
        .await
        .map(|t| t.category.clone())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    pub k: Option<usize>,
    pub source_type: Option<String>,
}

pub async fn rag_search(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let q = query.q.trim();
    if q.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Query parameter 'q' is required"));
    }
    let source_types = match query.source_type.as_deref().filter(|s| !s.is_empty()) {
        None => None,
        Some(s) => Some(vec![SourceType::parse(s).ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, format!("Invalid source_type '{}'", s))
        })?]),
    };
    let k = query.k.unwrap_or(state.config.rag.default_k).clamp(1, 50);
    let scope = SearchScope::Owner {
        user_id: user.id,
        include_global: true,
    };

    let results = state
        .search
        .search(q, scope, k, state.config.rag.min_score, source_types.as_deref())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "RAG search failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Search failed")
        })?;

    Ok(Json(json!({
        "count": results.len(),
        "results": results.iter().map(|r| r.to_dict()).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub project_id: Option<i64>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    AIUser(user): AIUser,
    Json(body): Json<ChatRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message is required"));
    }
    let conversation_id = body
        .conversation_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let context = ContextManager::from_request(&RequestInfo::new(user), body.project_id, Some(conversation_id.clone()));

    let outcome = state
        .assistant
        .chat(&state.registry, context, body.history, &body.message)
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let mut out = serde_json::to_value(&outcome)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    out["conversation_id"] = json!(conversation_id);
    Ok(Json(out))
}

// ---------------------------------------------------------------------------
// Provider configurations
// ---------------------------------------------------------------------------

/// A stored configuration as shown to its owner. The API key never leaves
/// the store.
fn provider_view(config: &AIProviderConfig) -> Value {
    json!({
        "id": config.id,
        "provider": config.provider,
        "provider_display": provider_display(&config.provider).unwrap_or(config.provider.as_str()),
        "model_name": config.model_name,
        "is_default": config.is_default,
        "is_active": config.is_active,
        "created_at": config.created_at,
        "updated_at": config.updated_at,
    })
}

pub async fn list_providers(State(state): State<Arc<AppState>>, AIUser(user): AIUser) -> Json<Value> {
    let configs = state.store.provider_configs_for(user.id).await;
    Json(json!(configs.iter().map(provider_view).collect::<Vec<_>>()))
}

#[derive(Debug, Deserialize)]
pub struct CreateProviderRequest {
    pub provider: String,
    pub api_key: String,
    pub model_name: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    pub is_active: Option<bool>,
}

pub async fn create_provider(
    State(state): State<Arc<AppState>>,
    AIUser(user): AIUser,
    Json(body): Json<CreateProviderRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !SUPPORTED_PROVIDERS.contains(&body.provider.as_str()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "Unknown provider '{}'. Supported: {}",
                body.provider,
                SUPPORTED_PROVIDERS.join(", ")
            ),
        ));
    }
    let api_key = body.api_key.trim();
    if api_key.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "api_key is required"));
    }
    let encrypted = encrypt_key(&state, api_key)?;

    let model_name = body
        .model_name
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let mut config = AIProviderConfig::new(user.id, body.provider, model_name, encrypted);
    config.is_default = body.is_default;
    config.is_active = body.is_active.unwrap_or(true);
    state
        .store
        .add_provider_config(config.clone())
        .await
        .map_err(store_error)?;

    tracing::info!(user_id = user.id, provider = %config.provider, "Provider configuration created");
    Ok((StatusCode::CREATED, Json(provider_view(&config))))
}

pub async fn get_provider(
    State(state): State<Arc<AppState>>,
    AIUser(user): AIUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .provider_config(user.id, &id)
        .await
        .map(|c| Json(provider_view(&c)))
        .ok_or_else(|| provider_not_found(&id))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProviderRequest {
    pub api_key: Option<String>,
    pub model_name: Option<String>,
    pub is_default: Option<bool>,
    pub is_active: Option<bool>,
}

/// Partial update; a non-empty `api_key` is re-encrypted.
pub async fn update_provider(
    State(state): State<Arc<AppState>>,
    AIUser(user): AIUser,
    Path(id): Path<String>,
    Json(body): Json<UpdateProviderRequest>,
) -> Result<Json<Value>, ApiError> {
    let encrypted = match body.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => Some(encrypt_key(&state, key)?),
        None => None,
    };
    let model_name = body.model_name.filter(|m| !m.trim().is_empty());

    let config = state
        .store
        .update_provider_config(user.id, &id, |c| {
            if let Some(key) = encrypted {
                c.api_key_encrypted = key;
            }
            if let Some(model) = model_name {
                c.model_name = model;
            }
            if let Some(default) = body.is_default {
                c.is_default = default;
            }
            if let Some(active) = body.is_active {
                c.is_active = active;
            }
        })
        .await
        .map_err(store_error)?;
    Ok(Json(provider_view(&config)))
}

pub async fn delete_provider(
    State(state): State<Arc<AppState>>,
    AIUser(user): AIUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .delete_provider_config(user.id, &id)
        .await
        .map_err(store_error)?;
    tracing::info!(user_id = user.id, config_id = %id, "Provider configuration deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// 200 when the provider answered, 400 with its error otherwise.
pub async fn test_provider(
    State(state): State<Arc<AppState>>,
    AIUser(user): AIUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let config = state
        .store
        .provider_config(user.id, &id)
        .await
        .ok_or_else(|| provider_not_found(&id))?;
    let check = state.assistant.test_connection(&config).await;
    let status = if check.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    let body = serde_json::to_value(&check).map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((status, Json(body)))
}

pub async fn set_default_provider(
    State(state): State<Arc<AppState>>,
    AIUser(user): AIUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let config = state
        .store
        .set_default_provider(user.id, &id)
        .await
        .map_err(store_error)?;
    let display = provider_display(&config.provider).unwrap_or(config.provider.as_str());
    Ok(Json(json!({"message": format!("{} set as default", display)})))
}

fn encrypt_key(state: &AppState, api_key: &str) -> Result<String, ApiError> {
    state.assistant.encryption().encrypt(api_key).map_err(|e| {
        tracing::error!(error = %e, "Could not encrypt API key");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Could not store API key")
    })
}

fn provider_not_found(id: &str) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        format!("Provider configuration '{}' not found", id),
    )
}

// ---------------------------------------------------------------------------
// Worker hand-off
// ---------------------------------------------------------------------------

/// Hand the oldest compute task to an external worker and mark it started.
/// 204 when nothing is waiting.
pub async fn claim_task(State(state): State<Arc<AppState>>, AdminUser(worker): AdminUser) -> Response {
    match state.queue.try_next_in(Lane::Compute).await {
        Some(task) => {
            state.queue.mark_started(&task.id).await;
            tracing::info!(task = %task.name, task_id = %task.id, worker = %worker.username, "Task claimed");
            Json(json!(task)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TaskReport {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub progress: Option<Value>,
    pub error: Option<String>,
}

pub async fn report_task(
    State(state): State<Arc<AppState>>,
    AdminUser(_worker): AdminUser,
    Path(id): Path<String>,
    Json(report): Json<TaskReport>,
) -> Result<Json<Value>, ApiError> {
    if state.queue.record(&id).await.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("Task '{}' not found", id)));
    }
    let queue = &state.queue;
    match report.status {
        TaskStatus::Progress => queue.mark_progress(&id, report.progress.unwrap_or(Value::Null)).await,
        TaskStatus::Success => queue.mark_success(&id, report.result.unwrap_or(Value::Null)).await,
        TaskStatus::Failure => {
            queue
                .mark_failure(&id, report.error.unwrap_or_else(|| "Task failed".into()))
                .await
        }
        other => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("Workers cannot report status {}", other.as_str()),
            ))
        }
    }
    let record = queue.status(&id).await;
    Ok(Json(json!({"task_id": record.id, "status": record.status.as_str()})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ErrorKind::ToolNotFound, StatusCode::NOT_FOUND),
            (ErrorKind::Context, StatusCode::BAD_REQUEST),
            (ErrorKind::Validation, StatusCode::BAD_REQUEST),
            (ErrorKind::Value, StatusCode::BAD_REQUEST),
            (ErrorKind::Permission, StatusCode::FORBIDDEN),
            (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
            (ErrorKind::Search, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (kind, status) in cases {
            let result = ToolResult::error_result(kind, "boom", None, true);
            assert_eq!(status_for(&result), status);
        }
        assert_eq!(status_for(&ToolResult::success_result(Map::new())), StatusCode::OK);
    }
}
