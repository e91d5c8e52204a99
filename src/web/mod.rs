// Aglogen Assistant — HTTP API (Axum)
//
// JSON endpoints for the tool catalog, tool execution, knowledge search,
// provider settings and the assistant chat loop, plus the hand-off used by
// external compute workers. Every route except /health/ takes a bearer token.

pub mod handlers;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::assistant::AIService;
use crate::config::Config;
use crate::queue::TaskQueue;
use crate::rag::RAGSearchService;
use crate::store::Store;
use crate::tool::ToolRegistry;

/// Shared state for web handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub registry: ToolRegistry,
    pub search: RAGSearchService,
    pub queue: TaskQueue,
    pub assistant: AIService,
    pub config: Config,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);
    Router::new()
        .route("/health/", get(handlers::health))
        .route("/tools/", get(handlers::list_tools))
        .route("/tools/{name}/execute/", post(handlers::execute_tool))
        .route("/rag/search/", get(handlers::rag_search))
        .route("/chat/", post(handlers::chat))
        .route("/providers/", get(handlers::list_providers).post(handlers::create_provider))
        .route(
            "/providers/{id}/",
            get(handlers::get_provider)
                .patch(handlers::update_provider)
                .delete(handlers::delete_provider),
        )
        .route("/providers/{id}/test_connection/", post(handlers::test_provider))
        .route("/providers/{id}/set_default/", post(handlers::set_default_provider))
        .route("/worker/tasks/claim/", post(handlers::claim_task))
        .route("/worker/tasks/{id}/", post(handlers::report_task))
        .layer(cors)
        .with_state(state)
}

/// An empty list or `*` allows any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn start_server(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    tracing::info!(addr = %addr, "Starting HTTP API server");
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}
