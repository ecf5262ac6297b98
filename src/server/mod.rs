//! HTTP backend: prompt assembly, retrieval, code-edit extraction and the
//! axum routes that tie them to a language model.

pub mod extract;
pub mod handlers;
pub mod indexer;
pub mod llm;
pub mod prompt;
pub mod vector;

use crate::config::ServerConfig;
use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_REQUEST_HEADERS, ORIGIN, VARY,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use llm::{LanguageModel, ModelError, OpenAiChatModel};
use prompt::PromptBuilder;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use vector::{LocalVectorIndex, OpenAiEmbedder, VectorIndex};

/// Upper bound on one in-process reindex
pub const REINDEX_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn LanguageModel>,
    pub index: Arc<dyn VectorIndex>,
    pub prompts: Arc<PromptBuilder>,
    /// Held for the duration of a reindex
    pub reindex_lock: Arc<Mutex<()>>,
    pub reindex_timeout: Duration,
    pub cors_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        index: Arc<dyn VectorIndex>,
        cors_origins: Vec<String>,
    ) -> Self {
        Self {
            model,
            prompts: Arc::new(PromptBuilder::new(index.clone())),
            index,
            reindex_lock: Arc::new(Mutex::new(())),
            reindex_timeout: REINDEX_TIMEOUT,
            cors_origins: Arc::new(cors_origins),
        }
    }

    fn allows_origin(&self, origin: &str) -> bool {
        self.cors_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed.trim_end_matches('/') == origin)
    }
}

/// Error body is always `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }

    /// Provider throttling or outage is a 503; anything else is a 500.
    pub fn model(operation: &str, err: &ModelError) -> Self {
        let status = match err {
            ModelError::RateLimited(_) | ModelError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ModelError::InvalidRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, format!("{}: {}", operation, err))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

fn apply_cors(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        headers.insert(VARY, HeaderValue::from_static("Origin"));
    }
}

/// Echo allowed origins and answer preflight requests directly.
async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|origin| state.allows_origin(origin))
        .map(str::to_string);

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        if let Some(origin) = &origin {
            // `*` is taken literally on credentialed requests; echo the ask.
            let requested = request
                .headers()
                .get(ACCESS_CONTROL_REQUEST_HEADERS)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("content-type"));
            let headers = response.headers_mut();
            apply_cors(headers, origin);
            headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested);
            headers.append(VARY, HeaderValue::from_static("Access-Control-Request-Headers"));
        }
        return response;
    }

    let mut response = next.run(request).await;
    if let Some(origin) = &origin {
        apply_cors(response.headers_mut(), origin);
    }
    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/generate", post(handlers::generate))
        .route("/chat", post(handlers::chat))
        .route("/fix-bug", post(handlers::fix_bug))
        .route("/reindex", post(handlers::reindex))
        .route("/completions", post(handlers::completions))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

/// Build the production state from config: OpenAI chat model plus the
/// on-disk index.
pub fn state_from_config(config: &ServerConfig) -> anyhow::Result<AppState> {
    let model = OpenAiChatModel::from_config(config)?;
    let embedder = OpenAiEmbedder::from_config(config).context("embedding client unavailable")?;
    let index = LocalVectorIndex::open(&config.index_path, Arc::new(embedder))
        .with_context(|| format!("failed to open index at {}", config.index_path.display()))?;
    Ok(AppState::new(
        Arc::new(model),
        Arc::new(index),
        config.cors_origins.clone(),
    ))
}

pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let state = state_from_config(&config)?;
    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    info!(
        "Cody backend listening on {} ({} documents indexed)",
        address,
        state.index.count().await
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
}
