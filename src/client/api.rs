//! Typed backend API
//!
//! Every call validates its input locally, then goes through the
//! [`RequestOrchestrator`] so caching, coalescing and retries apply uniformly.

use super::orchestrator::{CachePolicy, ConnectivityProbe, RequestOrchestrator};
use super::outcome::RequestOutcome;
use super::session::ChatSession;
use crate::config::ClientSettings;
use crate::error::RequestError;
use crate::protocol::{
    ChatRequest, ChatResponse, CompletionRequest, CompletionSuggestion, FixBugRequest,
    FixBugResponse, GenerateRequest, GenerateResponse, HealthResponse, ReindexRequest,
    ReindexResponse,
};
use crate::sanitize::{validate_length, validate_required, MAX_CONTEXT_CHARS, MAX_PROMPT_CHARS};
use crate::util::{has_parent_traversal, truncate};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const GENERATE_TTL: Duration = Duration::from_secs(15 * 60);
pub const FIX_BUG_TTL: Duration = Duration::from_secs(15 * 60);
pub const COMPLETIONS_TTL: Duration = Duration::from_secs(5 * 60);

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// The backend allows an indexing run 300 s; leave room for the response.
const REINDEX_TIMEOUT: Duration = Duration::from_secs(310);

/// `GET /health` with a short timeout. Any HTTP answer counts as reachable;
/// only a transport failure means the backend is down.
pub struct HealthProbe {
    http: reqwest::Client,
}

impl HealthProbe {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ConnectivityProbe for HealthProbe {
    async fn is_reachable(&self, base_url: &str) -> bool {
        let url = format!("{}/health", base_url);
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(_) => true,
            Err(err) => {
                debug!("health probe to {} failed: {}", url, err);
                false
            }
        }
    }
}

/// Per-turn chat options; the history comes from the [`ChatSession`].
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub language: String,
    pub context: Option<String>,
    pub include_code_edits: bool,
    pub current_file: Option<String>,
}

type RequestFn = Box<dyn Fn() -> BoxFuture<'static, Result<Value, RequestError>> + Send + Sync>;

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    orchestrator: RequestOrchestrator,
}

impl BackendClient {
    pub fn new(settings: ClientSettings) -> Self {
        let http = reqwest::Client::new();
        let probe = Arc::new(HealthProbe::new(http.clone()));
        Self {
            orchestrator: RequestOrchestrator::new(settings, probe),
            http,
        }
    }

    pub fn with_orchestrator(http: reqwest::Client, orchestrator: RequestOrchestrator) -> Self {
        Self { http, orchestrator }
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    pub fn reconfigure(&self, settings: ClientSettings) {
        self.orchestrator.reconfigure(settings);
    }

    pub async fn generate(&self, request: &GenerateRequest) -> RequestOutcome<GenerateResponse> {
        let prepared = validate_generate(request).and_then(|_| to_body(request));
        let body = match prepared {
            Ok(body) => body,
            Err(err) => return RequestOutcome::failure(err),
        };
        let call = self.call(Method::POST, "/generate", Some(body.clone()), None);
        self.orchestrator
            .execute_with_timeout("generate", &body, CachePolicy::Cache(GENERATE_TTL), call)
            .await
            .and_then(decode)
    }

    /// One chat turn. On success the exchange is appended to `session`; a
    /// failure leaves the session as it was.
    pub async fn chat(
        &self,
        session: &mut ChatSession,
        prompt: &str,
        options: &ChatOptions,
    ) -> RequestOutcome<ChatResponse> {
        let request = ChatRequest {
            prompt: prompt.to_string(),
            language: options.language.clone(),
            context: options.context.clone(),
            history: session.messages().to_vec(),
            include_code_edits: options.include_code_edits,
            current_file: options.current_file.clone(),
        };
        let body = match validate_chat(&request).and_then(|_| to_body(&request)) {
            Ok(body) => body,
            Err(err) => return RequestOutcome::failure(err),
        };
        let call = self.call(Method::POST, "/chat", Some(body.clone()), None);
        let outcome: RequestOutcome<ChatResponse> = self
            .orchestrator
            .execute_with_timeout("chat", &body, CachePolicy::NoCache, call)
            .await
            .and_then(decode);
        if let RequestOutcome::Success { data } = &outcome {
            session.record_exchange(prompt, &data.response);
        }
        outcome
    }

    pub async fn fix_bug(&self, request: &FixBugRequest) -> RequestOutcome<FixBugResponse> {
        let body = match validate_fix_bug(request).and_then(|_| to_body(request)) {
            Ok(body) => body,
            Err(err) => return RequestOutcome::failure(err),
        };
        let call = self.call(Method::POST, "/fix-bug", Some(body.clone()), None);
        self.orchestrator
            .execute_with_timeout("fix-bug", &body, CachePolicy::Cache(FIX_BUG_TTL), call)
            .await
            .and_then(decode)
    }

    /// Not raced against `requestTimeout`: a full reindex routinely outlives it.
    pub async fn reindex(&self, project_path: &str) -> RequestOutcome<ReindexResponse> {
        let request = ReindexRequest {
            project_path: project_path.to_string(),
        };
        let body = match validate_reindex(&request).and_then(|_| to_body(&request)) {
            Ok(body) => body,
            Err(err) => return RequestOutcome::failure(err),
        };
        let call = self.call(Method::POST, "/reindex", Some(body.clone()), Some(REINDEX_TIMEOUT));
        self.orchestrator
            .execute("reindex", &body, CachePolicy::NoCache, call)
            .await
            .and_then(decode)
    }

    pub async fn health(&self) -> RequestOutcome<HealthResponse> {
        let call = self.call(Method::GET, "/health", None, None);
        self.orchestrator
            .execute_with_timeout("health", &Value::Null, CachePolicy::NoCache, call)
            .await
            .and_then(decode)
    }

    pub async fn completions(
        &self,
        request: &CompletionRequest,
    ) -> RequestOutcome<Vec<CompletionSuggestion>> {
        let prepared = validate_length("Context", &request.context, MAX_CONTEXT_CHARS)
            .map_err(RequestError::Validation)
            .and_then(|_| to_body(request));
        let body = match prepared {
            Ok(body) => body,
            Err(err) => return RequestOutcome::failure(err),
        };
        let call = self.call(Method::POST, "/completions", Some(body.clone()), None);
        self.orchestrator
            .execute_with_timeout(
                "completions",
                &body,
                CachePolicy::Cache(COMPLETIONS_TTL),
                call,
            )
            .await
            .and_then(decode)
    }

    /// Build the request closure. The URL and per-attempt timeout are fixed
    /// from the settings current at call time.
    fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        timeout: Option<Duration>,
    ) -> RequestFn {
        let settings = self.orchestrator.settings();
        let url = format!("{}{}", settings.backend_url, path);
        let timeout = timeout.unwrap_or_else(|| settings.timeout());
        let http = self.http.clone();
        Box::new(move || {
            send_json(http.clone(), method.clone(), url.clone(), body.clone(), timeout).boxed()
        })
    }
}

async fn send_json(
    http: reqwest::Client,
    method: Method,
    url: String,
    body: Option<Value>,
    timeout: Duration,
) -> Result<Value, RequestError> {
    let mut builder = http.request(method, &url).timeout(timeout);
    if let Some(body) = &body {
        builder = builder.json(body);
    }
    let response = builder.send().await?;
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(RequestError::from_status(status.as_u16(), error_detail(&text)));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| {
        RequestError::InvalidResponse(format!("{} (body: {})", e, truncate(&text, 200)))
    })
}

/// Pull the human-readable message out of an error body (`detail`, then
/// `error`), falling back to the raw text.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| truncate(body.trim(), 300))
}

fn to_body<T: Serialize>(request: &T) -> Result<Value, RequestError> {
    serde_json::to_value(request)
        .map_err(|e| RequestError::Validation(format!("could not encode request: {}", e)))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RequestError> {
    serde_json::from_value(value).map_err(|e| RequestError::InvalidResponse(e.to_string()))
}

fn validate_context(context: Option<&str>) -> Result<(), RequestError> {
    match context {
        Some(ctx) => validate_length("Context", ctx, MAX_CONTEXT_CHARS).map_err(RequestError::Validation),
        None => Ok(()),
    }
}

fn validate_generate(request: &GenerateRequest) -> Result<(), RequestError> {
    validate_required("Prompt", &request.prompt, MAX_PROMPT_CHARS)
        .map_err(RequestError::Validation)?;
    validate_context(request.context.as_deref())
}

fn validate_chat(request: &ChatRequest) -> Result<(), RequestError> {
    validate_required("Prompt", &request.prompt, MAX_PROMPT_CHARS)
        .map_err(RequestError::Validation)?;
    validate_context(request.context.as_deref())?;
    if let Some(file) = &request.current_file {
        if has_parent_traversal(file) {
            return Err(RequestError::Validation(format!(
                "File path must stay inside the workspace: {}",
                file
            )));
        }
    }
    Ok(())
}

fn validate_fix_bug(request: &FixBugRequest) -> Result<(), RequestError> {
    validate_required("Code", &request.code, MAX_PROMPT_CHARS).map_err(RequestError::Validation)?;
    validate_required("Error message", &request.error_message, MAX_PROMPT_CHARS)
        .map_err(RequestError::Validation)
}

fn validate_reindex(request: &ReindexRequest) -> Result<(), RequestError> {
    if request.project_path.trim().is_empty() {
        return Err(RequestError::Validation("Project path is required".to_string()));
    }
    if has_parent_traversal(&request.project_path) {
        return Err(RequestError::Validation(format!(
            "Project path must not contain '..': {}",
            request.project_path
        )));
    }
    Ok(())
}
