use super::extract::extract;
use super::indexer::index_project;
use super::llm::{ModelError, ModelTier};
use super::{ApiError, AppState};
use crate::protocol::{
    ChatRequest, ChatResponse, CompletionRequest, CompletionSuggestion, FixBugRequest,
    FixBugResponse, GenerateRequest, GenerateResponse, HealthComponents, HealthResponse,
    ReindexRequest, ReindexResponse, ServiceInfo,
};
use crate::sanitize::{sanitize_text, validate_length, validate_required, MAX_CONTEXT_CHARS, MAX_PROMPT_CHARS};
use crate::util::{has_parent_traversal, truncate};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::path::Path;
use tracing::{error, info};

pub const SERVICE_NAME: &str = "Cody AI Backend";
/// Suggestions returned by `/completions`
const MAX_SUGGESTIONS: usize = 5;
const SUGGESTION_LABEL_CHARS: usize = 40;

type ApiResult<T> = Result<Json<T>, ApiError>;

fn model_failure(operation: &str, err: ModelError) -> ApiError {
    error!("{}: {}", operation, err);
    ApiError::model(operation, &err)
}

fn sanitize_optional(value: Option<&str>) -> Option<String> {
    value.map(sanitize_text).filter(|v| !v.trim().is_empty())
}

pub async fn root(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        documents_indexed: state.index.count().await,
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let documents = state.index.count().await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        components: Some(HealthComponents {
            vector_index: format!("ok ({} documents)", documents),
            model: state.model.describe(),
        }),
    })
}

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> ApiResult<GenerateResponse> {
    let Json(request) = payload?;
    validate_required("Prompt", &request.prompt, MAX_PROMPT_CHARS).map_err(ApiError::bad_request)?;
    if let Some(context) = &request.context {
        validate_length("Context", context, MAX_CONTEXT_CHARS).map_err(ApiError::bad_request)?;
    }

    let prompt = sanitize_text(&request.prompt);
    let context = sanitize_optional(request.context.as_deref());
    let sections = state
        .prompts
        .build(&prompt, &request.language, context.as_deref())
        .await;
    let code = state
        .model
        .complete(ModelTier::Generate, &sections.into_messages())
        .await
        .map_err(|e| model_failure("Code generation failed", e))?;
    Ok(Json(GenerateResponse { code }))
}

pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<ChatResponse> {
    let Json(mut request) = payload?;
    validate_required("Prompt", &request.prompt, MAX_PROMPT_CHARS).map_err(ApiError::bad_request)?;
    if let Some(context) = &request.context {
        validate_length("Context", context, MAX_CONTEXT_CHARS).map_err(ApiError::bad_request)?;
    }
    if request.current_file.as_deref().is_some_and(has_parent_traversal) {
        return Err(ApiError::bad_request("File path must stay inside the workspace"));
    }

    request.prompt = sanitize_text(&request.prompt);
    request.context = sanitize_optional(request.context.as_deref());
    for message in &mut request.history {
        message.content = sanitize_text(&message.content);
    }

    let messages = state.prompts.build_chat(&request).await;
    let reply = state
        .model
        .complete(ModelTier::Chat, &messages)
        .await
        .map_err(|e| model_failure("Chat failed", e))?;

    if !request.include_code_edits {
        return Ok(Json(ChatResponse {
            response: reply,
            code_edits: None,
        }));
    }
    let extraction = extract(&reply, request.current_file.as_deref());
    Ok(Json(ChatResponse {
        response: extraction.display_text,
        code_edits: Some(extraction.edits),
    }))
}

pub async fn fix_bug(
    State(state): State<AppState>,
    payload: Result<Json<FixBugRequest>, JsonRejection>,
) -> ApiResult<FixBugResponse> {
    let Json(request) = payload?;
    validate_required("Code", &request.code, MAX_PROMPT_CHARS).map_err(ApiError::bad_request)?;
    validate_required("Error message", &request.error_message, MAX_PROMPT_CHARS)
        .map_err(ApiError::bad_request)?;

    let sections = state.prompts.build_fix_bug(
        &sanitize_text(&request.code),
        &sanitize_text(&request.error_message),
        &request.language,
    );
    let fixed_code = state
        .model
        .complete(ModelTier::Generate, &sections.into_messages())
        .await
        .map_err(|e| model_failure("Bug fix failed", e))?;
    Ok(Json(FixBugResponse { fixed_code }))
}

/// Runs the indexer in process. Only one reindex runs at a time.
pub async fn reindex(
    State(state): State<AppState>,
    payload: Result<Json<ReindexRequest>, JsonRejection>,
) -> ApiResult<ReindexResponse> {
    let Json(request) = payload?;
    let raw = request.project_path.trim();
    if raw.is_empty() {
        return Err(ApiError::bad_request("Project path is required"));
    }
    let root = Path::new(raw);
    if !root.exists() {
        return Err(ApiError::bad_request(format!(
            "Project path does not exist: {}",
            raw
        )));
    }
    if !root.is_dir() {
        return Err(ApiError::bad_request(format!(
            "Project path is not a directory: {}",
            raw
        )));
    }

    let Ok(_running) = state.reindex_lock.try_lock() else {
        return Err(ApiError::conflict("A reindex is already running"));
    };

    info!("Reindex requested for {}", raw);
    match tokio::time::timeout(state.reindex_timeout, index_project(root, state.index.as_ref())).await {
        Ok(Ok(report)) => Ok(Json(ReindexResponse {
            message: "Project reindexed successfully".to_string(),
            output: report.summary(),
        })),
        Ok(Err(err)) => {
            error!("Indexing failed: {}", err);
            Err(ApiError::internal(format!("Indexing failed: {}", err)))
        }
        Err(_) => Err(ApiError::internal(format!(
            "Indexing failed: timed out after {}s",
            state.reindex_timeout.as_secs()
        ))),
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionEnvelope {
    pub success: bool,
    pub data: Vec<CompletionSuggestion>,
}

pub async fn completions(
    State(state): State<AppState>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> ApiResult<CompletionEnvelope> {
    let Json(request) = payload?;
    validate_length("Context", &request.context, MAX_CONTEXT_CHARS).map_err(ApiError::bad_request)?;

    let sections = state.prompts.build_completions(
        &sanitize_text(&request.context),
        &request.language,
        &sanitize_text(&request.prefix),
    );
    let reply = state
        .model
        .complete(ModelTier::Chat, &sections.into_messages())
        .await
        .map_err(|e| model_failure("Completion failed", e))?;

    Ok(Json(CompletionEnvelope {
        success: true,
        data: parse_suggestions(&reply),
    }))
}

/// One suggestion per non-empty reply line, fences dropped, duplicates removed.
fn parse_suggestions(reply: &str) -> Vec<CompletionSuggestion> {
    let mut out: Vec<CompletionSuggestion> = Vec::new();
    for line in reply.lines() {
        let text = line.trim_end();
        if text.trim().is_empty() || text.trim_start().starts_with("```") {
            continue;
        }
        if out.iter().any(|s| s.text == text) {
            continue;
        }
        out.push(CompletionSuggestion {
            text: text.to_string(),
            label: truncate(text.trim(), SUGGESTION_LABEL_CHARS),
        });
        if out.len() == MAX_SUGGESTIONS {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatMessage;
    use crate::server::llm::{LanguageModel, Message};
    use crate::server::vector::tests::LetterEmbedder;
    use crate::server::vector::LocalVectorIndex;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeModel {
        reply: String,
        failure: Option<ModelError>,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl FakeModel {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                ..Self::default()
            })
        }

        fn failing(err: ModelError) -> Arc<Self> {
            Arc::new(Self {
                failure: Some(err),
                ..Self::default()
            })
        }

        fn last_prompt(&self) -> Vec<Message> {
            self.seen.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        async fn complete(&self, _tier: ModelTier, messages: &[Message]) -> Result<String, ModelError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            match &self.failure {
                Some(err) => Err(err.clone()),
                None => Ok(self.reply.clone()),
            }
        }
    }

    fn state_with(model: Arc<FakeModel>) -> AppState {
        let index = Arc::new(LocalVectorIndex::in_memory(Arc::new(LetterEmbedder::default())));
        AppState::new(model, index, Vec::new())
    }

    fn generate_body(prompt: &str) -> Result<Json<GenerateRequest>, JsonRejection> {
        Ok(Json(GenerateRequest {
            prompt: prompt.to_string(),
            language: "python".to_string(),
            context: Some("def hello():\n    print('hello')".to_string()),
        }))
    }

    #[tokio::test]
    async fn test_generate_returns_model_code() {
        let model = FakeModel::replying("def hello():\n    return 'hi'");
        let state = state_with(model.clone());
        let Json(out) = generate(State(state), generate_body("Refactor this function"))
            .await
            .unwrap();
        assert_eq!(out.code, "def hello():\n    return 'hi'");
        let prompt = model.last_prompt();
        assert!(prompt[0].content.contains("expert python programmer"));
        assert!(prompt[1].content.contains("current selection"));
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_prompt() {
        let state = state_with(FakeModel::replying("x"));
        let err = generate(State(state), generate_body("  ")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.detail.contains("Prompt is required"));
    }

    #[tokio::test]
    async fn test_generate_model_errors_map_to_status() {
        let state = state_with(FakeModel::failing(ModelError::InvalidRequest("boom".into())));
        let err = generate(State(state), generate_body("write")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.detail.starts_with("Code generation failed"));

        let state = state_with(FakeModel::failing(ModelError::RateLimited("slow".into())));
        let err = generate(State(state), generate_body("write")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.detail.starts_with("Code generation failed"));
    }

    #[tokio::test]
    async fn test_explain_prompt_uses_explainer() {
        let model = FakeModel::replying("Purpose: ...");
        let state = state_with(model.clone());
        generate(State(state), generate_body("Please explain this code"))
            .await
            .unwrap();
        assert!(model.last_prompt()[0].content.contains("code explainer"));
    }

    fn chat_body(include_code_edits: bool, history: usize) -> Result<Json<ChatRequest>, JsonRejection> {
        Ok(Json(ChatRequest {
            prompt: "How can I improve this code?".into(),
            language: "python".into(),
            context: Some("def add(a, b):\n    return a + b".into()),
            history: (0..history).map(|i| ChatMessage::user(format!("Message {i}"))).collect(),
            include_code_edits,
            current_file: Some("main.py".into()),
        }))
    }

    #[tokio::test]
    async fn test_chat_extracts_edits_when_requested() {
        let reply = "Add type hints:\n\n```edit:\ndef add(a: int, b: int) -> int:\n    return a + b\n```\n\nDone.";
        let state = state_with(FakeModel::replying(reply));
        let Json(out) = chat(State(state), chat_body(true, 1)).await.unwrap();
        let edits = out.code_edits.unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].file, "main.py");
        assert!(!out.response.contains("def add"));
        assert!(out.response.contains("Done."));
    }

    #[tokio::test]
    async fn test_chat_without_edits_passes_reply_through() {
        let reply = "```edit:x.py\nx = 1\n```";
        let state = state_with(FakeModel::replying(reply));
        let Json(out) = chat(State(state), chat_body(false, 0)).await.unwrap();
        assert_eq!(out.response, reply);
        assert!(out.code_edits.is_none());
    }

    #[tokio::test]
    async fn test_chat_truncates_long_history() {
        let model = FakeModel::replying("ok");
        let state = state_with(model.clone());
        chat(State(state), chat_body(false, 15)).await.unwrap();
        // system + 10 history + new turn
        assert_eq!(model.last_prompt().len(), 12);
    }

    #[tokio::test]
    async fn test_chat_failure_is_prefixed() {
        let state = state_with(FakeModel::failing(ModelError::Unavailable("down".into())));
        let err = chat(State(state), chat_body(false, 0)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.detail.starts_with("Chat failed"));
    }

    #[tokio::test]
    async fn test_fix_bug_validation_and_failure() {
        let state = state_with(FakeModel::replying("fixed"));
        let body = |error: &str| {
            Ok(Json(FixBugRequest {
                code: "x = 1/0".into(),
                error_message: error.into(),
                language: "python".into(),
            }))
        };
        let err = fix_bug(State(state.clone()), body("")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.detail.contains("Error message is required"));

        let Json(out) = fix_bug(State(state), body("ZeroDivisionError")).await.unwrap();
        assert_eq!(out.fixed_code, "fixed");

        let state = state_with(FakeModel::failing(ModelError::InvalidRequest("bad".into())));
        let err = fix_bug(State(state), body("ZeroDivisionError")).await.unwrap_err();
        assert!(err.detail.starts_with("Bug fix failed"));
    }

    fn reindex_body(path: &str) -> Result<Json<ReindexRequest>, JsonRejection> {
        Ok(Json(ReindexRequest {
            project_path: path.to_string(),
        }))
    }

    #[tokio::test]
    async fn test_reindex_indexes_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print('hi')").unwrap();
        let state = state_with(FakeModel::replying("x"));
        let Json(out) = reindex(State(state.clone()), reindex_body(&dir.path().to_string_lossy()))
            .await
            .unwrap();
        assert_eq!(out.message, "Project reindexed successfully");
        assert!(out.output.contains("Indexed 1 file"));
        let Json(info) = root(State(state)).await;
        assert_eq!(info.documents_indexed, 1);
    }

    #[tokio::test]
    async fn test_reindex_rejects_missing_path() {
        let state = state_with(FakeModel::replying("x"));
        let err = reindex(State(state), reindex_body("/nonexistent/path")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.detail.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_concurrent_reindex_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(FakeModel::replying("x"));
        let _held = state.reindex_lock.clone().try_lock_owned().unwrap();
        let err = reindex(State(state), reindex_body(&dir.path().to_string_lossy()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_reindex_timeout_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "a = 1").unwrap();
        let mut state = state_with(FakeModel::replying("x"));
        state.reindex_timeout = Duration::ZERO;
        let err = reindex(State(state), reindex_body(&dir.path().to_string_lossy()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.detail.starts_with("Indexing failed"));
    }

    #[tokio::test]
    async fn test_completions_wrap_suggestions() {
        let state = state_with(FakeModel::replying(
            "```\nprintln!(\"a\");\nprintln!(\"b\");\n\nprintln!(\"a\");\n```",
        ));
        let body = Ok(Json(CompletionRequest {
            context: "fn main() {".into(),
            language: "rust".into(),
            prefix: "print".into(),
        }));
        let Json(out) = completions(State(state), body).await.unwrap();
        assert!(out.success);
        let texts: Vec<&str> = out.data.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["println!(\"a\");", "println!(\"b\");"]);
    }

    #[test]
    fn test_parse_suggestions_caps_count() {
        let reply = (0..10).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let parsed = parse_suggestions(&reply);
        assert_eq!(parsed.len(), MAX_SUGGESTIONS);
        assert_eq!(parsed[0].label, "line0");
    }

    #[tokio::test]
    async fn test_health_and_root_report_components() {
        let state = state_with(FakeModel::replying("x"));
        let Json(health) = health(State(state.clone())).await;
        assert_eq!(health.status, "healthy");
        assert!(health.components.is_some());
        let Json(info) = root(State(state)).await;
        assert_eq!(info.service, SERVICE_NAME);
        assert_eq!(info.documents_indexed, 0);
    }
}
