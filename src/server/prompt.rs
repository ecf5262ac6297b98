//! Retrieval-augmented prompt assembly
//!
//! Retrieval is an enhancement: when the index is empty or a query fails the
//! prompt is built from the system instruction and explicit context alone.

use super::llm::Message;
use super::vector::VectorIndex;
use crate::protocol::{ChatMessage, ChatRequest, Role};
use crate::util::truncate;
use std::sync::Arc;
use tracing::{debug, warn};

/// Number of indexed snippets pulled into a prompt
pub const RETRIEVAL_K: usize = 3;
/// Only the most recent chat messages are replayed to the model
pub const MAX_HISTORY_MESSAGES: usize = 10;
/// Per-snippet ceiling, in characters
const MAX_SNIPPET_CHARS: usize = 4_000;

const SEPARATOR: &str = "\n---\n";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PromptSections {
    pub system: String,
    pub user: String,
    /// Snippets that made it into `user`, for logging and tests
    pub retrieved: Vec<String>,
}

impl PromptSections {
    pub fn into_messages(self) -> Vec<Message> {
        vec![Message::system(self.system), Message::user(self.user)]
    }
}

fn generate_instruction(language: &str) -> String {
    format!(
        "You are an expert {} programmer. Write clean, elegant, and efficient code. \
         Do not include any explanations or markdown formatting, just the raw code.",
        language
    )
}

const EXPLAIN_INSTRUCTION: &str = "You are an expert code explainer. Provide a clear, concise, and \
easy-to-understand explanation of the code. Structure your answer with clear headings for \
'Purpose', 'Inputs', and 'Outputs'. Do not return any code or markdown formatting.";

fn chat_instruction(language: &str) -> String {
    format!(
        "You are Cody, an AI coding assistant. The user is working in {}. \
         Answer precisely and keep explanations short.",
        language
    )
}

fn edit_format_instruction(current_file: Option<&str>) -> String {
    let target = match current_file {
        Some(file) => format!(" (currently {})", file),
        None => String::new(),
    };
    format!(
        "When you change a file, put its complete new content in a block that opens with \
         ```edit:<workspace-relative path> on its own line and closes with ```. \
         Leave the path empty to edit the file the user has open{}. \
         Do not nest other fenced blocks inside an edit block.",
        target
    )
}

fn fix_instruction(language: &str) -> String {
    format!(
        "You are an expert {} debugger. Find the cause of the error and return only the \
         corrected code, with no explanations or markdown formatting.",
        language
    )
}

fn completion_instruction(language: &str) -> String {
    format!(
        "You are a code completion engine for {}. Reply with up to 5 alternative \
         continuations of the code, one per line, with no numbering, explanations or markdown.",
        language
    )
}

/// Whether the request asks for an explanation rather than code.
pub fn wants_explanation(prompt: &str) -> bool {
    prompt.to_lowercase().contains("explain")
}

pub struct PromptBuilder {
    index: Option<Arc<dyn VectorIndex>>,
    k: usize,
}

impl PromptBuilder {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self {
            index: Some(index),
            k: RETRIEVAL_K,
        }
    }

    /// Builder with retrieval switched off
    pub fn without_index() -> Self {
        Self { index: None, k: 0 }
    }

    async fn retrieve(&self, query: &str) -> Vec<String> {
        let Some(index) = &self.index else {
            return Vec::new();
        };
        match index.query(query, self.k).await {
            Ok(hits) => {
                debug!("Retrieved {} snippet(s) for prompt", hits.len());
                hits.into_iter()
                    .map(|hit| {
                        format!(
                            "// {}\n{}",
                            hit.document.path(),
                            truncate(&hit.document.text, MAX_SNIPPET_CHARS)
                        )
                    })
                    .collect()
            }
            Err(err) => {
                warn!("Vector index query failed, continuing without it: {}", err);
                Vec::new()
            }
        }
    }

    /// Generation prompt: system instruction, then retrieved snippets, the
    /// current selection and finally the request itself.
    pub async fn build(
        &self,
        prompt: &str,
        language: &str,
        explicit_context: Option<&str>,
    ) -> PromptSections {
        let retrieved = self.retrieve(prompt).await;
        let system = if wants_explanation(prompt) {
            EXPLAIN_INSTRUCTION.to_string()
        } else {
            generate_instruction(language)
        };
        let user = assemble_user(
            &retrieved,
            explicit_context,
            &format!("Please fulfill the following request: {}", prompt),
        );
        PromptSections {
            system,
            user,
            retrieved,
        }
    }

    /// Chat prompt: system instruction (plus the edit protocol when edits
    /// are requested), the last [`MAX_HISTORY_MESSAGES`] messages, then the
    /// new turn with retrieved and explicit context.
    pub async fn build_chat(&self, request: &ChatRequest) -> Vec<Message> {
        let mut system = chat_instruction(&request.language);
        if request.include_code_edits {
            system.push_str("\n\n");
            system.push_str(&edit_format_instruction(request.current_file.as_deref()));
        }

        let retrieved = self.retrieve(&request.prompt).await;
        let user = assemble_user(&retrieved, request.context.as_deref(), &request.prompt);

        let mut messages = Vec::with_capacity(MAX_HISTORY_MESSAGES + 2);
        messages.push(Message::system(system));
        messages.extend(recent_history(&request.history).map(|m| match m.role {
            Role::User => Message::user(m.content.clone()),
            Role::Assistant => Message::assistant(m.content.clone()),
        }));
        messages.push(Message::user(user));
        messages
    }

    pub fn build_fix_bug(&self, code: &str, error_message: &str, language: &str) -> PromptSections {
        PromptSections {
            system: fix_instruction(language),
            user: format!(
                "This {} code fails with the following error:\n\n{}\n\nCode:{}{}{}",
                language, error_message, SEPARATOR, code, SEPARATOR
            ),
            retrieved: Vec::new(),
        }
    }

    pub fn build_completions(&self, context: &str, language: &str, prefix: &str) -> PromptSections {
        let mut user = format!("Code before the cursor:{}{}{}", SEPARATOR, context, SEPARATOR);
        if !prefix.is_empty() {
            user.push_str(&format!("\nThe completion must start with: {}", prefix));
        }
        PromptSections {
            system: completion_instruction(language),
            user,
            retrieved: Vec::new(),
        }
    }
}

fn recent_history(history: &[ChatMessage]) -> impl Iterator<Item = &ChatMessage> {
    let skip = history.len().saturating_sub(MAX_HISTORY_MESSAGES);
    history.iter().skip(skip)
}

fn assemble_user(retrieved: &[String], explicit_context: Option<&str>, instruction: &str) -> String {
    let mut parts = Vec::with_capacity(3);
    if !retrieved.is_empty() {
        parts.push(format!(
            "Given the following relevant codebase context:{}{}{}",
            SEPARATOR,
            retrieved.join(SEPARATOR),
            SEPARATOR.trim_end()
        ));
    }
    if let Some(context) = explicit_context.filter(|c| !c.trim().is_empty()) {
        parts.push(format!(
            "And given this current selection:{}{}{}",
            SEPARATOR,
            context,
            SEPARATOR.trim_end()
        ));
    }
    parts.push(instruction.to_string());
    parts.join("\n\n")
}
