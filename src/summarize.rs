//! Note summarization for the local backend.
//!
//! Follows the hosted `summarizeNote` function: the caller must be signed in
//! and own the note, the summary comes from an OpenAI-compatible chat
//! completion, and the result is written back onto the note as `aiSummary`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::backend::local::Repo;
use crate::backend::Summarizer;
use crate::config::LlmConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::model::{NotePatch, User};

const SYSTEM_PROMPT: &str = "You are a concise study assistant.";
const EMPTY_SUMMARY: &str = "No summary.";

/// A single-turn chat completion.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Deserialize)]
struct OpenAiError {
    message: String,
}

pub struct OpenAiCompletion {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

impl OpenAiCompletion {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: config.api_key(),
        })
    }
}

#[async_trait]
impl Completion for OpenAiCompletion {
    async fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let message = response
                .json::<OpenAiErrorResponse>()
                .await
                .map(|body| body.error.message)
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Completion returned {}: {}", status, message);
        }

        let result: ChatCompletionResponse = response.json().await?;
        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        tracing::debug!("Completion finished, {} chars", content.len());
        Ok(content)
    }
}

fn build_prompt(title: &str, content: &str) -> String {
    format!(
        "Summarize this study note clearly in 5-7 lines at most.\nTitle: {}\nContent: {}",
        title, content
    )
}

pub struct LocalSummarizer {
    repo: Repo,
    caller: watch::Receiver<Option<User>>,
    llm: Arc<dyn Completion>,
}

impl LocalSummarizer {
    pub fn new(repo: Repo, caller: watch::Receiver<Option<User>>, llm: Arc<dyn Completion>) -> Self {
        Self { repo, caller, llm }
    }
}

#[async_trait]
impl Summarizer for LocalSummarizer {
    async fn summarize(&self, note_id: &str) -> ServiceResult<String> {
        let caller = self.caller.borrow().clone();
        let Some(user) = caller else {
            return Err(ServiceError::Unauthenticated(
                "You must be signed in.".to_string(),
            ));
        };
        if note_id.trim().is_empty() {
            return Err(ServiceError::InvalidArgument("Missing noteId.".to_string()));
        }

        let note = self
            .repo
            .get_note(note_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ServiceError::NotFound("Note not found.".to_string()))?;
        if note.uid != user.uid {
            return Err(ServiceError::PermissionDenied("Access denied.".to_string()));
        }

        let reply = self
            .llm
            .complete(SYSTEM_PROMPT, &build_prompt(&note.title, &note.content))
            .await
            .map_err(|e| {
                tracing::error!("summarize {}: completion failed: {:#}", note_id, e);
                internal(e)
            })?;
        let summary = match reply.trim() {
            "" => EMPTY_SUMMARY.to_string(),
            text => text.to_string(),
        };

        self.repo
            .update_note(note_id, NotePatch::summary(summary.clone()))
            .await
            .map_err(internal)?;
        Ok(summary)
    }
}

fn internal(err: impl std::fmt::Display) -> ServiceError {
    tracing::error!("summarize: {}", err);
    ServiceError::Internal("Summarization service failed.".to_string())
}
