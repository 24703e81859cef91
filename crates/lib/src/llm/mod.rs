//! AI assistance for task creation: rewrite a free-form request as a task, transcribe audio.
//!
//! The hosted API is OpenAI-compatible (chat completions + audio transcriptions).

mod openai;

pub use openai::OpenAiClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("ai request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ai api error: {0}")]
    Api(String),
    #[error("ai returned an unusable answer: {0}")]
    Malformed(String),
}

/// Request rewritten as a task: title, full description, optional deadline (`DD/MM/YYYY`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovedTask {
    #[serde(alias = "titulo")]
    pub title: String,
    #[serde(alias = "detalhe")]
    pub body: String,
    #[serde(default, alias = "prazo")]
    pub deadline: Option<String>,
}

impl ImprovedTask {
    /// Task used when the assistant cannot be reached or answers garbage: default title, raw text.
    pub fn fallback(default_title: &str, raw: &str) -> Self {
        Self {
            title: default_title.to_string(),
            body: raw.to_string(),
            deadline: None,
        }
    }

    /// Parse the assistant's JSON answer, tolerating a surrounding code fence.
    pub fn from_answer(answer: &str) -> Result<Self, AiError> {
        let trimmed = answer.trim();
        let json = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|s| s.strip_suffix("```"))
            .unwrap_or(trimmed)
            .trim();
        let task: ImprovedTask = serde_json::from_str(json).map_err(|e| AiError::Malformed(e.to_string()))?;
        if task.title.trim().is_empty() && task.body.trim().is_empty() {
            return Err(AiError::Malformed("empty title and body".to_string()));
        }
        Ok(task)
    }
}

#[async_trait]
pub trait AiAssistant: Send + Sync {
    async fn improve_description(&self, raw: &str) -> Result<ImprovedTask, AiError>;

    /// Transcribe an audio file; `file_name` carries the container extension (e.g. `.ogg`).
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String, AiError>;
}
