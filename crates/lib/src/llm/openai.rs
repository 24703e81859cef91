//! OpenAI-compatible client: POST /chat/completions and POST /audio/transcriptions.

use crate::llm::{AiAssistant, AiError, ImprovedTask};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const SYSTEM_PROMPT: &str = "You turn a customer's free-form request into a task card for a support team. \
Write the description as a user story from the customer's point of view \
(\"As a customer I would like ... so that ...\"), keeping every concrete detail the customer gave. \
Answer with a single JSON object and nothing else, with the fields \"title\" (short summary), \
\"body\" (the full story) and \"deadline\" (DD/MM/YYYY, or null when the request implies none).";

#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    transcription_model: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: Option<String>, chat_model: &str, transcription_model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            chat_model: chat_model.to_string(),
            transcription_model: transcription_model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response, AiError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AiError::Api(format!("{} {}", status, body)));
        }
        Ok(res)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    typ: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl AiAssistant for OpenAiClient {
    async fn improve_description(&self, raw: &str) -> Result<ImprovedTask, AiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let today = chrono::Local::now().date_naive().format("%d/%m/%Y");
        let body = ChatRequest {
            model: &self.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: format!("{} Today is {}.", SYSTEM_PROMPT, today),
                },
                ChatMessage {
                    role: "user",
                    content: raw.to_string(),
                },
            ],
            response_format: ResponseFormat { typ: "json_object" },
        };
        let res = self.authorize(self.client.post(&url)).json(&body).send().await?;
        let data: ChatResponse = Self::check(res).await?.json().await?;
        let answer = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AiError::Malformed("no choices in response".to_string()))?;
        log::debug!("ai: improved description ({} chars)", answer.len());
        ImprovedTask::from_answer(&answer)
    }

    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String, AiError> {
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(audio).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.transcription_model.clone())
            .text("response_format", "json");
        let res = self.authorize(self.client.post(&url)).multipart(form).send().await?;
        let data: TranscriptionResponse = Self::check(res).await?.json().await?;
        log::debug!("ai: transcribed {} ({} chars)", file_name, data.text.len());
        Ok(data.text)
    }
}
