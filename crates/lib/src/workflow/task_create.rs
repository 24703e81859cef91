//! TASK-DETAIL-CREATE: turn the described request into a task board item and end the session.
//!
//! The created item and comment ids are journaled on the entry as they complete, so a
//! redelivery after a partial failure resumes where it stopped instead of creating a second item.

use super::{
    Loaded, WorkflowContext, WorkflowError, AUDIO_FAILED_TEXT, EFFECT_TASK_COMMENT, EFFECT_TASK_ITEM, EMPTY_MESSAGE_TEXT,
    TASK_CREATED_TEXT,
};
use crate::llm::ImprovedTask;
use crate::queue::Payload;
use crate::router::EventHandler;
use crate::state::ConversationState::{CreatingTask, TaskCreated};
use async_trait::async_trait;
use std::sync::Arc;

pub struct TaskCreateHandler {
    ctx: Arc<WorkflowContext>,
}

impl TaskCreateHandler {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }

    /// Text of the request: the message text, or the transcription of its audio.
    async fn request_text(&self, loaded: &Loaded) -> String {
        if loaded.message.is_audio() {
            return match self.transcribe(loaded).await {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => AUDIO_FAILED_TEXT.to_string(),
                Err(e) => {
                    log::warn!("workflow: audio of entry {} not transcribed: {}", loaded.entry.id, e);
                    AUDIO_FAILED_TEXT.to_string()
                }
            };
        }
        loaded
            .message
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(EMPTY_MESSAGE_TEXT)
            .to_string()
    }

    async fn transcribe(&self, loaded: &Loaded) -> Result<String, WorkflowError> {
        let message_id = loaded
            .message
            .message_id()
            .ok_or_else(|| WorkflowError::InvalidPayload("audio message has no id".to_string()))?;
        let media = self
            .ctx
            .bounded(
                "get media",
                self.ctx.gateway.get_media(message_id, loaded.session.instance_id),
            )
            .await?;
        let audio = media.decode()?;
        let file_name = audio_file_name(&media.file_name);
        self.ctx.bounded("transcribe", self.ctx.ai.transcribe(audio, &file_name)).await
    }

    async fn improve(&self, text: &str) -> ImprovedTask {
        let default_title = &self.ctx.default_task_title;
        match self
            .ctx
            .bounded("improve description", self.ctx.ai.improve_description(text))
            .await
        {
            Ok(mut task) => {
                if task.title.trim().is_empty() {
                    task.title = default_title.clone();
                }
                task
            }
            Err(e) => {
                log::warn!("workflow: using raw request text, assistant failed: {}", e);
                ImprovedTask::fallback(default_title, text)
            }
        }
    }
}

/// Transcription wants an `.ogg` name for voice notes the gateway labels `.oga`.
fn audio_file_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return "audio.ogg".to_string();
    }
    match name.strip_suffix(".oga") {
        Some(stem) => format!("{}.ogg", stem),
        None => name.to_string(),
    }
}

#[async_trait]
impl EventHandler for TaskCreateHandler {
    fn event_name(&self) -> &'static str {
        super::TASK_DETAIL_CREATE
    }

    async fn handle(&self, payload: Payload) -> Result<(), WorkflowError> {
        let loaded = self.ctx.load(&payload, CreatingTask).await?;
        let entry_id = loaded.entry.id;
        let item_done = loaded.entry.effect(EFFECT_TASK_ITEM).map(str::to_string);
        let comment_done = loaded.entry.effect(EFFECT_TASK_COMMENT).is_some();

        if item_done.is_none() || !comment_done {
            let text = self.request_text(&loaded).await;
            let task = self.improve(&text).await;
            let item_id = match item_done {
                Some(id) => id,
                None => {
                    let id = self
                        .ctx
                        .bounded(
                            "create task item",
                            self.ctx.board.create_item(&task.title, task.deadline.as_deref()),
                        )
                        .await?;
                    self.ctx.log.record_effect(entry_id, EFFECT_TASK_ITEM, &id).await?;
                    id
                }
            };
            if !comment_done {
                let id = self
                    .ctx
                    .bounded("create task comment", self.ctx.board.create_comment(&item_id, &task.body))
                    .await?;
                self.ctx.log.record_effect(entry_id, EFFECT_TASK_COMMENT, &id).await?;
            }
            log::info!("workflow: entry {} filed as task item {}", entry_id, item_id);
        }

        self.ctx.reply(&loaded, TASK_CREATED_TEXT).await?;
        self.ctx.sessions.deactivate_session(loaded.session.id).await?;
        self.ctx.log.transition(entry_id, CreatingTask, TaskCreated).await?;
        Ok(())
    }
}
