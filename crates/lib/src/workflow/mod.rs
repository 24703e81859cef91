//! Conversation saga: one handler per event, each advancing the latest message entry of a
//! conversation through the state machine in [`crate::state`].
//!
//! ```text
//! MESSAGE-RECEIVED ─► MESSAGE-PROCESSOR ─┬─► MESSAGE-TASK-DETAIL
//!                                        ├─► MESSAGE-SESSION-CLOSE
//!                                        └─► TASK-DETAIL-CREATE
//! ```
//!
//! Handlers publish the follow-up event before committing their own transition; every
//! follow-up handler checks that the entry is still in the state it expects, so a redelivered
//! or superseded event is dropped instead of repeating work.

mod processor;
mod received;
mod session_close;
mod task_create;
mod task_detail;

pub use processor::{MenuChoice, MessageProcessorHandler};
pub use received::MessageReceivedHandler;
pub use session_close::SessionCloseHandler;
pub use task_create::TaskCreateHandler;
pub use task_detail::TaskDetailHandler;

use crate::channels::{GatewayError, InboundMessage, MessagingGateway};
use crate::llm::{AiAssistant, AiError};
use crate::message_log::{LogError, MessageEntry, MessageLog};
use crate::queue::{EventEnvelope, EventPublisher, Payload, QueueError};
use crate::router::EventHandler;
use crate::session::{ConversationSession, SessionManager};
use crate::state::ConversationState;
use crate::store::{EntryId, StoreError};
use crate::task_board::{TaskBoard, TaskBoardError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const MESSAGE_RECEIVED: &str = "MESSAGE-RECEIVED";
pub const MESSAGE_PROCESSOR: &str = "MESSAGE-PROCESSOR";
pub const MESSAGE_TASK_DETAIL: &str = "MESSAGE-TASK-DETAIL";
pub const MESSAGE_SESSION_CLOSE: &str = "MESSAGE-SESSION-CLOSE";
pub const TASK_DETAIL_CREATE: &str = "TASK-DETAIL-CREATE";

/// Payload key carrying the message entry id on follow-up events.
pub const MESSAGE_SESSION_ID: &str = "messageSessionId";

pub const INVALID_OPTION_TEXT: &str = "Sorry, that is not a valid option. Please reply with 1 or 2.";
pub const TASK_DETAIL_PROMPT: &str =
    "Please describe your request in as much detail as you can. You can type it or send an audio message.";
pub const SESSION_CLOSED_TEXT: &str = "Your session has been closed. Thank you for getting in touch!";
pub const TASK_CREATED_TEXT: &str =
    "Thank you! Your request has been registered and our team will get back to you soon.";
/// Task text used when an audio message cannot be fetched or transcribed.
pub const AUDIO_FAILED_TEXT: &str = "[audio message could not be transcribed]";
/// Task text used when the message carries neither text nor audio.
pub const EMPTY_MESSAGE_TEXT: &str = "No details provided.";

/// Effect journal keys on a message entry.
pub(crate) const EFFECT_TASK_ITEM: &str = "taskItemId";
pub(crate) const EFFECT_TASK_COMMENT: &str = "taskCommentId";
pub(crate) const EFFECT_INVALID_OPTION: &str = "invalidOptionNotice";

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unknown channel instance: {0}")]
    UnknownInstance(String),
    #[error("{0} not found")]
    Missing(String),
    #[error("stale event: {0}")]
    Stale(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    TaskBoard(#[from] TaskBoardError),
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

impl WorkflowError {
    /// Transient failures worth a redelivery. Everything else is dropped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::Store(_)
                | WorkflowError::Gateway(_)
                | WorkflowError::TaskBoard(_)
                | WorkflowError::Ai(_)
                | WorkflowError::Queue(_)
                | WorkflowError::Timeout(..)
        )
    }
}

impl From<LogError> for WorkflowError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Store(e) => WorkflowError::Store(e),
            LogError::Encode(e) => WorkflowError::InvalidPayload(e.to_string()),
            LogError::NotFound(id) => WorkflowError::Missing(format!("message entry {}", id)),
            e @ (LogError::Conflict { .. } | LogError::NotAllowed { .. }) => WorkflowError::Stale(e.to_string()),
        }
    }
}

/// Collaborators shared by all handlers.
pub struct WorkflowContext {
    pub sessions: SessionManager,
    pub log: MessageLog,
    pub gateway: Arc<dyn MessagingGateway>,
    pub board: Arc<dyn TaskBoard>,
    pub ai: Arc<dyn AiAssistant>,
    pub publisher: Arc<dyn EventPublisher>,
    /// Upper bound on every external call.
    pub timeout: Duration,
    pub default_task_title: String,
}

/// What a follow-up handler works on: the entry named by `messageSessionId`, its session, and
/// the inbound message it was recorded from.
pub(crate) struct Loaded {
    pub entry: MessageEntry,
    pub session: ConversationSession,
    pub message: InboundMessage,
}

impl WorkflowContext {
    /// Await an external call, failing with a retryable timeout once the bound is hit.
    pub(crate) async fn bounded<T, E>(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, WorkflowError>
    where
        WorkflowError: From<E>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(res) => res.map_err(WorkflowError::from),
            Err(_) => Err(WorkflowError::Timeout(what, self.timeout)),
        }
    }

    /// Publish `event` with the payload plus `messageSessionId = entry_id`.
    pub(crate) async fn publish_for_entry(
        &self,
        event: &str,
        mut payload: Payload,
        entry_id: EntryId,
    ) -> Result<(), WorkflowError> {
        payload.insert(MESSAGE_SESSION_ID.to_string(), entry_id.into());
        self.bounded("publish", self.publisher.publish(EventEnvelope::new(event, payload)))
            .await?;
        log::debug!("workflow: published {} for entry {}", event, entry_id);
        Ok(())
    }

    /// Resolve the entry a follow-up event refers to, and require it to be in `expected`.
    pub(crate) async fn load(&self, payload: &Payload, expected: ConversationState) -> Result<Loaded, WorkflowError> {
        let entry_id = entry_id(payload)?;
        let entry = self
            .log
            .get(entry_id)
            .await?
            .ok_or_else(|| WorkflowError::Missing(format!("message entry {}", entry_id)))?;
        if entry.state != expected {
            return Err(WorkflowError::Stale(format!(
                "entry {} is in {}, expected {}",
                entry.id, entry.state, expected
            )));
        }
        let session = self
            .sessions
            .get(entry.session_id)
            .await?
            .ok_or_else(|| WorkflowError::Missing(format!("session {}", entry.session_id)))?;
        let message = InboundMessage::from_payload(payload).map_err(|e| WorkflowError::InvalidPayload(e.to_string()))?;
        Ok(Loaded { entry, session, message })
    }

    /// Send a text to the conversation's remote party.
    pub(crate) async fn reply(&self, loaded: &Loaded, text: &str) -> Result<(), WorkflowError> {
        self.bounded(
            "send message",
            self.gateway
                .send_message(loaded.message.number(), text, loaded.session.instance_id),
        )
        .await
    }
}

/// `messageSessionId` from a follow-up payload (number or numeric string).
pub fn entry_id(payload: &Payload) -> Result<EntryId, WorkflowError> {
    let value = payload
        .get(MESSAGE_SESSION_ID)
        .ok_or_else(|| WorkflowError::InvalidPayload(format!("missing {}", MESSAGE_SESSION_ID)))?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| WorkflowError::InvalidPayload(format!("{} is not an id: {}", MESSAGE_SESSION_ID, value)))
}

/// Every handler of the saga. The router's registry is built from this list.
pub fn handlers(ctx: Arc<WorkflowContext>) -> Vec<Arc<dyn EventHandler>> {
    vec![
        Arc::new(MessageReceivedHandler::new(ctx.clone())),
        Arc::new(MessageProcessorHandler::new(ctx.clone())),
        Arc::new(TaskDetailHandler::new(ctx.clone())),
        Arc::new(SessionCloseHandler::new(ctx.clone())),
        Arc::new(TaskCreateHandler::new(ctx)),
    ]
}

#[cfg(test)]
pub(crate) mod testing;
