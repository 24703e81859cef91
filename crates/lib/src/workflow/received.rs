//! MESSAGE-RECEIVED: record the inbound message and hand it to the processor.

use super::{WorkflowContext, WorkflowError, MESSAGE_PROCESSOR};
use crate::channels::InboundMessage;
use crate::message_log::NewEntry;
use crate::queue::Payload;
use crate::router::EventHandler;
use crate::state::ConversationState;
use async_trait::async_trait;
use std::sync::Arc;

pub struct MessageReceivedHandler {
    ctx: Arc<WorkflowContext>,
}

impl MessageReceivedHandler {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for MessageReceivedHandler {
    fn event_name(&self) -> &'static str {
        super::MESSAGE_RECEIVED
    }

    async fn handle(&self, payload: Payload) -> Result<(), WorkflowError> {
        let msg = InboundMessage::from_payload(&payload).map_err(|e| WorkflowError::InvalidPayload(e.to_string()))?;
        if msg.data.key.from_me {
            log::debug!("workflow: ignoring own message to {}", msg.remote_endpoint());
            return Ok(());
        }
        let instance = self
            .ctx
            .sessions
            .find_instance_by_name(&msg.instance)
            .ok_or_else(|| WorkflowError::UnknownInstance(msg.instance.clone()))?;
        let session = self
            .ctx
            .sessions
            .find_or_create_session(&instance, msg.remote_endpoint())
            .await?;

        if let Some(message_id) = msg.message_id() {
            if let Some(existing) = self.ctx.log.find_by_external_id(session.id, message_id).await? {
                // recorded but never processed: the processor event was lost, send it again
                if existing.is_untouched() {
                    log::info!("workflow: re-publishing processor for redelivered message {}", message_id);
                    return self.ctx.publish_for_entry(MESSAGE_PROCESSOR, payload, existing.id).await;
                }
                return Err(WorkflowError::Stale(format!(
                    "message {} already recorded as entry {}",
                    message_id, existing.id
                )));
            }
        }

        let state = ConversationState::carried_into_next_message(session.state);
        let timestamp = msg.timestamp().unwrap_or_else(|| chrono::Utc::now().timestamp());
        let entry = self
            .ctx
            .log
            .append(NewEntry {
                session_id: session.id,
                payload: &payload,
                state,
                timestamp,
                remote_endpoint: msg.remote_endpoint(),
                from_remote: true,
                kind: msg.kind(),
                display_name: msg.data.push_name.as_deref(),
                external_id: msg.message_id(),
            })
            .await?;
        self.ctx.publish_for_entry(MESSAGE_PROCESSOR, payload, entry.id).await
    }
}
