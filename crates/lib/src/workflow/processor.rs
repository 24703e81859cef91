//! MESSAGE-PROCESSOR: decide what the latest message means for the conversation.

use super::{
    WorkflowContext, WorkflowError, EFFECT_INVALID_OPTION, INVALID_OPTION_TEXT, MESSAGE_SESSION_CLOSE, MESSAGE_TASK_DETAIL, TASK_DETAIL_CREATE,
};
use crate::channels::InboundMessage;
use crate::queue::Payload;
use crate::router::EventHandler;
use crate::state::ConversationState::{self, *};
use async_trait::async_trait;
use std::sync::Arc;

/// Menu options the remote party can pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    DescribeRequest,
    EndSession,
}

impl MenuChoice {
    pub fn parse(text: Option<&str>) -> Option<Self> {
        match text.map(str::trim) {
            Some("1") => Some(MenuChoice::DescribeRequest),
            Some("2") => Some(MenuChoice::EndSession),
            _ => None,
        }
    }
}

pub struct MessageProcessorHandler {
    ctx: Arc<WorkflowContext>,
}

impl MessageProcessorHandler {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }

    /// Publish `event`, then move the entry from `from` to `to`.
    async fn hand_off(
        &self,
        event: &str,
        payload: Payload,
        entry_id: i64,
        from: ConversationState,
        to: ConversationState,
    ) -> Result<(), WorkflowError> {
        self.ctx.publish_for_entry(event, payload, entry_id).await?;
        self.ctx.log.transition(entry_id, from, to).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for MessageProcessorHandler {
    fn event_name(&self) -> &'static str {
        super::MESSAGE_PROCESSOR
    }

    async fn handle(&self, payload: Payload) -> Result<(), WorkflowError> {
        let entry_id = super::entry_id(&payload)?;
        let entry = self
            .ctx
            .log
            .get(entry_id)
            .await?
            .ok_or_else(|| WorkflowError::Missing(format!("message entry {}", entry_id)))?;
        let session = self
            .ctx
            .sessions
            .get(entry.session_id)
            .await?
            .ok_or_else(|| WorkflowError::Missing(format!("session {}", entry.session_id)))?;
        let msg = InboundMessage::from_payload(&payload).map_err(|e| WorkflowError::InvalidPayload(e.to_string()))?;

        match entry.state {
            MessageReceived => {
                self.ctx
                    .bounded("send menu", self.ctx.gateway.send_menu(msg.number(), session.instance_id))
                    .await?;
                self.ctx.log.transition(entry.id, MessageReceived, MessageProcessed).await?;
                Ok(())
            }
            MessageProcessed => match MenuChoice::parse(msg.text()) {
                Some(MenuChoice::DescribeRequest) => {
                    self.hand_off(MESSAGE_TASK_DETAIL, payload, entry.id, MessageProcessed, AwaitingTaskDetail)
                        .await
                }
                Some(MenuChoice::EndSession) => {
                    self.hand_off(MESSAGE_SESSION_CLOSE, payload, entry.id, MessageProcessed, SessionClosing)
                        .await
                }
                None => {
                    if entry.effect(EFFECT_INVALID_OPTION).is_some() {
                        log::debug!("workflow: invalid option notice for entry {} already sent", entry.id);
                        return Ok(());
                    }
                    log::info!("workflow: invalid menu option from {}", msg.remote_endpoint());
                    self.ctx
                        .bounded(
                            "send message",
                            self.ctx
                                .gateway
                                .send_message(msg.number(), INVALID_OPTION_TEXT, session.instance_id),
                        )
                        .await?;
                    self.ctx.log.record_effect(entry.id, EFFECT_INVALID_OPTION, "sent").await?;
                    Ok(())
                }
            },
            TaskDetailRequested => {
                self.hand_off(TASK_DETAIL_CREATE, payload, entry.id, TaskDetailRequested, CreatingTask)
                    .await
            }
            other => Err(WorkflowError::Stale(format!(
                "entry {} is in {}, nothing to process",
                entry.id, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MENU_TEXT;
    use crate::workflow::testing::{text_message, Harness};
    use crate::workflow::MESSAGE_PROCESSOR;

    async fn entry_in(h: &Harness, text: &str, state: ConversationState) -> Payload {
        let payload = text_message("instanceA", "555@s.whatsapp.net", "M1", text);
        h.record(payload, state).await
    }

    #[test]
    fn menu_choice_parsing() {
        assert_eq!(MenuChoice::parse(Some(" 1 ")), Some(MenuChoice::DescribeRequest));
        assert_eq!(MenuChoice::parse(Some("2")), Some(MenuChoice::EndSession));
        assert_eq!(MenuChoice::parse(Some("3")), None);
        assert_eq!(MenuChoice::parse(Some("12")), None);
        assert_eq!(MenuChoice::parse(None), None);
    }

    #[tokio::test]
    async fn new_conversation_gets_the_menu() {
        let h = Harness::new();
        let payload = entry_in(&h, "hello", MessageReceived).await;
        MessageProcessorHandler::new(h.ctx.clone()).handle(payload).await.unwrap();
        assert_eq!(h.sent(), vec![("555".to_string(), MENU_TEXT.to_string(), 1)]);
        assert_eq!(h.latest_state("555@s.whatsapp.net").await, MessageProcessed);
        assert!(h.published().is_empty());
    }

    #[tokio::test]
    async fn option_one_requests_task_detail() {
        let h = Harness::new();
        let payload = entry_in(&h, "1", MessageProcessed).await;
        MessageProcessorHandler::new(h.ctx.clone()).handle(payload).await.unwrap();
        assert!(h.sent().is_empty());
        let published = h.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_name, MESSAGE_TASK_DETAIL);
        assert_eq!(h.latest_state("555@s.whatsapp.net").await, AwaitingTaskDetail);
    }

    #[tokio::test]
    async fn option_two_closes_the_session() {
        let h = Harness::new();
        let payload = entry_in(&h, "2", MessageProcessed).await;
        MessageProcessorHandler::new(h.ctx.clone()).handle(payload).await.unwrap();
        assert_eq!(h.published()[0].event_name, MESSAGE_SESSION_CLOSE);
        assert_eq!(h.latest_state("555@s.whatsapp.net").await, SessionClosing);
    }

    #[tokio::test]
    async fn invalid_option_sends_notice_and_keeps_state() {
        let h = Harness::new();
        let payload = entry_in(&h, "3", MessageProcessed).await;
        MessageProcessorHandler::new(h.ctx.clone()).handle(payload).await.unwrap();
        assert_eq!(h.sent(), vec![("555".to_string(), INVALID_OPTION_TEXT.to_string(), 1)]);
        assert!(h.published().is_empty());
        assert_eq!(h.latest_state("555@s.whatsapp.net").await, MessageProcessed);
    }

    #[tokio::test]
    async fn invalid_option_notice_is_sent_once_per_message() {
        let h = Harness::new();
        let payload = entry_in(&h, "hello?", MessageProcessed).await;
        let handler = MessageProcessorHandler::new(h.ctx.clone());
        handler.handle(payload.clone()).await.unwrap();
        handler.handle(payload).await.unwrap();
        assert_eq!(h.sent().len(), 1);
        let entry = h.ctx.log.latest_by_endpoint("555@s.whatsapp.net").await.unwrap().unwrap();
        assert!(!entry.is_untouched());
    }

    #[tokio::test]
    async fn detail_message_starts_task_creation() {
        let h = Harness::new();
        let payload = entry_in(&h, "my printer is broken", TaskDetailRequested).await;
        MessageProcessorHandler::new(h.ctx.clone()).handle(payload).await.unwrap();
        assert_eq!(h.published()[0].event_name, TASK_DETAIL_CREATE);
        assert_eq!(h.latest_state("555@s.whatsapp.net").await, CreatingTask);
    }

    #[tokio::test]
    async fn failed_menu_send_leaves_state_for_redelivery() {
        let h = Harness::new();
        h.gateway.fail_sends(true);
        let payload = entry_in(&h, "hello", MessageReceived).await;
        let err = MessageProcessorHandler::new(h.ctx.clone())
            .handle(payload.clone())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.latest_state("555@s.whatsapp.net").await, MessageReceived);

        h.gateway.fail_sends(false);
        MessageProcessorHandler::new(h.ctx.clone()).handle(payload).await.unwrap();
        assert_eq!(h.latest_state("555@s.whatsapp.net").await, MessageProcessed);
    }

    #[tokio::test]
    async fn in_flight_states_are_stale() {
        let h = Harness::new();
        let payload = entry_in(&h, "1", AwaitingTaskDetail).await;
        let err = MessageProcessorHandler::new(h.ctx.clone()).handle(payload).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Stale(_)));
        assert!(h.sent().is_empty());
        assert!(h.published().iter().all(|e| e.event_name != MESSAGE_PROCESSOR));
    }
}
