//! MESSAGE-SESSION-CLOSE: say goodbye and end the session.

use super::{WorkflowContext, WorkflowError, SESSION_CLOSED_TEXT};
use crate::queue::Payload;
use crate::router::EventHandler;
use crate::state::ConversationState::{SessionClosed, SessionClosing};
use async_trait::async_trait;
use std::sync::Arc;

pub struct SessionCloseHandler {
    ctx: Arc<WorkflowContext>,
}

impl SessionCloseHandler {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for SessionCloseHandler {
    fn event_name(&self) -> &'static str {
        super::MESSAGE_SESSION_CLOSE
    }

    async fn handle(&self, payload: Payload) -> Result<(), WorkflowError> {
        let loaded = self.ctx.load(&payload, SessionClosing).await?;
        self.ctx.reply(&loaded, SESSION_CLOSED_TEXT).await?;
        self.ctx.sessions.deactivate_session(loaded.session.id).await?;
        self.ctx
            .log
            .transition(loaded.entry.id, SessionClosing, SessionClosed)
            .await?;
        Ok(())
    }
}
