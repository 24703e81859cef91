//! MESSAGE-TASK-DETAIL: ask the remote party to describe the request.

use super::{WorkflowContext, WorkflowError, TASK_DETAIL_PROMPT};
use crate::queue::Payload;
use crate::router::EventHandler;
use crate::state::ConversationState::{AwaitingTaskDetail, TaskDetailRequested};
use async_trait::async_trait;
use std::sync::Arc;

pub struct TaskDetailHandler {
    ctx: Arc<WorkflowContext>,
}

impl TaskDetailHandler {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for TaskDetailHandler {
    fn event_name(&self) -> &'static str {
        super::MESSAGE_TASK_DETAIL
    }

    async fn handle(&self, payload: Payload) -> Result<(), WorkflowError> {
        let loaded = self.ctx.load(&payload, AwaitingTaskDetail).await?;
        self.ctx.reply(&loaded, TASK_DETAIL_PROMPT).await?;
        self.ctx
            .log
            .transition(loaded.entry.id, AwaitingTaskDetail, TaskDetailRequested)
            .await?;
        Ok(())
    }
}
