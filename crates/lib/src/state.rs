//! Conversation state labels and the transition table.
//!
//! ```text
//! MESSAGE-RECEIVED ──► MESSAGE-PROCESSED ──► AWAITING-TASK-DETAIL ──► TASK-DETAIL-REQUESTED
//!                               │                                              │
//!                               ▼                                              ▼
//!                        SESSION-CLOSING ──► SESSION-CLOSED          CREATING-TASK ──► TASK-CREATED
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationState {
    #[serde(rename = "MESSAGE-RECEIVED")]
    MessageReceived,
    #[serde(rename = "MESSAGE-PROCESSED")]
    MessageProcessed,
    #[serde(rename = "AWAITING-TASK-DETAIL")]
    AwaitingTaskDetail,
    #[serde(rename = "TASK-DETAIL-REQUESTED")]
    TaskDetailRequested,
    #[serde(rename = "CREATING-TASK")]
    CreatingTask,
    #[serde(rename = "TASK-CREATED")]
    TaskCreated,
    #[serde(rename = "SESSION-CLOSING")]
    SessionClosing,
    #[serde(rename = "SESSION-CLOSED")]
    SessionClosed,
}

use ConversationState::*;

impl ConversationState {
    pub const ALL: [ConversationState; 8] = [
        MessageReceived,
        MessageProcessed,
        AwaitingTaskDetail,
        TaskDetailRequested,
        CreatingTask,
        TaskCreated,
        SessionClosing,
        SessionClosed,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MessageReceived => "MESSAGE-RECEIVED",
            MessageProcessed => "MESSAGE-PROCESSED",
            AwaitingTaskDetail => "AWAITING-TASK-DETAIL",
            TaskDetailRequested => "TASK-DETAIL-REQUESTED",
            CreatingTask => "CREATING-TASK",
            TaskCreated => "TASK-CREATED",
            SessionClosing => "SESSION-CLOSING",
            SessionClosed => "SESSION-CLOSED",
        }
    }

    /// States reachable in one step.
    pub fn successors(self) -> &'static [ConversationState] {
        match self {
            MessageReceived => &[MessageProcessed],
            MessageProcessed => &[AwaitingTaskDetail, SessionClosing],
            AwaitingTaskDetail => &[TaskDetailRequested],
            TaskDetailRequested => &[CreatingTask],
            CreatingTask => &[TaskCreated],
            SessionClosing => &[SessionClosed],
            TaskCreated | SessionClosed => &[],
        }
    }

    pub fn can_transition_to(self, next: ConversationState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// State a new inbound message starts in, given the conversation's current state.
    /// Only states that wait on the remote party carry over; everything else starts over.
    pub fn carried_into_next_message(current: Option<ConversationState>) -> ConversationState {
        match current {
            Some(MessageProcessed) => MessageProcessed,
            Some(TaskDetailRequested) => TaskDetailRequested,
            _ => MessageReceived,
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown conversation state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for ConversationState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.label() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_back() {
        for st in ConversationState::ALL {
            assert_eq!(st.label().parse::<ConversationState>(), Ok(st));
            assert_eq!(serde_json::to_value(st).unwrap(), st.label());
        }
        assert!("SOMETHING-ELSE".parse::<ConversationState>().is_err());
    }

    #[test]
    fn transition_table() {
        assert!(MessageReceived.can_transition_to(MessageProcessed));
        assert!(MessageProcessed.can_transition_to(AwaitingTaskDetail));
        assert!(MessageProcessed.can_transition_to(SessionClosing));
        assert!(!MessageProcessed.can_transition_to(CreatingTask));
        assert!(!TaskCreated.can_transition_to(MessageReceived));
        assert!(!MessageProcessed.can_transition_to(MessageReceived));

        let terminal: Vec<_> = ConversationState::ALL.into_iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![TaskCreated, SessionClosed]);
    }

    #[test]
    fn only_waiting_states_carry_over() {
        assert_eq!(ConversationState::carried_into_next_message(None), MessageReceived);
        assert_eq!(
            ConversationState::carried_into_next_message(Some(MessageProcessed)),
            MessageProcessed
        );
        assert_eq!(
            ConversationState::carried_into_next_message(Some(TaskDetailRequested)),
            TaskDetailRequested
        );
        for st in [MessageReceived, AwaitingTaskDetail, CreatingTask, TaskCreated, SessionClosing, SessionClosed] {
            assert_eq!(ConversationState::carried_into_next_message(Some(st)), MessageReceived);
        }
    }
}
