//! In-memory collaborators for handler tests.

use super::{WorkflowContext, MESSAGE_SESSION_ID};
use crate::channels::{ChannelGroup, ChannelInstance, ChannelRegistry, GatewayError, InboundMessage, MediaFile, MessagingGateway};
use crate::llm::{AiAssistant, AiError, ImprovedTask};
use crate::message_log::{MessageLog, NewEntry};
use crate::queue::{EventEnvelope, EventPublisher, Payload, QueueError};
use crate::session::SessionManager;
use crate::state::ConversationState;
use crate::store::Store;
use crate::task_board::{TaskBoard, TaskBoardError};
use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn text_message(instance: &str, remote_jid: &str, id: &str, text: &str) -> Payload {
    as_payload(json!({
        "event": "messages.upsert",
        "instance": instance,
        "data": {
            "key": { "remoteJid": remote_jid, "fromMe": false, "id": id },
            "pushName": "Ana",
            "message": { "conversation": text },
            "messageType": "conversation",
            "messageTimestamp": 1717000000
        }
    }))
}

pub fn audio_message(instance: &str, remote_jid: &str, id: &str) -> Payload {
    as_payload(json!({
        "event": "messages.upsert",
        "instance": instance,
        "data": {
            "key": { "remoteJid": remote_jid, "fromMe": false, "id": id },
            "pushName": "Ana",
            "message": { "audioMessage": { "seconds": 4 } },
            "messageType": "audioMessage",
            "messageTimestamp": 1717000000
        }
    }))
}

fn as_payload(v: serde_json::Value) -> Payload {
    match v {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    }
}

#[derive(Default)]
pub struct FakeGateway {
    sent: Mutex<Vec<(String, String, i64)>>,
    fail: AtomicBool,
    media: Mutex<Option<MediaFile>>,
}

impl FakeGateway {
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_media(&self, file_name: &str, bytes: &[u8]) {
        *self.media.lock().unwrap() = Some(MediaFile {
            media_type: "audioMessage".to_string(),
            file_name: file_name.to_string(),
            mimetype: Some("audio/ogg".to_string()),
            base64: base64::engine::general_purpose::STANDARD.encode(bytes),
        });
    }
}

#[async_trait]
impl MessagingGateway for FakeGateway {
    async fn send_message(&self, number: &str, text: &str, instance_id: i64) -> Result<(), GatewayError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Api("503 unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((number.to_string(), text.to_string(), instance_id));
        Ok(())
    }

    async fn get_media(&self, _message_id: &str, _instance_id: i64) -> Result<MediaFile, GatewayError> {
        self.media
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GatewayError::Api("404 no media".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct BoardItem {
    pub id: String,
    pub title: String,
    pub deadline: Option<String>,
    pub comments: Vec<String>,
}

#[derive(Default)]
pub struct FakeBoard {
    items: Mutex<Vec<BoardItem>>,
    fail_comments: AtomicBool,
}

impl FakeBoard {
    pub fn items(&self) -> Vec<BoardItem> {
        self.items.lock().unwrap().clone()
    }

    pub fn fail_comments(&self, fail: bool) {
        self.fail_comments.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskBoard for FakeBoard {
    async fn create_item(&self, title: &str, deadline: Option<&str>) -> Result<String, TaskBoardError> {
        let mut items = self.items.lock().unwrap();
        let id = format!("item-{}", items.len() + 1);
        items.push(BoardItem {
            id: id.clone(),
            title: title.to_string(),
            deadline: deadline.map(str::to_string),
            comments: Vec::new(),
        });
        Ok(id)
    }

    async fn create_comment(&self, item_id: &str, body: &str) -> Result<String, TaskBoardError> {
        if self.fail_comments.load(Ordering::SeqCst) {
            return Err(TaskBoardError::Api("500 comment failed".to_string()));
        }
        let mut items = self.items.lock().unwrap();
        let item = items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or_else(|| TaskBoardError::Api(format!("no item {}", item_id)))?;
        item.comments.push(body.to_string());
        Ok(format!("{}-update-{}", item_id, item.comments.len()))
    }
}

#[derive(Default)]
pub struct FakeAi {
    fail_improve: AtomicBool,
    transcribed: Mutex<Vec<String>>,
}

impl FakeAi {
    pub fn fail_improve(&self, fail: bool) {
        self.fail_improve.store(fail, Ordering::SeqCst);
    }

    pub fn transcribed(&self) -> Vec<String> {
        self.transcribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiAssistant for FakeAi {
    async fn improve_description(&self, raw: &str) -> Result<ImprovedTask, AiError> {
        if self.fail_improve.load(Ordering::SeqCst) {
            return Err(AiError::Api("429 rate limited".to_string()));
        }
        Ok(ImprovedTask {
            title: format!("Improved: {}", raw),
            body: format!("As a customer: {}", raw),
            deadline: None,
        })
    }

    async fn transcribe(&self, _audio: Vec<u8>, file_name: &str) -> Result<String, AiError> {
        self.transcribed.lock().unwrap().push(file_name.to_string());
        Ok(format!("transcript of {}", file_name))
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    envelopes: Mutex<Vec<EventEnvelope>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), QueueError> {
        self.envelopes.lock().unwrap().push(envelope);
        Ok(())
    }
}

pub struct Harness {
    pub ctx: Arc<WorkflowContext>,
    pub gateway: Arc<FakeGateway>,
    pub board: Arc<FakeBoard>,
    pub ai: Arc<FakeAi>,
    pub publisher: Arc<RecordingPublisher>,
}

impl Harness {
    /// One channel instance, `instanceA` with id 1.
    pub fn new() -> Self {
        let instance = ChannelInstance {
            id: 1,
            name: "instanceA".to_string(),
            status: "open".to_string(),
            group: ChannelGroup {
                name: "acme".to_string(),
                url: "http://gw".to_string(),
                api_key: None,
                owner: None,
            },
        };
        let store = Arc::new(Store::open_in_memory().unwrap());
        let channels = Arc::new(ChannelRegistry::new(vec![instance]).unwrap());
        let gateway = Arc::new(FakeGateway::default());
        let board = Arc::new(FakeBoard::default());
        let ai = Arc::new(FakeAi::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let ctx = Arc::new(WorkflowContext {
            sessions: SessionManager::new(store.clone(), channels),
            log: MessageLog::new(store),
            gateway: gateway.clone(),
            board: board.clone(),
            ai: ai.clone(),
            publisher: publisher.clone(),
            timeout: Duration::from_secs(5),
            default_task_title: "Task from chat".to_string(),
        });
        Self {
            ctx,
            gateway,
            board,
            ai,
            publisher,
        }
    }

    pub fn sent(&self) -> Vec<(String, String, i64)> {
        self.gateway.sent.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<EventEnvelope> {
        self.publisher.envelopes.lock().unwrap().clone()
    }

    /// Record the message as an entry in `state` and return the payload of a follow-up event for it.
    pub async fn record(&self, mut payload: Payload, state: ConversationState) -> Payload {
        let msg = InboundMessage::from_payload(&payload).unwrap();
        let instance = self.ctx.sessions.find_instance_by_name(&msg.instance).unwrap();
        let session = self
            .ctx
            .sessions
            .find_or_create_session(&instance, msg.remote_endpoint())
            .await
            .unwrap();
        let entry = self
            .ctx
            .log
            .append(NewEntry {
                session_id: session.id,
                payload: &payload,
                state,
                timestamp: msg.timestamp().unwrap_or(0),
                remote_endpoint: msg.remote_endpoint(),
                from_remote: true,
                kind: msg.kind(),
                display_name: msg.data.push_name.as_deref(),
                external_id: msg.message_id(),
            })
            .await
            .unwrap();
        payload.insert(MESSAGE_SESSION_ID.to_string(), entry.id.into());
        payload
    }

    pub async fn latest_state(&self, remote_endpoint: &str) -> ConversationState {
        self.ctx.log.latest_by_endpoint(remote_endpoint).await.unwrap().unwrap().state
    }
}
