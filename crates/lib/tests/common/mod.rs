//! Shared fixtures for integration tests: in-memory collaborators and a wired engine.
#![allow(dead_code)]

use async_trait::async_trait;
use parley::channels::{ChannelGroup, ChannelInstance, ChannelRegistry, GatewayError, MediaFile, MessagingGateway};
use parley::llm::{AiAssistant, AiError, ImprovedTask};
use parley::message_log::MessageLog;
use parley::queue::{Consumer, ConsumerPolicy, DeadLetters, EventEnvelope, EventPublisher, MemoryQueue, Payload};
use parley::router::{HandlerRegistry, Router};
use parley::session::SessionManager;
use parley::store::Store;
use parley::task_board::{TaskBoard, TaskBoardError};
use parley::workflow::{self, WorkflowContext};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct Gateway {
    pub sent: Mutex<Vec<(String, String, i64)>>,
    pub has_media: AtomicBool,
}

#[async_trait]
impl MessagingGateway for Gateway {
    async fn send_message(&self, number: &str, text: &str, instance_id: i64) -> Result<(), GatewayError> {
        self.sent
            .lock()
            .unwrap()
            .push((number.to_string(), text.to_string(), instance_id));
        Ok(())
    }

    async fn get_media(&self, _message_id: &str, _instance_id: i64) -> Result<MediaFile, GatewayError> {
        if self.has_media.load(Ordering::SeqCst) {
            Ok(MediaFile {
                media_type: "audioMessage".to_string(),
                file_name: "note.oga".to_string(),
                mimetype: Some("audio/ogg".to_string()),
                base64: "T2dnUw==".to_string(),
            })
        } else {
            Err(GatewayError::Api("404 media not found".to_string()))
        }
    }
}

impl Gateway {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t, _)| t.clone()).collect()
    }
}

#[derive(Default)]
pub struct Board {
    pub items: Mutex<Vec<(String, Option<String>)>>,
    pub comments: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl TaskBoard for Board {
    async fn create_item(&self, title: &str, deadline: Option<&str>) -> Result<String, TaskBoardError> {
        let mut items = self.items.lock().unwrap();
        items.push((title.to_string(), deadline.map(str::to_string)));
        Ok(format!("{}", 1000 + items.len()))
    }

    async fn create_comment(&self, item_id: &str, body: &str) -> Result<String, TaskBoardError> {
        self.comments.lock().unwrap().push((item_id.to_string(), body.to_string()));
        Ok("1".to_string())
    }
}

/// Echoes the request as the task; transcription fails unless enabled.
#[derive(Default)]
pub struct Ai {
    pub transcribe_ok: AtomicBool,
    pub improve_calls: AtomicUsize,
}

#[async_trait]
impl AiAssistant for Ai {
    async fn improve_description(&self, raw: &str) -> Result<ImprovedTask, AiError> {
        self.improve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ImprovedTask {
            title: format!("Task: {}", raw),
            body: format!("As a customer I would like: {}", raw),
            deadline: Some("01/12/2026".to_string()),
        })
    }

    async fn transcribe(&self, _audio: Vec<u8>, _file_name: &str) -> Result<String, AiError> {
        if self.transcribe_ok.load(Ordering::SeqCst) {
            Ok("transcribed request".to_string())
        } else {
            Err(AiError::Api("500 transcription failed".to_string()))
        }
    }
}

pub fn instance(id: i64, name: &str) -> ChannelInstance {
    ChannelInstance {
        id,
        name: name.to_string(),
        status: "open".to_string(),
        group: ChannelGroup {
            name: "acme".to_string(),
            url: "http://gateway.local".to_string(),
            api_key: None,
            owner: None,
        },
    }
}

/// Everything wired together around a running queue consumer.
pub struct Engine {
    pub ctx: Arc<WorkflowContext>,
    pub router: Arc<Router>,
    pub queue: MemoryQueue,
    pub gateway: Arc<Gateway>,
    pub board: Arc<Board>,
    pub ai: Arc<Ai>,
    pub dead_letters: DeadLetters,
    stop: Option<oneshot::Sender<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn start() -> Self {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let channels = Arc::new(ChannelRegistry::new(vec![instance(7, "support")]).unwrap());
        let gateway = Arc::new(Gateway::default());
        let board = Arc::new(Board::default());
        let ai = Arc::new(Ai::default());
        let queue_config = parley::config::QueueConfig {
            max_redeliveries: 2,
            redelivery_delay_ms: 5,
            ..Default::default()
        };
        let (queue, rx) = MemoryQueue::new(&queue_config);
        let ctx = Arc::new(WorkflowContext {
            sessions: SessionManager::new(store.clone(), channels),
            log: MessageLog::new(store),
            gateway: gateway.clone(),
            board: board.clone(),
            ai: ai.clone(),
            publisher: Arc::new(queue.clone()),
            timeout: Duration::from_secs(5),
            default_task_title: "Task from chat".to_string(),
        });
        let router = Arc::new(Router::new(HandlerRegistry::build(workflow::handlers(ctx.clone())).unwrap()));
        let dead_letters = DeadLetters::default();
        let consumer = Consumer::new(
            router.clone(),
            queue.clone(),
            ConsumerPolicy::from(&queue_config),
            dead_letters.clone(),
        );
        let (stop, stop_rx) = oneshot::channel::<()>();
        let consumer = tokio::spawn(consumer.run(rx, async {
            let _ = stop_rx.await;
        }));
        Self {
            ctx,
            router,
            queue,
            gateway,
            board,
            ai,
            dead_letters,
            stop: Some(stop),
            consumer: Some(consumer),
        }
    }

    pub async fn publish(&self, event: &str, payload: Payload) {
        self.queue.publish(EventEnvelope::new(event, payload)).await.unwrap();
    }

    /// Stop the consumer after in-flight deliveries finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(consumer) = self.consumer.take() {
            consumer.await.unwrap();
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.ctx.log
    }
}

pub fn message(remote_jid: &str, id: &str, text: &str) -> Payload {
    as_payload(json!({
        "event": "messages.upsert",
        "instance": "support",
        "data": {
            "key": { "remoteJid": remote_jid, "fromMe": false, "id": id },
            "pushName": "Ana",
            "message": { "conversation": text },
            "messageType": "conversation",
            "messageTimestamp": 1717000000
        }
    }))
}

pub fn voice_note(remote_jid: &str, id: &str) -> Payload {
    as_payload(json!({
        "instance": "support",
        "data": {
            "key": { "remoteJid": remote_jid, "fromMe": false, "id": id },
            "message": { "audioMessage": { "seconds": 3 } },
            "messageType": "audioMessage",
            "messageTimestamp": 1717000100
        }
    }))
}

fn as_payload(v: serde_json::Value) -> Payload {
    match v {
        serde_json::Value::Object(m) => m,
        _ => unreachable!(),
    }
}

/// Poll `check` until it returns true (about 5s).
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
