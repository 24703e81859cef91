//! Gateway HTTP server: forwards submitted events onto the queue and exposes conversation state.

use crate::channels::{ChannelRegistry, HttpMessagingGateway};
use crate::config::{self, Config};
use crate::init;
use crate::llm::OpenAiClient;
use crate::message_log::MessageLog;
use crate::queue::{Consumer, ConsumerPolicy, DeadLetters, EventEnvelope, EventPublisher, MemoryQueue, QueueError};
use crate::router::{HandlerRegistry, Router};
use crate::session::SessionManager;
use crate::store::Store;
use crate::task_board::GraphqlTaskBoard;
use crate::workflow::{self, WorkflowContext};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub publisher: Arc<dyn EventPublisher>,
    pub log: MessageLog,
    pub dead_letters: DeadLetters,
    /// Event names with a registered handler.
    pub events: Arc<Vec<&'static str>>,
}

/// HTTP routes of the gateway.
pub fn http_app(state: GatewayState) -> axum::Router {
    axum::Router::new()
        .route("/", get(health_http))
        .route("/api/messages/send", post(send_message))
        .route("/api/conversations/:endpoint", get(latest_entry))
        .route("/api/dead-letters", get(dead_letters))
        .with_state(state)
}

/// Run the gateway server on config.gateway.bind:config.gateway.port, with the queue consumer
/// alongside it. Blocks until shutdown (Ctrl+C / SIGTERM); in-flight deliveries finish first.
/// Requires the configuration directory to be initialized (`parley init`).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;

    let store = match config::resolve_store_path(&config, &config_path) {
        Some(path) => Store::open(&path).with_context(|| format!("opening store {}", path.display()))?,
        None => {
            log::warn!("store.path not set, conversation state is kept in memory only");
            Store::open_in_memory().context("opening in-memory store")?
        }
    };
    let store = Arc::new(store);
    let channels = ChannelRegistry::from_config(&config.channels.instances).context("loading channel instances")?;
    log::info!("{} channel instance(s) configured", channels.len());

    let gateway = HttpMessagingGateway::new(
        &config.messaging.base_url,
        config.messaging.email.clone(),
        config::resolve_messaging_password(&config),
    );
    let board = GraphqlTaskBoard::new(
        &config.task_board.api_url,
        config::resolve_task_board_token(&config),
        &config.task_board.board_id,
        &config.task_board.group_id,
    );
    let ai = OpenAiClient::new(
        &config.ai.base_url,
        config::resolve_ai_api_key(&config),
        &config.ai.chat_model,
        &config.ai.transcription_model,
    );

    let (queue, receiver) = MemoryQueue::new(&config.queue);
    let publisher: Arc<dyn EventPublisher> = Arc::new(queue.clone());
    let log = MessageLog::new(store.clone());
    let ctx = Arc::new(WorkflowContext {
        sessions: SessionManager::new(store, Arc::new(channels)),
        log: log.clone(),
        gateway: Arc::new(gateway),
        board: Arc::new(board),
        ai: Arc::new(ai),
        publisher: publisher.clone(),
        timeout: config.workflow.external_timeout(),
        default_task_title: config.workflow.default_task_title.clone(),
    });
    let registry = HandlerRegistry::build(workflow::handlers(ctx)).context("registering handlers")?;
    let events = Arc::new(registry.event_names());
    let router = Arc::new(Router::new(registry));

    let dead_letters = DeadLetters::default();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let consumer = Consumer::new(
        router,
        queue,
        ConsumerPolicy::from(&config.queue),
        dead_letters.clone(),
    );
    let consumer_task = tokio::spawn(consumer.run(receiver, async move {
        let _ = stop_rx.wait_for(|stop| *stop).await;
    }));

    let state = GatewayState {
        config: Arc::new(config.clone()),
        publisher,
        log,
        dead_letters,
        events,
    };
    let app = http_app(state);

    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;

    log::info!("gateway stopped accepting requests, draining queue consumer");
    let _ = stop_tx.send(true);
    if let Err(e) = consumer_task.await {
        log::error!("queue consumer task failed: {}", e);
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("installing Ctrl+C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

/// GET / returns a simple health JSON.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "exchange": state.config.queue.exchange,
        "routingKey": state.config.queue.routing_key,
        "events": state.events.as_slice(),
        "deadLetters": state.dead_letters.len().await,
    }))
}

/// POST /api/messages/send forwards an event envelope onto the queue.
async fn send_message(State(state): State<GatewayState>, body: Bytes) -> Response {
    let envelope: EventEnvelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid envelope: {}", e) })),
            )
                .into_response()
        }
    };
    let event_name = envelope.event_name.clone();
    match state.publisher.publish(envelope).await {
        Ok(()) => {
            log::debug!("gateway: accepted {}", event_name);
            (
                StatusCode::ACCEPTED,
                Json(json!({ "accepted": true, "eventName": event_name })),
            )
                .into_response()
        }
        Err(e @ QueueError::Closed(_)) => {
            log::error!("gateway: could not forward {}: {}", event_name, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /api/conversations/{endpoint} returns the latest message entry for the endpoint.
async fn latest_entry(State(state): State<GatewayState>, Path(endpoint): Path<String>) -> Response {
    match state.log.latest_by_endpoint(&endpoint).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no messages for {}", endpoint) })),
        )
            .into_response(),
        Err(e) => {
            log::error!("gateway: reading conversation {} failed: {}", endpoint, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /api/dead-letters lists deliveries that exhausted their redeliveries.
async fn dead_letters(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({ "deadLetters": state.dead_letters.list().await }))
}
