//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parley/config.json`) and environment.
//! Secrets (gateway password, task-board token, AI key) may be supplied by env instead of the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Inbound HTTP surface settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Event queue naming and redelivery policy.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Where the SQLite database lives. When absent the store is memory-only.
    #[serde(default)]
    pub store: StoreConfig,

    /// Provisioned channel instances (read-only to the engine).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Messaging-gateway client settings.
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Task-board client settings.
    #[serde(default)]
    pub task_board: TaskBoardConfig,

    /// AI client settings.
    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,
}

/// HTTP bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 8085).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8085
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Queue settings. Exchange and routing key are fixed at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_routing_key")]
    pub routing_key: String,

    /// Buffered deliveries before publishers wait.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// How many times a failed delivery is redelivered before it is dead-lettered.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    /// Deliveries handled at once; the consumer stops pulling from the queue at this limit.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// How long shutdown keeps handling in-flight and follow-up deliveries before
    /// dead-lettering what is left.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_exchange() -> String {
    "parley.events".to_string()
}

fn default_routing_key() -> String {
    "parley.events.workflow".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_redeliveries() -> u32 {
    3
}

fn default_redelivery_delay_ms() -> u64 {
    500
}

fn default_max_in_flight() -> usize {
    32
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            routing_key: default_routing_key(),
            capacity: default_queue_capacity(),
            max_redeliveries: default_max_redeliveries(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            max_in_flight: default_max_in_flight(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl QueueConfig {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// SQLite database file. Relative paths are resolved against the config file's parent.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Channel instances known to this process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub instances: Vec<ChannelInstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInstanceConfig {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_instance_status")]
    pub status: String,
    pub group: ChannelGroupConfig,
}

fn default_instance_status() -> String {
    "open".to_string()
}

/// Tenant-level grouping: instances in a group share the gateway URL and credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelGroupConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Messaging-gateway client: base URL and login credentials for the bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingConfig {
    #[serde(default = "default_messaging_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Overridden by PARLEY_MESSAGING_PASSWORD env.
    #[serde(default)]
    pub password: Option<String>,
}

fn default_messaging_base_url() -> String {
    "http://127.0.0.1:8101".to_string()
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            base_url: default_messaging_base_url(),
            email: None,
            password: None,
        }
    }
}

/// Task-board GraphQL endpoint and target board/group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBoardConfig {
    #[serde(default = "default_task_board_url")]
    pub api_url: String,
    /// Overridden by PARLEY_TASK_BOARD_TOKEN env.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub board_id: String,
    #[serde(default)]
    pub group_id: String,
}

fn default_task_board_url() -> String {
    "https://api.monday.com/v2".to_string()
}

impl Default for TaskBoardConfig {
    fn default() -> Self {
        Self {
            api_url: default_task_board_url(),
            token: None,
            board_id: String::new(),
            group_id: String::new(),
        }
    }
}

/// OpenAI-compatible API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    /// Overridden by OPENAI_API_KEY env.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4.1".to_string()
}

fn default_transcription_model() -> String {
    "gpt-4o-transcribe".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: default_ai_base_url(),
            api_key: None,
            chat_model: default_chat_model(),
            transcription_model: default_transcription_model(),
        }
    }
}

/// Workflow knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    /// Upper bound for any single external call (gateway, task board, AI, queue publish).
    #[serde(default = "default_external_timeout_secs")]
    pub external_timeout_secs: u64,

    /// Title used when the AI client cannot improve the description.
    #[serde(default = "default_task_title")]
    pub default_task_title: String,
}

fn default_external_timeout_secs() -> u64 {
    30
}

fn default_task_title() -> String {
    "Task from chat".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            external_timeout_secs: default_external_timeout_secs(),
            default_task_title: default_task_title(),
        }
    }
}

impl WorkflowConfig {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs.max(1))
    }
}

/// Non-empty, trimmed value of an env var.
fn env_secret(var: &str) -> Option<String> {
    std::env::var(var).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_secret(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the messaging-gateway password: env PARLEY_MESSAGING_PASSWORD overrides config.
pub fn resolve_messaging_password(config: &Config) -> Option<String> {
    env_secret("PARLEY_MESSAGING_PASSWORD").or_else(|| config_secret(config.messaging.password.as_ref()))
}

/// Resolve the task-board token: env PARLEY_TASK_BOARD_TOKEN overrides config.
pub fn resolve_task_board_token(config: &Config) -> Option<String> {
    env_secret("PARLEY_TASK_BOARD_TOKEN").or_else(|| config_secret(config.task_board.token.as_ref()))
}

/// Resolve the AI API key: env OPENAI_API_KEY overrides config.
pub fn resolve_ai_api_key(config: &Config) -> Option<String> {
    env_secret("OPENAI_API_KEY").or_else(|| config_secret(config.ai.api_key.as_ref()))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".parley").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Default data directory: `data` subdirectory of the config file's parent.
pub fn data_dir(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("data")
}

/// Resolve the store database path, if persistence is configured. Relative paths are resolved against the config file's parent.
pub fn resolve_store_path(config: &Config, config_path: &Path) -> Option<PathBuf> {
    match &config.store.path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                Some(p.clone())
            } else {
                Some(config_parent(config_path).join(p))
            }
        }
        _ => None,
    }
}
