//! Inbound message from the messaging gateway (webhook shape), as carried in event payloads.

use serde::Deserialize;
use serde_json::{Map, Value};

/// A message event as posted by the messaging gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default)]
    pub event: Option<String>,
    /// Channel instance name the message arrived on.
    pub instance: String,
    pub data: InboundData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundData {
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<Map<String, Value>>,
    #[serde(default)]
    pub message_type: Option<String>,
    /// Unix seconds; number or numeric string depending on gateway version.
    #[serde(default)]
    pub message_timestamp: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    /// Gateway message id; used to fetch media and to detect redelivered events.
    #[serde(default)]
    pub id: Option<String>,
}

impl InboundMessage {
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(payload.clone()))
    }

    pub fn remote_endpoint(&self) -> &str {
        &self.data.key.remote_jid
    }

    /// Dialable number for outbound calls (remote endpoint without its `@domain` suffix).
    pub fn number(&self) -> &str {
        endpoint_number(self.remote_endpoint())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.data.key.id.as_deref().filter(|s| !s.is_empty())
    }

    pub fn timestamp(&self) -> Option<i64> {
        match self.data.message_timestamp.as_ref()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn kind(&self) -> &str {
        self.data.message_type.as_deref().unwrap_or("unknown")
    }

    /// Plain text of the message: `conversation`, else `extendedTextMessage.text`.
    pub fn text(&self) -> Option<&str> {
        let message = self.data.message.as_ref()?;
        if let Some(s) = message.get("conversation").and_then(Value::as_str) {
            return Some(s);
        }
        message
            .get("extendedTextMessage")
            .and_then(|m| m.get("text"))
            .and_then(Value::as_str)
    }

    pub fn is_audio(&self) -> bool {
        self.data
            .message
            .as_ref()
            .is_some_and(|m| m.contains_key("audioMessage"))
    }
}

/// Strip the `@...` suffix of a remote endpoint (e.g. `5511999@s.whatsapp.net` -> `5511999`).
pub fn endpoint_number(remote_endpoint: &str) -> &str {
    match remote_endpoint.find('@') {
        Some(i) => &remote_endpoint[..i],
        None => remote_endpoint,
    }
}
