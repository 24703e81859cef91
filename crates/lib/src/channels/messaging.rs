//! Messaging-gateway client: send text, send the menu, fetch media.
//!
//! Every call needs a bearer token from the gateway's login endpoint. The token is cached
//! and refreshed once when a call comes back 401.

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Menu sent when a conversation starts.
pub const MENU_TEXT: &str = "Hello! Welcome to our service.\n\n\
Please choose an option:\n\n\
1 - Describe a request\n\
2 - End session\n\n\
Reply with the number of the option.";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("messaging gateway request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("messaging gateway api error: {0}")]
    Api(String),
    #[error("messaging gateway login failed: {0}")]
    Auth(String),
    #[error("invalid media payload: {0}")]
    Media(String),
}

/// Media file as returned by the gateway (content base64-encoded).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFile {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub mimetype: Option<String>,
    pub base64: String,
}

impl MediaFile {
    pub fn decode(&self) -> Result<Vec<u8>, GatewayError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.base64.trim())
            .map_err(|e| GatewayError::Media(e.to_string()))
    }
}

/// Outbound side of a channel instance.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Send a text message to a number through the given channel instance.
    async fn send_message(&self, number: &str, text: &str, instance_id: i64) -> Result<(), GatewayError>;

    async fn send_menu(&self, number: &str, instance_id: i64) -> Result<(), GatewayError> {
        self.send_message(number, MENU_TEXT, instance_id).await
    }

    /// Download the media attached to a gateway message.
    async fn get_media(&self, message_id: &str, instance_id: i64) -> Result<MediaFile, GatewayError>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    number: &'a str,
    message: &'a str,
    #[serde(rename = "evolutionInstanceId")]
    instance_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaRequest<'a> {
    message_id: &'a str,
    #[serde(rename = "evolutionInstanceId")]
    instance_id: i64,
    convert_to_mp4: bool,
}

/// HTTP client for the messaging gateway.
pub struct HttpMessagingGateway {
    base_url: String,
    email: String,
    password: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpMessagingGateway {
    pub fn new(base_url: &str, email: Option<String>, password: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.unwrap_or_default(),
            password: password.unwrap_or_default(),
            client: reqwest::Client::new(),
            token: RwLock::new(None),
        }
    }

    /// POST /api/auth/login to obtain a bearer token.
    async fn login(&self) -> Result<String, GatewayError> {
        let url = format!("{}/api/auth/login", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&LoginRequest {
                email: &self.email,
                password: &self.password,
            })
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GatewayError::Auth(format!("{} {}", status, body)));
        }
        let data: LoginResponse = res.json().await?;
        data.token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::Auth("empty token in login response".to_string()))
    }

    async fn token(&self, refresh: bool) -> Result<String, GatewayError> {
        if !refresh {
            if let Some(t) = self.token.read().await.clone() {
                return Ok(t);
            }
        }
        let token = self.login().await?;
        *self.token.write().await = Some(token.clone());
        log::debug!("messaging: obtained gateway token");
        Ok(token)
    }

    /// POST JSON with the bearer token; on 401 log in again and retry once.
    async fn post_authorized<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut refresh = false;
        loop {
            let token = self.token(refresh).await?;
            let res = self
                .client
                .post(&url)
                .bearer_auth(&token)
                .json(body)
                .send()
                .await?;
            if res.status() == StatusCode::UNAUTHORIZED && !refresh {
                log::debug!("messaging: token rejected, logging in again");
                refresh = true;
                continue;
            }
            if !res.status().is_success() {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                return Err(GatewayError::Api(format!("{} {}: {}", path, status, body)));
            }
            return Ok(res);
        }
    }
}

#[async_trait]
impl MessagingGateway for HttpMessagingGateway {
    async fn send_message(&self, number: &str, text: &str, instance_id: i64) -> Result<(), GatewayError> {
        let body = SendMessageRequest {
            number,
            message: text,
            instance_id,
        };
        self.post_authorized("/api/evolution/message", &body).await?;
        log::info!("messaging: message sent to {} via instance {}", number, instance_id);
        Ok(())
    }

    async fn get_media(&self, message_id: &str, instance_id: i64) -> Result<MediaFile, GatewayError> {
        let body = MediaRequest {
            message_id,
            instance_id,
            convert_to_mp4: false,
        };
        let res = self.post_authorized("/api/evolution/media", &body).await?;
        let media: MediaFile = res.json().await?;
        log::info!(
            "messaging: media {} retrieved ({}, {})",
            message_id,
            media.file_name,
            media.media_type
        );
        Ok(media)
    }
}
