//! Messaging transport.
//!
//! The delivery path only ever talks to the `Transport` trait; the Telegram
//! Bot API implementation lives behind it. Error kinds follow the transport
//! contract: rate limiting carries `retry-after`, `unauthorized` and
//! `chat_not_found` are permanent for the chat.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TransportError;

/// Transport hard limit on one message.
pub const MESSAGE_LIMIT_BYTES: usize = 4096;

/// An inbound update (command intake).
#[derive(Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub from_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub text: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a Markdown message. Returns the transport message id.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, TransportError>;

    /// Long-poll for updates past `offset`.
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError>;
}

pub struct TelegramTransport {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramTransport {
    pub fn new(token: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("newsbrief/0.1 (+rss digest bot)")
            .connect_timeout(Duration::from_secs(4))
            // Long-poll friendly: per-request timeouts are set at call sites.
            .build()?;
        Ok(TelegramTransport {
            http,
            base_url: format!("https://api.telegram.org/bot{token}"),
        })
    }

    #[doc(hidden)]
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = base.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Serialize)]
struct SendMessageReq<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ApiParameters>,
}

#[derive(Deserialize)]
struct ApiParameters {
    retry_after: Option<u64>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Deserialize)]
struct RawUpdate {
    update_id: i64,
    message: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawMessage {
    chat: RawChat,
    from: Option<RawUser>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct RawChat {
    id: i64,
}

#[derive(Deserialize)]
struct RawUser {
    id: i64,
    username: Option<String>,
    first_name: Option<String>,
}

fn classify(code: Option<u16>, description: &str, retry_after: Option<u64>) -> TransportError {
    match code {
        Some(401) | Some(403) if description.contains("blocked") || description.contains("kicked") => {
            TransportError::ChatNotFound
        }
        Some(401) => TransportError::Unauthorized,
        Some(403) => TransportError::ChatNotFound,
        Some(400) if description.contains("chat not found") => TransportError::ChatNotFound,
        Some(400) if description.contains("too long") => TransportError::PayloadTooLarge,
        Some(413) => TransportError::PayloadTooLarge,
        Some(429) => TransportError::RateLimited {
            retry_after: retry_after.map(Duration::from_secs),
        },
        Some(c) if c >= 500 => TransportError::Transient(description.to_string()),
        _ => TransportError::Other(description.to_string()),
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, TransportError> {
        let req = SendMessageReq {
            chat_id,
            text,
            parse_mode: "Markdown",
            disable_web_page_preview: true,
        };
        let resp = self
            .http
            .post(format!("{}/sendMessage", self.base_url))
            .timeout(Duration::from_secs(15))
            .json(&req)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let env: ApiEnvelope<SentMessage> = resp
            .json()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        if env.ok {
            let id = env
                .result
                .map(|m| m.message_id)
                .ok_or_else(|| TransportError::Other("ok without result".to_string()))?;
            debug!(chat_id, message_id = id, "message sent");
            return Ok(id);
        }
        let description = env.description.unwrap_or_default();
        Err(classify(
            env.error_code,
            &description,
            env.parameters.and_then(|p| p.retry_after),
        ))
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        let mut payload = serde_json::json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(off) = offset {
            payload["offset"] = serde_json::json!(off);
        }

        let resp = self
            .http
            .post(format!("{}/getUpdates", self.base_url))
            .timeout(Duration::from_secs(timeout_secs + 10))
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let env: ApiEnvelope<Vec<RawUpdate>> = resp
            .json()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        if !env.ok {
            let description = env.description.unwrap_or_default();
            return Err(classify(
                env.error_code,
                &description,
                env.parameters.and_then(|p| p.retry_after),
            ));
        }

        Ok(env
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|u| Update {
                update_id: u.update_id,
                message: u.message.map(|m| IncomingMessage {
                    chat_id: m.chat.id,
                    from_id: m.from.as_ref().map(|f| f.id).unwrap_or(m.chat.id),
                    username: m.from.as_ref().and_then(|f| f.username.clone()),
                    first_name: m.from.and_then(|f| f.first_name),
                    text: m.text,
                }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(matches!(
            classify(Some(401), "Unauthorized", None),
            TransportError::Unauthorized
        ));
        assert!(matches!(
            classify(Some(400), "Bad Request: chat not found", None),
            TransportError::ChatNotFound
        ));
        assert!(matches!(
            classify(Some(403), "Forbidden: bot was blocked by the user", None),
            TransportError::ChatNotFound
        ));
        assert!(matches!(
            classify(Some(429), "Too Many Requests", Some(7)),
            TransportError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(7)
        ));
        assert!(matches!(
            classify(Some(502), "Bad Gateway", None),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify(Some(400), "Bad Request: message is too long", None),
            TransportError::PayloadTooLarge
        ));
    }
}
