//! Chatwork channel: webhook envelope parsing and room messages via the REST API.

use crate::channels::inbound::InboundEvent;
use crate::channels::registry::{check_status, ChannelError, ChannelHandle};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;

pub const CHATWORK_CHANNEL_ID: &str = "chatwork";
const CHATWORK_API_BASE: &str = "https://api.chatwork.com/v2";

/// Webhook POST body. Only `webhook_event` is required.
#[derive(Debug, Deserialize)]
pub struct ChatworkWebhook {
    #[serde(default)]
    pub webhook_event_type: Option<String>,
    #[serde(default)]
    pub webhook_event: Option<ChatworkEvent>,
}

#[derive(Debug, Deserialize)]
pub struct ChatworkEvent {
    #[serde(default)]
    pub message_id: Option<IdValue>,
    #[serde(default)]
    pub room_id: Option<IdValue>,
    /// `account_id` on room events, `from_account_id` on mention events.
    #[serde(default, alias = "from_account_id")]
    pub account_id: Option<IdValue>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub send_time: Option<i64>,
}

/// Chatwork ids arrive as numbers or strings depending on the field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Num(i64),
    Str(String),
}

impl std::fmt::Display for IdValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdValue::Num(n) => write!(f, "{}", n),
            IdValue::Str(s) => f.write_str(s),
        }
    }
}

impl ChatworkWebhook {
    /// Normalize into an InboundEvent. `fallback_room` is used when the event has no room_id.
    /// Errors name the missing part of the envelope.
    pub fn into_event(self, fallback_room: Option<&str>) -> Result<InboundEvent, String> {
        let event = self
            .webhook_event
            .ok_or_else(|| "missing webhook_event".to_string())?;
        let body = event.body.ok_or_else(|| "missing webhook_event.body".to_string())?;
        let channel_id = event
            .room_id
            .map(|r| r.to_string())
            .or_else(|| fallback_room.map(str::to_string))
            .ok_or_else(|| "missing webhook_event.room_id and no default room".to_string())?;
        let received_at = event
            .send_time
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(Utc::now);
        Ok(InboundEvent {
            platform: CHATWORK_CHANNEL_ID.to_string(),
            channel_id,
            message_id: event
                .message_id
                .map(|m| m.to_string())
                .unwrap_or_default(),
            sender_id: event
                .account_id
                .map(|a| a.to_string())
                .unwrap_or_default(),
            body,
            received_at,
            reply_to: None,
        })
    }
}

/// Chatwork connector: posts messages to rooms with the `X-ChatWorkToken` header.
pub struct ChatworkChannel {
    token: Option<String>,
    api_base: String,
    client: reqwest::Client,
}

impl ChatworkChannel {
    pub fn new(token: Option<String>, api_base: Option<String>) -> Self {
        let api_base = api_base
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| CHATWORK_API_BASE.to_string());
        Self {
            token,
            api_base,
            client: reqwest::Client::new(),
        }
    }

    /// POST /rooms/{room_id}/messages with a form-encoded body.
    pub async fn post_message(&self, room_id: &str, text: &str) -> Result<(), ChannelError> {
        let token = self
            .token
            .as_ref()
            .ok_or(ChannelError::NotConfigured("chatwork api token"))?;
        let url = format!("{}/rooms/{}/messages", self.api_base, room_id);
        let res = self
            .client
            .post(&url)
            .header("X-ChatWorkToken", token)
            .form(&[("body", text)])
            .send()
            .await
            .map_err(|source| ChannelError::Request {
                channel: CHATWORK_CHANNEL_ID,
                source,
            })?;
        check_status(CHATWORK_CHANNEL_ID, res).await
    }
}

#[async_trait]
impl ChannelHandle for ChatworkChannel {
    fn id(&self) -> &str {
        CHATWORK_CHANNEL_ID
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ChannelError> {
        self.post_message(destination, text).await
    }
}
