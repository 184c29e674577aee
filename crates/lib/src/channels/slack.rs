//! Slack channel: slash-command payloads in, `response_url` posts out.

use crate::channels::inbound::InboundEvent;
use crate::channels::registry::{check_status, ChannelError, ChannelHandle};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

pub const SLACK_CHANNEL_ID: &str = "slack";

/// Form-encoded slash command body (subset of fields Slack sends).
#[derive(Debug, Default, Deserialize)]
pub struct SlackCommand {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub response_url: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub trigger_id: Option<String>,
}

impl SlackCommand {
    /// Normalize into an InboundEvent. The body is `"<command> <text>"` so the trigger rule
    /// applies uniformly; `default_command` stands in when Slack omits `command`.
    pub fn into_event(self, default_command: &str) -> Result<InboundEvent, String> {
        let text = self
            .text
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| "Prompt is required".to_string())?;
        let response_url = self
            .response_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| "missing response_url".to_string())?;
        let command = self
            .command
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| default_command.to_string());
        Ok(InboundEvent {
            platform: SLACK_CHANNEL_ID.to_string(),
            channel_id: self.channel_id.unwrap_or_default(),
            message_id: self.trigger_id.unwrap_or_default(),
            sender_id: self.user_id.unwrap_or_default(),
            body: format!("{} {}", command.trim(), text.trim()),
            received_at: Utc::now(),
            reply_to: Some(response_url),
        })
    }
}

/// Slack connector: posts `in_channel` messages to a slash command's response URL.
pub struct SlackChannel {
    client: reqwest::Client,
}

impl Default for SlackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SlackChannel {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelHandle for SlackChannel {
    fn id(&self) -> &str {
        SLACK_CHANNEL_ID
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({ "response_type": "in_channel", "text": text });
        let res = self
            .client
            .post(destination)
            .json(&body)
            .send()
            .await
            .map_err(|source| ChannelError::Request {
                channel: SLACK_CHANNEL_ID,
                source,
            })?;
        check_status(SLACK_CHANNEL_ID, res).await
    }
}
