//! Inbound event from a chat platform, normalized for the filter and the pipeline.

use chrono::{DateTime, Utc};

/// One platform event. Built once by the ingress handler and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Source platform id (e.g. "chatwork", "slack").
    pub platform: String,
    /// Room / channel the event came from.
    pub channel_id: String,
    pub message_id: String,
    pub sender_id: String,
    /// Raw message text, including the trigger token.
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Where replies go when it differs from `channel_id` (Slack `response_url`).
    pub reply_to: Option<String>,
}

impl InboundEvent {
    /// Destination for outbound messages about this event.
    pub fn destination(&self) -> &str {
        self.reply_to.as_deref().unwrap_or(&self.channel_id)
    }
}
