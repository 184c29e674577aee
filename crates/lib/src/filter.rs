//! Event filter: decide whether an inbound event should reach the agent.
//!
//! Rules, in order:
//! 1. the platform envelope must be present and complete, otherwise [`FilterError::MalformedEvent`];
//! 2. bodies carrying our own AI marker, or lacking the trigger token, are ignored silently;
//! 3. the text after the trigger is the prompt (an empty remainder is ignored too).
//!
//! [`evaluate`] is pure: same event and rules, same decision.

use crate::channels::{ChatworkWebhook, InboundEvent, SlackCommand, CHATWORK_CHANNEL_ID, SLACK_CHANNEL_ID};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("malformed {platform} event: {reason}")]
    MalformedEvent {
        platform: &'static str,
        reason: String,
    },
}

/// Per-integration filter rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRules {
    /// Command token that must appear in the body (e.g. "/ask").
    pub trigger: String,
    /// Marker carried by every message this system posts; bodies containing it are our own replies.
    pub ai_marker: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    SelfAuthored,
    MissingTrigger,
    EmptyPrompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept { prompt: String },
    Ignore(IgnoreReason),
}

impl FilterDecision {
    pub fn should_process(&self) -> bool {
        matches!(self, FilterDecision::Accept { .. })
    }

    pub fn prompt(&self) -> Option<&str> {
        match self {
            FilterDecision::Accept { prompt } => Some(prompt),
            FilterDecision::Ignore(_) => None,
        }
    }
}

/// Apply the marker and trigger rules to an event.
pub fn evaluate(event: &InboundEvent, rules: &FilterRules) -> FilterDecision {
    if !rules.ai_marker.is_empty() && event.body.contains(&rules.ai_marker) {
        return FilterDecision::Ignore(IgnoreReason::SelfAuthored);
    }
    let Some(rest) = after_trigger(&event.body, &rules.trigger) else {
        return FilterDecision::Ignore(IgnoreReason::MissingTrigger);
    };
    let prompt = rest.trim();
    if prompt.is_empty() {
        return FilterDecision::Ignore(IgnoreReason::EmptyPrompt);
    }
    FilterDecision::Accept {
        prompt: prompt.to_string(),
    }
}

/// Text after the first occurrence of `trigger` that stands as its own token
/// (so "/ask" does not match inside "/askai").
fn after_trigger<'a>(body: &'a str, trigger: &str) -> Option<&'a str> {
    if trigger.is_empty() {
        return Some(body);
    }
    let mut from = 0;
    while let Some(pos) = body[from..].find(trigger) {
        let start = from + pos;
        let end = start + trigger.len();
        let rest = &body[end..];
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            return Some(rest);
        }
        from = end;
    }
    None
}

/// Parse a Chatwork webhook body into an event.
pub fn chatwork_event(body: &[u8], fallback_room: Option<&str>) -> Result<InboundEvent, FilterError> {
    let hook: ChatworkWebhook =
        serde_json::from_slice(body).map_err(|e| FilterError::MalformedEvent {
            platform: CHATWORK_CHANNEL_ID,
            reason: e.to_string(),
        })?;
    hook.into_event(fallback_room)
        .map_err(|reason| FilterError::MalformedEvent {
            platform: CHATWORK_CHANNEL_ID,
            reason,
        })
}

/// Turn a Slack slash command into an event.
pub fn slack_event(command: SlackCommand, default_command: &str) -> Result<InboundEvent, FilterError> {
    command
        .into_event(default_command)
        .map_err(|reason| FilterError::MalformedEvent {
            platform: SLACK_CHANNEL_ID,
            reason,
        })
}
