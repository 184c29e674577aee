//! Outbound Dispatcher: interim notice first, then exactly one terminal message per event.
//!
//! Every post is best-effort. Transient failures are retried with exponential backoff up to
//! the policy's limit, then logged and dropped; nothing here fails the request.

use crate::channels::{ChannelError, ChannelHandle};
use crate::config::PolicyConfig;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    Interim,
    Final,
    Error,
}

impl MessageRole {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageRole::Interim)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub body: String,
    pub role: MessageRole,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("delivery to {destination} failed after {attempts} attempts: {source}")]
    Delivery {
        destination: String,
        attempts: u32,
        #[source]
        source: ChannelError,
    },
    #[error("{0:?} message already sent for this event")]
    AlreadySent(MessageRole),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: u32,
    /// Delay before the first retry; doubles each time.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl From<&PolicyConfig> for RetryPolicy {
    fn from(policy: &PolicyConfig) -> Self {
        Self {
            retries: policy.dispatch_retries,
            backoff: policy.dispatch_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Connect failures, 5xx and 429 are retried. A transport error after the connection was
/// made may mean the message already arrived, so it is not retried.
fn is_retryable(err: &ChannelError) -> bool {
    match err {
        ChannelError::Request { source, .. } => source.is_connect(),
        ChannelError::Api { status, .. } => *status >= 500 || *status == 429,
        ChannelError::NotConfigured(_) => false,
    }
}

/// Dispatcher for one event's conversation.
pub struct Dispatcher {
    channel: Arc<dyn ChannelHandle>,
    destination: String,
    policy: RetryPolicy,
    interim_sent: bool,
    terminal_sent: bool,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn ChannelHandle>, destination: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            channel,
            destination: destination.into(),
            policy,
            interim_sent: false,
            terminal_sent: false,
        }
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    pub async fn send_interim(&mut self, text: &str) -> Result<(), DispatchError> {
        self.send(MessageRole::Interim, text).await
    }

    pub async fn send_final(&mut self, text: &str) -> Result<(), DispatchError> {
        self.send(MessageRole::Final, text).await
    }

    pub async fn send_error(&mut self, text: &str) -> Result<(), DispatchError> {
        self.send(MessageRole::Error, text).await
    }

    /// Post one message. The interim and terminal slots are each used at most once,
    /// counted as used on the first attempt whether or not delivery succeeds.
    pub async fn send(&mut self, role: MessageRole, text: &str) -> Result<(), DispatchError> {
        let slot = if role.is_terminal() {
            &mut self.terminal_sent
        } else {
            &mut self.interim_sent
        };
        if *slot {
            log::warn!(
                "dispatch refused: channel={} destination={} role={:?} reason=already sent",
                self.channel.id(),
                self.destination,
                role
            );
            return Err(DispatchError::AlreadySent(role));
        }
        *slot = true;
        let message = OutboundMessage {
            destination: self.destination.clone(),
            body: text.to_string(),
            role,
        };
        deliver(self.channel.as_ref(), &message, self.policy).await
    }
}

/// Post with retries; logs each failure.
pub async fn deliver(
    channel: &dyn ChannelHandle,
    message: &OutboundMessage,
    policy: RetryPolicy,
) -> Result<(), DispatchError> {
    let mut attempt: u32 = 0;
    loop {
        match channel.send_message(&message.destination, &message.body).await {
            Ok(()) => {
                log::info!(
                    "dispatched: channel={} destination={} role={:?} attempts={}",
                    channel.id(),
                    message.destination,
                    message.role,
                    attempt + 1
                );
                return Ok(());
            }
            Err(e) if attempt < policy.retries && is_retryable(&e) => {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "dispatch failed, retrying: channel={} role={:?} attempt={} delay_ms={} error={}",
                    channel.id(),
                    message.role,
                    attempt + 1,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                log::warn!(
                    "dispatch failed: channel={} destination={} role={:?} attempts={} error={}",
                    channel.id(),
                    message.destination,
                    message.role,
                    attempt + 1,
                    e
                );
                return Err(DispatchError::Delivery {
                    destination: message.destination.clone(),
                    attempts: attempt + 1,
                    source: e,
                });
            }
        }
    }
}
