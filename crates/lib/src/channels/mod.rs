//! Communication channels (Chatwork, Slack).
//!
//! Inbound payloads are normalized into [`InboundEvent`]; outbound messages go through a
//! [`ChannelHandle`] looked up in the [`ChannelRegistry`] by platform id.

mod chatwork;
mod inbound;
mod registry;
mod slack;

pub use chatwork::{ChatworkChannel, ChatworkEvent, ChatworkWebhook, CHATWORK_CHANNEL_ID};
pub use inbound::InboundEvent;
pub use registry::{ChannelError, ChannelHandle, ChannelRegistry};
pub use slack::{SlackChannel, SlackCommand, SLACK_CHANNEL_ID};
