//! Channel registry: outbound handles looked up by platform id.
//!
//! Filled once at startup and read-only afterwards, so request tasks share it without locking.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{channel} request failed: {source}")]
    Request {
        channel: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{channel} api error: {status} {body}")]
    Api {
        channel: &'static str,
        status: u16,
        body: String,
    },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Handle to a chat platform's messaging API.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "chatwork").
    fn id(&self) -> &str;
    /// Post one text message to a destination (room id, response URL, ...).
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ChannelError>;
}

/// Registry of channel ids to handles.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    inner: HashMap<String, Arc<dyn ChannelHandle>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under its own id, replacing any previous one.
    pub fn register(&mut self, handle: Arc<dyn ChannelHandle>) {
        let id = handle.id().to_string();
        if self.inner.insert(id.clone(), handle).is_some() {
            log::debug!("channel registry: replaced handle for {}", id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelHandle>> {
        self.inner.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Turn a non-success response into `ChannelError::Api`.
pub(crate) async fn check_status(
    channel: &'static str,
    res: reqwest::Response,
) -> Result<(), ChannelError> {
    if res.status().is_success() {
        return Ok(());
    }
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    Err(ChannelError::Api {
        channel,
        status,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl ChannelHandle for Named {
        fn id(&self) -> &str {
            self.0
        }

        async fn send_message(&self, _destination: &str, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[test]
    fn register_and_lookup_by_id() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(Named("slack")));
        registry.register(Arc::new(Named("chatwork")));
        assert_eq!(registry.ids(), vec!["chatwork", "slack"]);
        assert_eq!(registry.get("slack").map(|h| h.id().to_string()).as_deref(), Some("slack"));
        assert!(registry.get("teams").is_none());
    }
}
