//! Shared fakes for gateway integration tests: no child processes, no model provider,
//! and outbound messages recorded in memory.
#![allow(dead_code)]

use async_trait::async_trait;
use bridge::channels::{ChannelError, ChannelHandle, ChannelRegistry, CHATWORK_CHANNEL_ID, SLACK_CHANNEL_ID};
use bridge::config::Config;
use bridge::integrations::Integrations;
use bridge::llm::{ChatMessage, ChatResponse, LlmBackend, LlmError, ResponseFormat, ToolDefinition};
use bridge::mcp::types::RemoteToolDef;
use bridge::mcp::{ServerLauncher, ToolServer, ToolSessionError};
use bridge::pipeline::AppContext;
use bridge::tools::{ToolDescriptor, ToolError, ToolRegistry};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Answers every prompt with "echo: <last user message>" and never calls tools.
#[derive(Default)]
pub struct FakeBackend {
    pub calls: AtomicUsize,
}

#[async_trait]
impl LlmBackend for FakeBackend {
    async fn chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _format: Option<&ResponseFormat>,
    ) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(ChatResponse {
            message: ChatMessage::assistant(format!("echo: {}", last)),
        })
    }
}

struct IdleServer {
    name: String,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolServer for IdleServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolDef>, ToolError> {
        Ok(vec![serde_json::from_value(json!({"name": "noop"})).expect("tool def")])
    }

    async fn call_tool(&self, _tool: &str, _arguments: Value) -> Result<Value, ToolError> {
        Ok(json!("ok"))
    }

    async fn shutdown(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    pub launched: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, d: &ToolDescriptor) -> Result<Arc<dyn ToolServer>, ToolSessionError> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(IdleServer {
            name: d.name.clone(),
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Records `(destination, text)` for every message.
pub struct Recorder {
    id: &'static str,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    pub fn new(id: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: Mutex::default(),
        })
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("recorder lock").clone()
    }

    /// Poll until at least `n` messages were recorded or the timeout passes.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<(String, String)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let messages = self.messages();
            if messages.len() >= n || tokio::time::Instant::now() >= deadline {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl ChannelHandle for Recorder {
    fn id(&self) -> &str {
        self.id
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .expect("recorder lock")
            .push((destination.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct Fixture {
    pub ctx: Arc<AppContext>,
    pub backend: Arc<FakeBackend>,
    pub launcher: Arc<FakeLauncher>,
    pub chatwork: Arc<Recorder>,
    pub slack: Arc<Recorder>,
}

pub fn fixture(config: Config) -> Fixture {
    let backend = Arc::new(FakeBackend::default());
    let launcher = Arc::new(FakeLauncher::default());
    let chatwork = Recorder::new(CHATWORK_CHANNEL_ID);
    let slack = Recorder::new(SLACK_CHANNEL_ID);
    let mut channels = ChannelRegistry::new();
    channels.register(chatwork.clone());
    channels.register(slack.clone());
    let registry = ToolRegistry::from_config_with(&config, |_| Some("test-secret".to_string()));
    let integrations = Integrations::from_config(&config).expect("integrations");
    let ctx = AppContext::new(
        config,
        integrations,
        registry,
        launcher.clone(),
        backend.clone(),
        channels,
    );
    Fixture {
        ctx: Arc::new(ctx),
        backend,
        launcher,
        chatwork,
        slack,
    }
}
