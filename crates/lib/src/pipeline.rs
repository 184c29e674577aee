//! Per-event orchestration.
//!
//! `Accepted → InterimSent → SessionOpen → AgentRunning → Succeeded|Failed → FinalSent → SessionClosed`
//!
//! The interim notice is attempted before any tool server starts; exactly one terminal message
//! (answer or error report) follows; the tool session is closed last on every path, including
//! agent timeouts and panics inside the agent run.

use crate::agent::{self, AgentError, AgentRequest, AgentResponse};
use crate::channels::{ChannelRegistry, ChatworkChannel, InboundEvent, SlackChannel};
use crate::config::{self, Config};
use crate::dispatch::{Dispatcher, RetryPolicy};
use crate::filter::{self, FilterDecision};
use crate::integrations::{Integration, Integrations};
use crate::llm::{LlmBackend, OpenAiClient};
use crate::mcp::{ServerLauncher, StdioLauncher, ToolSession, ToolSessionError};
use crate::tools::{self, RegistryError, ToolRegistry};
use anyhow::Context;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Accepted,
    InterimSent,
    SessionOpen,
    AgentRunning,
    Succeeded,
    Failed,
    FinalSent,
    SessionClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    ToolSession(#[from] ToolSessionError),
    #[error("{0}")]
    Agent(#[from] AgentError),
    #[error("agent run panicked: {0}")]
    Panicked(String),
    #[error("no outbound channel registered for {0}")]
    NoChannel(String),
    #[error("session admission closed")]
    ShuttingDown,
}

/// What happened to one accepted event.
#[derive(Debug)]
pub struct Outcome {
    pub event_id: String,
    pub stages: Vec<Stage>,
    pub result: Result<AgentResponse, PipelineError>,
    /// Whether the terminal message was delivered.
    pub terminal_delivered: bool,
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Process-wide, read-only state shared by every request.
pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: ToolRegistry,
    pub launcher: Arc<dyn ServerLauncher>,
    pub backend: Arc<dyn LlmBackend>,
    pub channels: ChannelRegistry,
    pub integrations: Integrations,
    /// Admission control for tool sessions.
    pub sessions: Arc<Semaphore>,
    pub verify_token: Option<String>,
    pub chatwork_room: Option<String>,
}

impl AppContext {
    /// Assemble a context from explicit collaborators. Secrets are not read from the environment.
    pub fn new(
        config: Config,
        integrations: Integrations,
        registry: ToolRegistry,
        launcher: Arc<dyn ServerLauncher>,
        backend: Arc<dyn LlmBackend>,
        channels: ChannelRegistry,
    ) -> Self {
        let sessions = Arc::new(Semaphore::new(config.policy.session_permits()));
        let verify_token = config.gateway.verify_token.clone();
        let chatwork_room = config.channels.chatwork.room_id.clone();
        Self {
            config: Arc::new(config),
            registry,
            launcher,
            backend,
            channels,
            integrations,
            sessions,
            verify_token,
            chatwork_room,
        }
    }

    /// Production wiring: OpenAI backend, stdio tool servers, Chatwork and Slack channels,
    /// secrets resolved from the environment first.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let api_key = config::resolve_openai_api_key(&config)
            .context("OPENAI_API_KEY is not set (env or agent.apiKey in config)")?;
        let backend = Arc::new(OpenAiClient::new(config.agent.base_url.clone(), api_key));
        let registry = ToolRegistry::from_config(&config);
        let integrations = Integrations::from_config(&config).context("building integrations")?;

        for (kind, server) in integrations.referenced_servers() {
            match registry.get(server).map(|d| d.resolved_env()) {
                None => log::warn!("integration {} references unknown tool server {}", kind, server),
                Some(Err(key)) => log::warn!(
                    "tool server {} is missing credential {}; integration {} will fail until it is set",
                    server,
                    key,
                    kind
                ),
                Some(Ok(_)) => {}
            }
        }

        let mut channels = ChannelRegistry::new();
        let chatwork_token = config::resolve_chatwork_token(&config);
        if chatwork_token.is_none() {
            log::warn!("CHATWORK_API_TOKEN is not set; chatwork replies will fail");
        }
        channels.register(Arc::new(ChatworkChannel::new(
            chatwork_token,
            config.channels.chatwork.api_base.clone(),
        )));
        channels.register(Arc::new(SlackChannel::new()));

        let launcher = Arc::new(StdioLauncher {
            request_timeout: config.policy.tool_timeout(),
        });
        let verify_token = config::resolve_verify_token(&config);
        let chatwork_room = config::resolve_chatwork_room(&config);
        let mut ctx = Self::new(config, integrations, registry, launcher, backend, channels);
        ctx.verify_token = verify_token;
        ctx.chatwork_room = chatwork_room;
        Ok(ctx)
    }
}

struct StageTrace<'a> {
    event_id: &'a str,
    stages: Vec<Stage>,
}

impl<'a> StageTrace<'a> {
    fn new(event_id: &'a str) -> Self {
        Self {
            event_id,
            stages: Vec::with_capacity(8),
        }
    }

    fn enter(&mut self, stage: Stage) {
        log::debug!("pipeline: event_id={} stage={:?}", self.event_id, stage);
        self.stages.push(stage);
    }
}

/// A tool session together with the admission permit it holds.
#[derive(Default)]
struct SessionSlot {
    session: Option<ToolSession>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionSlot {
    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.permit = None;
    }
}

/// Open the session, run the agent with instrumented tools. The session stays in `slot`
/// for the caller to close.
async fn execute(
    ctx: &AppContext,
    integration: &Integration,
    prompt: &str,
    slot: &mut SessionSlot,
    trace: &mut StageTrace<'_>,
) -> Result<AgentResponse, PipelineError> {
    let descriptors = ctx.registry.select(&integration.servers)?;
    let permit = Arc::clone(&ctx.sessions)
        .acquire_owned()
        .await
        .map_err(|_| PipelineError::ShuttingDown)?;
    slot.permit = Some(permit);
    let session = slot
        .session
        .insert(ToolSession::open(&descriptors, ctx.launcher.as_ref()).await?);
    trace.enter(Stage::SessionOpen);

    let request = AgentRequest {
        instructions: integration.instructions.clone(),
        tools: tools::instrument(session.tools()),
        output_schema: integration.output_schema.clone(),
        input: integration.agent_input(prompt),
        model: integration.model.clone(),
    };
    trace.enter(Stage::AgentRunning);
    let response = agent::invoke_with_deadline(
        ctx.backend.as_ref(),
        request,
        ctx.config.policy.agent_timeout(),
    )
    .await?;
    Ok(response)
}

/// [`execute`] with any panic (launcher, tool wrapper, agent) turned into [`PipelineError::Panicked`].
async fn execute_guarded(
    ctx: &AppContext,
    integration: &Integration,
    prompt: &str,
    slot: &mut SessionSlot,
    trace: &mut StageTrace<'_>,
) -> Result<AgentResponse, PipelineError> {
    AssertUnwindSafe(execute(ctx, integration, prompt, slot, trace))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(PipelineError::Panicked(panic_message(panic.as_ref()))))
}

/// Run a message renderer, catching a panic as its message.
fn render<F: FnOnce() -> String>(f: F) -> Result<String, String> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(panic.as_ref()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run an event that already passed the filter.
pub async fn run_accepted(
    ctx: &AppContext,
    integration: &Integration,
    event: &InboundEvent,
    prompt: &str,
) -> Outcome {
    let event_id = uuid::Uuid::new_v4().to_string();
    let mut trace = StageTrace::new(&event_id);
    trace.enter(Stage::Accepted);
    log::info!(
        "event accepted: event_id={} integration={} platform={} channel={} message_id={} sender={}",
        event_id,
        integration.kind,
        event.platform,
        event.channel_id,
        event.message_id,
        event.sender_id
    );

    let Some(channel) = integration.channel.and_then(|id| ctx.channels.get(id)) else {
        let err = PipelineError::NoChannel(integration.kind.to_string());
        log::error!("event dropped: event_id={} error={}", event_id, err);
        let stages = trace.stages;
        return Outcome {
            event_id,
            stages,
            result: Err(err),
            terminal_delivered: false,
        };
    };
    let mut dispatcher = Dispatcher::new(
        channel,
        event.destination(),
        RetryPolicy::from(&ctx.config.policy),
    );

    // Delivery failures are logged by the dispatcher and never stop the pipeline.
    let _ = dispatcher.send_interim(&integration.interim_text(prompt)).await;
    trace.enter(Stage::InterimSent);

    let mut slot = SessionSlot::default();
    let rendered = execute_guarded(ctx, integration, prompt, &mut slot, &mut trace)
        .await
        .and_then(|response| {
            let text =
                render(|| integration.final_text(&response)).map_err(PipelineError::Panicked)?;
            Ok((response, text))
        });

    let (result, delivered) = match rendered {
        Ok((response, text)) => {
            trace.enter(Stage::Succeeded);
            let delivered = dispatcher.send_final(&text).await.is_ok();
            (Ok(response), delivered)
        }
        Err(e) => {
            trace.enter(Stage::Failed);
            log::warn!(
                "event failed: event_id={} integration={} error={}",
                event_id,
                integration.kind,
                e
            );
            let text = render(|| integration.error_text(&e))
                .unwrap_or_else(|_| format!("エラーが発生しました: {}", e));
            let delivered = dispatcher.send_error(&text).await.is_ok();
            (Err(e), delivered)
        }
    };
    trace.enter(Stage::FinalSent);

    slot.close().await;
    trace.enter(Stage::SessionClosed);
    log::info!(
        "event done: event_id={} ok={} delivered={}",
        event_id,
        result.is_ok(),
        delivered
    );
    let stages = trace.stages;
    Outcome {
        event_id,
        stages,
        result,
        terminal_delivered: delivered,
    }
}

/// Filter an event and run it if accepted. Ignored events produce no outcome and no messages.
pub async fn handle_event(
    ctx: &AppContext,
    integration: &Integration,
    event: InboundEvent,
) -> Option<Outcome> {
    match filter::evaluate(&event, &integration.rules) {
        FilterDecision::Accept { prompt } => Some(run_accepted(ctx, integration, &event, &prompt).await),
        FilterDecision::Ignore(reason) => {
            log::debug!(
                "event ignored: integration={} platform={} message_id={} reason={:?}",
                integration.kind,
                event.platform,
                event.message_id,
                reason
            );
            None
        }
    }
}

/// Run an accepted event on its own task. A supervisor awaits it so a panic is logged
/// instead of vanishing with the task.
pub fn spawn_supervised(
    ctx: Arc<AppContext>,
    integration: Arc<Integration>,
    event: InboundEvent,
    prompt: String,
) -> JoinHandle<Option<Outcome>> {
    let platform = event.platform.clone();
    let message_id = event.message_id.clone();
    let worker =
        tokio::spawn(async move { run_accepted(&ctx, &integration, &event, &prompt).await });
    tokio::spawn(async move {
        match worker.await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_panic() => {
                let panic = e.into_panic();
                log::error!(
                    "event task panicked: platform={} message_id={} panic={}",
                    platform,
                    message_id,
                    panic_message(panic.as_ref())
                );
                None
            }
            Err(e) => {
                log::warn!(
                    "event task cancelled: platform={} message_id={} error={}",
                    platform,
                    message_id,
                    e
                );
                None
            }
        }
    })
}

/// One-shot run without a chat channel (CLI). The session is closed before returning.
pub async fn invoke_once(
    ctx: &AppContext,
    integration: &Integration,
    prompt: &str,
) -> Result<AgentResponse, PipelineError> {
    let event_id = uuid::Uuid::new_v4().to_string();
    let mut trace = StageTrace::new(&event_id);
    trace.enter(Stage::Accepted);
    let mut slot = SessionSlot::default();
    let result = execute_guarded(ctx, integration, prompt, &mut slot, &mut trace).await;
    trace.enter(if result.is_ok() {
        Stage::Succeeded
    } else {
        Stage::Failed
    });
    slot.close().await;
    trace.enter(Stage::SessionClosed);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelError, ChannelHandle};
    use crate::config::PolicyConfig;
    use crate::integrations::IntegrationKind;
    use crate::llm::{
        ChatMessage, ChatResponse, LlmError, ResponseFormat, ToolCall, ToolCallFunction,
        ToolDefinition,
    };
    use crate::mcp::types::RemoteToolDef;
    use crate::mcp::ToolServer;
    use crate::tools::{ToolDescriptor, ToolError};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        launched: AtomicUsize,
        closed: AtomicUsize,
        calls: AtomicUsize,
        /// Per-query call delay overriding the launcher's.
        delays: Mutex<HashMap<String, Duration>>,
        /// "call <query>" and "close" in the order they happened.
        log: Mutex<Vec<String>>,
    }

    struct FakeServer {
        name: String,
        counters: Arc<Counters>,
        closed: AtomicUsize,
        call_delay: Duration,
    }

    #[async_trait]
    impl ToolServer for FakeServer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_tools(&self) -> Result<Vec<RemoteToolDef>, ToolError> {
            Ok(vec![serde_json::from_value(json!({"name": "ask", "inputSchema": {"type": "object"}})).unwrap()])
        }

        async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolError> {
            let query = arguments["q"].as_str().unwrap_or_default().to_string();
            let delay = self
                .counters
                .delays
                .lock()
                .unwrap()
                .get(&query)
                .copied()
                .unwrap_or(self.call_delay);
            tokio::time::sleep(delay).await;
            if self.closed.load(Ordering::SeqCst) > 0 {
                return Err(ToolError::Closed(tool.to_string()));
            }
            self.counters.calls.fetch_add(1, Ordering::SeqCst);
            self.counters.log.lock().unwrap().push(format!("call {}", query));
            Ok(json!(format!("{} result", self.name)))
        }

        async fn shutdown(&self) {
            if self.closed.fetch_add(1, Ordering::SeqCst) == 0 {
                self.counters.closed.fetch_add(1, Ordering::SeqCst);
                self.counters.log.lock().unwrap().push("close".to_string());
            }
        }
    }

    struct FakeLauncher {
        counters: Arc<Counters>,
        fail: Option<&'static str>,
        call_delay: Duration,
    }

    #[async_trait]
    impl ServerLauncher for FakeLauncher {
        async fn launch(&self, d: &ToolDescriptor) -> Result<Arc<dyn ToolServer>, ToolSessionError> {
            if self.fail == Some(d.name.as_str()) {
                return Err(ToolSessionError::Launch {
                    tool: d.name.clone(),
                    message: "spawn failed".into(),
                });
            }
            self.counters.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeServer {
                name: d.name.clone(),
                counters: Arc::clone(&self.counters),
                closed: AtomicUsize::new(0),
                call_delay: self.call_delay,
            }))
        }
    }

    struct PanickingLauncher;

    #[async_trait]
    impl ServerLauncher for PanickingLauncher {
        async fn launch(&self, _d: &ToolDescriptor) -> Result<Arc<dyn ToolServer>, ToolSessionError> {
            panic!("launcher exploded");
        }
    }

    /// Calls the first bound tool once, then answers with the tool output.
    #[derive(Default)]
    struct ToolThenAnswer {
        requests: AtomicUsize,
        fail_with: Option<String>,
        panic: bool,
        seen_tools: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl LlmBackend for ToolThenAnswer {
        async fn chat(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            tools: Option<&[ToolDefinition]>,
            _format: Option<&ResponseFormat>,
        ) -> Result<ChatResponse, LlmError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("backend exploded");
            }
            if let Some(msg) = &self.fail_with {
                return Err(LlmError::Api(msg.clone()));
            }
            let names: Vec<String> = tools
                .unwrap_or(&[])
                .iter()
                .map(|t| t.function.name.clone())
                .collect();
            self.seen_tools.lock().unwrap().push(names.clone());
            let last = messages.last().unwrap();
            if last.role == "tool" {
                return Ok(ChatResponse {
                    message: ChatMessage::assistant(format!("answer: {}", last.content)),
                });
            }
            let mut message = ChatMessage::assistant("");
            message.tool_calls = Some(vec![ToolCall {
                id: "call_1".into(),
                function: ToolCallFunction {
                    name: names[0].clone(),
                    arguments: json!({"q": last.content}),
                },
            }]);
            Ok(ChatResponse { message })
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelHandle for Recorder {
        fn id(&self) -> &str {
            "slack"
        }

        async fn send_message(&self, destination: &str, text: &str) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct Harness {
        ctx: Arc<AppContext>,
        counters: Arc<Counters>,
        backend: Arc<ToolThenAnswer>,
        channel: Arc<Recorder>,
    }

    fn harness(backend: ToolThenAnswer, fail: Option<&'static str>, call_delay: Duration) -> Harness {
        let mut config = Config::default();
        config.integrations.slack.servers = Some(vec!["search".into()]);
        config.policy = PolicyConfig {
            dispatch_retries: 0,
            ..PolicyConfig::default()
        };
        let mut registry = ToolRegistry::default();
        for name in ["search", "browser"] {
            registry.insert(ToolDescriptor {
                name: name.into(),
                command: "unused".into(),
                args: vec![],
                credentials: BTreeMap::new(),
            });
        }
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(backend);
        let channel = Arc::new(Recorder::default());
        let mut channels = ChannelRegistry::new();
        channels.register(channel.clone());
        let integrations = Integrations::from_config(&config).unwrap();
        let ctx = AppContext::new(
            config,
            integrations,
            registry,
            Arc::new(FakeLauncher {
                counters: Arc::clone(&counters),
                fail,
                call_delay,
            }),
            backend.clone(),
            channels,
        );
        Harness {
            ctx: Arc::new(ctx),
            counters,
            backend,
            channel,
        }
    }

    fn event(channel: &str, body: &str) -> InboundEvent {
        InboundEvent {
            platform: "slack".into(),
            channel_id: channel.into(),
            message_id: "m1".into(),
            sender_id: "u1".into(),
            body: body.into(),
            received_at: Utc::now(),
            reply_to: Some(format!("https://hooks.test/{}", channel)),
        }
    }

    fn slack(h: &Harness) -> Arc<Integration> {
        h.ctx.integrations.get(IntegrationKind::Slack).unwrap()
    }

    #[tokio::test]
    async fn accepted_event_runs_every_stage_in_order() {
        let h = harness(ToolThenAnswer::default(), None, Duration::ZERO);
        let outcome = handle_event(&h.ctx, &slack(&h), event("C1", "/askai what is the weather"))
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert!(outcome.terminal_delivered);
        assert_eq!(
            outcome.stages,
            vec![
                Stage::Accepted,
                Stage::InterimSent,
                Stage::SessionOpen,
                Stage::AgentRunning,
                Stage::Succeeded,
                Stage::FinalSent,
                Stage::SessionClosed
            ]
        );
        assert_eq!(h.backend.seen_tools.lock().unwrap()[0], vec!["search_ask"]);
        assert_eq!(h.counters.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters.closed.load(Ordering::SeqCst), 1);

        let sent = h.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "https://hooks.test/C1");
        assert!(sent[0].1.contains("what is the weather"));
        assert!(sent[0].1.contains("AIに問い合わせ中"));
        assert_eq!(sent[1].1, "```\nanswer: search result\n```");
    }

    #[tokio::test]
    async fn filtered_event_sends_nothing() {
        let h = harness(ToolThenAnswer::default(), None, Duration::ZERO);
        assert!(handle_event(&h.ctx, &slack(&h), event("C1", "/other hi")).await.is_none());
        assert!(h.channel.sent.lock().unwrap().is_empty());
        assert_eq!(h.counters.launched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_tool_server_reports_error_without_agent() {
        let h = harness(ToolThenAnswer::default(), Some("search"), Duration::ZERO);
        let outcome = handle_event(&h.ctx, &slack(&h), event("C1", "/askai hi")).await.unwrap();

        assert!(matches!(outcome.result, Err(PipelineError::ToolSession(_))));
        assert_eq!(h.backend.requests.load(Ordering::SeqCst), 0);
        assert!(!outcome.stages.contains(&Stage::AgentRunning));
        assert_eq!(outcome.stages.last(), Some(&Stage::SessionClosed));
        let sent = h.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.contains("エラーが発生しました"));
        assert!(sent[1].1.contains("search"));
    }

    #[tokio::test]
    async fn agent_error_is_reported_and_session_closed() {
        let backend = ToolThenAnswer {
            fail_with: Some("upstream 500".into()),
            ..Default::default()
        };
        let h = harness(backend, None, Duration::ZERO);
        let outcome = handle_event(&h.ctx, &slack(&h), event("C1", "/askai hi")).await.unwrap();

        assert!(matches!(outcome.result, Err(PipelineError::Agent(AgentError::Invocation(_)))));
        assert!(outcome.stages.contains(&Stage::Failed));
        assert_eq!(h.counters.closed.load(Ordering::SeqCst), 1);
        let sent = h.channel.sent.lock().unwrap();
        assert!(sent[1].1.contains("upstream 500"));
    }

    #[tokio::test]
    async fn panicking_agent_still_closes_session() {
        let backend = ToolThenAnswer {
            panic: true,
            ..Default::default()
        };
        let h = harness(backend, None, Duration::ZERO);
        let outcome = handle_event(&h.ctx, &slack(&h), event("C1", "/askai hi")).await.unwrap();

        assert!(matches!(&outcome.result, Err(PipelineError::Panicked(m)) if m == "backend exploded"));
        assert_eq!(h.counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn agent_deadline_is_enforced() {
        let mut h = harness(ToolThenAnswer::default(), None, Duration::from_secs(5));
        let config = Config {
            policy: PolicyConfig {
                agent_timeout_secs: 1,
                dispatch_retries: 0,
                ..PolicyConfig::default()
            },
            ..(*h.ctx.config).clone()
        };
        Arc::get_mut(&mut h.ctx).unwrap().config = Arc::new(config);
        let outcome = handle_event(&h.ctx, &slack(&h), event("C1", "/askai hi")).await.unwrap();
        assert!(matches!(outcome.result, Err(PipelineError::Agent(AgentError::Timeout(_)))));
        assert_eq!(h.counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_events_use_independent_sessions() {
        let h = harness(ToolThenAnswer::default(), None, Duration::from_millis(50));
        h.counters.delays.lock().unwrap().extend([
            ("fast".to_string(), Duration::from_millis(10)),
            ("slow".to_string(), Duration::from_millis(400)),
        ]);
        let a = spawn_supervised(h.ctx.clone(), slack(&h), event("C1", "/askai fast"), "fast".into());
        let b = spawn_supervised(h.ctx.clone(), slack(&h), event("C2", "/askai slow"), "slow".into());
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert!(a.succeeded() && b.succeeded());
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(b.result.unwrap(), AgentResponse::Text("answer: search result".into()));
        assert_eq!(h.counters.launched.load(Ordering::SeqCst), 2);
        assert_eq!(h.counters.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.counters.closed.load(Ordering::SeqCst), 2);

        // The fast event's session closed while the slow call was still in flight.
        let log = h.counters.log.lock().unwrap().clone();
        let first_close = log.iter().position(|e| e == "close").unwrap();
        let slow_call = log.iter().position(|e| e == "call slow").unwrap();
        assert!(first_close < slow_call, "{log:?}");

        let sent = h.channel.sent.lock().unwrap();
        assert_eq!(sent.iter().filter(|(d, _)| d.ends_with("C1")).count(), 2);
        assert_eq!(sent.iter().filter(|(d, _)| d.ends_with("C2")).count(), 2);
    }

    #[tokio::test]
    async fn panicking_launcher_still_gets_error_report() {
        let mut h = harness(ToolThenAnswer::default(), None, Duration::ZERO);
        Arc::get_mut(&mut h.ctx).unwrap().launcher = Arc::new(PanickingLauncher);
        let outcome = spawn_supervised(h.ctx.clone(), slack(&h), event("C1", "/askai hi"), "hi".into())
            .await
            .unwrap()
            .expect("worker returns an outcome");

        assert!(matches!(&outcome.result, Err(PipelineError::Panicked(m)) if m == "launcher exploded"));
        assert!(outcome.terminal_delivered);
        assert_eq!(outcome.stages.last(), Some(&Stage::SessionClosed));
        assert_eq!(h.backend.requests.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.ctx.sessions.available_permits(),
            h.ctx.config.policy.session_permits()
        );
        let sent = h.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.contains("エラーが発生しました"));
        assert!(sent[1].1.contains("launcher exploded"));
    }

    #[tokio::test]
    async fn invoke_once_closes_session() {
        let h = harness(ToolThenAnswer::default(), None, Duration::ZERO);
        let res = invoke_once(&h.ctx, &slack(&h), "hello").await.unwrap();
        assert_eq!(res, AgentResponse::Text("answer: search result".into()));
        assert_eq!(h.counters.closed.load(Ordering::SeqCst), 1);
        assert!(h.channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_server_is_reported() {
        let h = harness(ToolThenAnswer::default(), None, Duration::ZERO);
        let mut profile = (*slack(&h)).clone();
        profile.servers = vec!["nope".into()];
        let outcome = run_accepted(&h.ctx, &profile, &event("C1", "/askai hi"), "hi").await;
        assert!(matches!(outcome.result, Err(PipelineError::Registry(_))));
        assert_eq!(h.channel.sent.lock().unwrap().len(), 2);
    }
}
