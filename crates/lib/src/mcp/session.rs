//! Tool Session Manager: the live tool servers for one request.
//!
//! A [`ToolSession`] is opened with every declared server or not at all, exposes the union of
//! their tools as `<server>_<tool>`, and is closed by the request that opened it on every path.

use crate::mcp::client::{ConnectError, McpClient};
use crate::mcp::transport::TransportError;
use crate::mcp::types::RemoteToolDef;
use crate::tools::{Tool, ToolDescriptor, ToolError, ToolSet};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ToolSessionError {
    #[error("tool server {tool}: missing credential {key}")]
    MissingCredential { tool: String, key: String },
    #[error("tool server {tool} failed to start: {message}")]
    Launch { tool: String, message: String },
    #[error("tool server {tool} handshake failed: {message}")]
    Handshake { tool: String, message: String },
    #[error("tool server {tool} failed to list tools: {message}")]
    ListTools { tool: String, message: String },
}

impl ToolSessionError {
    /// Name of the tool server the error is about.
    pub fn tool(&self) -> &str {
        match self {
            ToolSessionError::MissingCredential { tool, .. }
            | ToolSessionError::Launch { tool, .. }
            | ToolSessionError::Handshake { tool, .. }
            | ToolSessionError::ListTools { tool, .. } => tool,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Ready,
    InUse,
    Closing,
    Closed,
}

/// A connected tool server.
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;
    async fn list_tools(&self) -> Result<Vec<RemoteToolDef>, ToolError>;
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolError>;
    /// Release the connection. Must tolerate repeated calls.
    async fn shutdown(&self);
}

/// Starts tool servers from descriptors.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, descriptor: &ToolDescriptor) -> Result<Arc<dyn ToolServer>, ToolSessionError>;
}

/// Launches descriptors as stdio child processes.
#[derive(Debug, Clone)]
pub struct StdioLauncher {
    pub request_timeout: Duration,
}

#[async_trait]
impl ServerLauncher for StdioLauncher {
    async fn launch(&self, descriptor: &ToolDescriptor) -> Result<Arc<dyn ToolServer>, ToolSessionError> {
        let env = descriptor
            .resolved_env()
            .map_err(|key| ToolSessionError::MissingCredential {
                tool: descriptor.name.clone(),
                key,
            })?;
        let client = McpClient::connect(
            &descriptor.name,
            &descriptor.command,
            &descriptor.args,
            &env,
            self.request_timeout,
        )
        .await
        .map_err(|e| match e {
            ConnectError::Spawn(e) => ToolSessionError::Launch {
                tool: descriptor.name.clone(),
                message: e.to_string(),
            },
            ConnectError::Handshake(e) => ToolSessionError::Handshake {
                tool: descriptor.name.clone(),
                message: e.to_string(),
            },
        })?;
        Ok(Arc::new(client))
    }
}

fn tool_error(tool: &str, e: TransportError) -> ToolError {
    match e {
        TransportError::Timeout { after, .. } => ToolError::Timeout {
            tool: tool.to_string(),
            after,
        },
        TransportError::Closed(_) => ToolError::Closed(tool.to_string()),
        other => ToolError::Transport {
            tool: tool.to_string(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl ToolServer for McpClient {
    fn name(&self) -> &str {
        self.server_name()
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolDef>, ToolError> {
        McpClient::list_tools(self)
            .await
            .map_err(|e| tool_error(self.server_name(), e))
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolError> {
        let result = McpClient::call_tool(self, tool, arguments)
            .await
            .map_err(|e| tool_error(tool, e))?;
        if result.is_error {
            return Err(ToolError::Failed {
                tool: tool.to_string(),
                message: result.text(),
            });
        }
        Ok(result.into_value())
    }

    async fn shutdown(&self) {
        McpClient::shutdown(self).await
    }
}

/// One remote tool exposed through the uniform [`Tool`] interface.
struct SessionTool {
    exposed_name: String,
    remote_name: String,
    description: String,
    schema: Value,
    server: Arc<dyn ToolServer>,
}

#[async_trait]
impl Tool for SessionTool {
    fn name(&self) -> &str {
        &self.exposed_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn invoke(&self, input: Value) -> Result<Value, ToolError> {
        self.server
            .call_tool(&self.remote_name, input)
            .await
            .map_err(|e| match e {
                // Report under the name the model used.
                ToolError::Failed { message, .. } => ToolError::Failed {
                    tool: self.exposed_name.clone(),
                    message,
                },
                other => other,
            })
    }
}

/// `<server>_<tool>`, restricted to the characters function names allow.
fn exposed_name(server: &str, tool: &str) -> String {
    format!("{}_{}", server, tool)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

/// Live connections for one request.
pub struct ToolSession {
    id: String,
    servers: Vec<Arc<dyn ToolServer>>,
    tools: ToolSet,
    state: SessionState,
}

impl ToolSession {
    /// Launch every descriptor and list its tools. Any failure shuts down what was already
    /// started and fails the whole session.
    pub async fn open(
        descriptors: &[ToolDescriptor],
        launcher: &dyn ServerLauncher,
    ) -> Result<Self, ToolSessionError> {
        let id = uuid::Uuid::new_v4().to_string();
        log::debug!("tool session: id={} state={:?} servers={}", id, SessionState::Opening, descriptors.len());
        let mut servers: Vec<Arc<dyn ToolServer>> = Vec::with_capacity(descriptors.len());
        let mut tools = ToolSet::new();

        for descriptor in descriptors {
            let step = async {
                let server = launcher.launch(descriptor).await?;
                servers.push(Arc::clone(&server));
                let defs = server
                    .list_tools()
                    .await
                    .map_err(|e| ToolSessionError::ListTools {
                        tool: descriptor.name.clone(),
                        message: e.to_string(),
                    })?;
                Ok::<_, ToolSessionError>((server, defs))
            };
            let outcome = step.await;
            let (server, defs) = match outcome {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("tool session open failed: id={} tool={} error={}", id, e.tool(), e);
                    for s in &servers {
                        s.shutdown().await;
                    }
                    return Err(e);
                }
            };
            for def in defs {
                let name = exposed_name(server.name(), &def.name);
                if tools.contains_key(&name) {
                    log::warn!("tool session: id={} duplicate tool name {} ignored", id, name);
                    continue;
                }
                tools.insert(
                    name.clone(),
                    Arc::new(SessionTool {
                        exposed_name: name,
                        remote_name: def.name,
                        description: def.description.unwrap_or_default(),
                        schema: def.input_schema,
                        server: Arc::clone(&server),
                    }),
                );
            }
        }

        log::debug!("tool session: id={} state={:?} tools={}", id, SessionState::Ready, tools.len());
        Ok(Self {
            id,
            servers,
            tools,
            state: SessionState::Ready,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The callable surface of the session, keyed by exposed name.
    pub fn tools(&mut self) -> ToolSet {
        if self.state == SessionState::Ready {
            self.state = SessionState::InUse;
        }
        self.tools.clone()
    }

    /// Shut down every server. Calling again on a closed session does nothing.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        for server in &self.servers {
            server.shutdown().await;
        }
        self.tools.clear();
        self.state = SessionState::Closed;
        log::debug!("tool session: id={} state={:?}", self.id, self.state);
    }
}

impl Drop for ToolSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            // Child processes are still killed on drop; this only flags the missed close.
            log::warn!("tool session dropped without close: id={} state={:?}", self.id, self.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeServer {
        name: String,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolServer for FakeServer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_tools(&self) -> Result<Vec<RemoteToolDef>, ToolError> {
            Ok(vec![serde_json::from_value(json!({
                "name": "echo",
                "description": "echo input",
                "inputSchema": {"type": "object"}
            }))
            .unwrap()])
        }

        async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolError> {
            if self.shutdowns.load(Ordering::SeqCst) > 0 {
                return Err(ToolError::Closed(tool.to_string()));
            }
            Ok(json!({ "server": self.name, "tool": tool, "args": arguments }))
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        fail: Option<String>,
        shutdowns: Mutex<BTreeMap<String, Arc<AtomicUsize>>>,
    }

    impl FakeLauncher {
        fn shutdowns(&self, name: &str) -> usize {
            self.shutdowns.lock().unwrap()[name].load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServerLauncher for FakeLauncher {
        async fn launch(&self, d: &ToolDescriptor) -> Result<Arc<dyn ToolServer>, ToolSessionError> {
            if self.fail.as_deref() == Some(d.name.as_str()) {
                return Err(ToolSessionError::Launch {
                    tool: d.name.clone(),
                    message: "boom".into(),
                });
            }
            let counter = Arc::new(AtomicUsize::new(0));
            self.shutdowns
                .lock()
                .unwrap()
                .insert(d.name.clone(), Arc::clone(&counter));
            Ok(Arc::new(FakeServer {
                name: d.name.clone(),
                shutdowns: counter,
            }))
        }
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            command: "unused".into(),
            args: vec![],
            credentials: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn open_exposes_prefixed_tools_and_close_is_idempotent() {
        let launcher = FakeLauncher::default();
        let mut session = ToolSession::open(&[descriptor("search"), descriptor("crm")], &launcher)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        let tools = session.tools();
        assert_eq!(session.state(), SessionState::InUse);
        assert_eq!(tools.keys().collect::<Vec<_>>(), vec!["crm_echo", "search_echo"]);
        let out = tools["search_echo"].invoke(json!({"q": 1})).await.unwrap();
        assert_eq!(out["tool"], "echo");

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(launcher.shutdowns("search"), 1);
        assert_eq!(launcher.shutdowns("crm"), 1);
        assert!(matches!(
            tools["crm_echo"].invoke(json!({})).await,
            Err(ToolError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn one_failed_server_fails_the_session() {
        let launcher = FakeLauncher {
            fail: Some("browser".into()),
            ..Default::default()
        };
        let err = ToolSession::open(&[descriptor("search"), descriptor("browser")], &launcher)
            .await
            .err()
            .unwrap();
        assert_eq!(err.tool(), "browser");
        assert_eq!(launcher.shutdowns("search"), 1);
    }

    #[tokio::test]
    async fn missing_credential_is_reported_before_spawning() {
        let mut d = descriptor("search");
        d.command = "nonexistent_command_xyz_42".into();
        d.credentials.insert("PERPLEXITY_API_KEY".into(), None);
        let launcher = StdioLauncher {
            request_timeout: Duration::from_secs(1),
        };
        let err = ToolSession::open(&[d], &launcher).await.err().unwrap();
        assert_eq!(
            err,
            ToolSessionError::MissingCredential {
                tool: "search".into(),
                key: "PERPLEXITY_API_KEY".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_command_is_a_launch_error() {
        let mut d = descriptor("search");
        d.command = "nonexistent_command_xyz_42".into();
        let launcher = StdioLauncher {
            request_timeout: Duration::from_secs(1),
        };
        let err = ToolSession::open(&[d], &launcher).await.err().unwrap();
        assert!(matches!(err, ToolSessionError::Launch { .. }));
    }

    /// Minimal stdio tool server: refuses tool methods until `notifications/initialized`
    /// arrives, lists its tools over two pages, and answers `ask` with `$SEARCH_KEY`.
    const SCRIPTED_SERVER: &str = r#"
ready=0
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"scripted","version":"1"}}}\n' "$id"
      continue ;;
    *'"method":"notifications/initialized"'*)
      ready=1
      continue ;;
  esac
  if [ "$ready" != 1 ]; then
    printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32002,"message":"not initialized"}}\n' "$id"
    continue
  fi
  case "$line" in
    *'"method":"tools/list"'*'"cursor":"page-2"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"fail","description":"always fails","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"ask","description":"answers questions","inputSchema":{"type":"object","properties":{"q":{"type":"string"}}}}],"nextCursor":"page-2"}}\n' "$id" ;;
    *'"method":"tools/call"'*'"name":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"quota exceeded"}],"isError":true}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"answer from %s"}]}}\n' "$id" "$SEARCH_KEY" ;;
  esac
done
"#;

    fn scripted(name: &str, script: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            credentials: BTreeMap::from([("SEARCH_KEY".to_string(), Some("k-123".to_string()))]),
        }
    }

    #[tokio::test]
    async fn stdio_server_round_trip() {
        let launcher = StdioLauncher {
            request_timeout: Duration::from_secs(5),
        };
        let mut session = ToolSession::open(&[scripted("search", SCRIPTED_SERVER)], &launcher)
            .await
            .unwrap();
        let tools = session.tools();
        assert_eq!(tools.keys().collect::<Vec<_>>(), vec!["search_ask", "search_fail"]);
        assert_eq!(tools["search_ask"].description(), "answers questions");
        assert_eq!(tools["search_ask"].parameters_schema()["properties"]["q"]["type"], "string");

        let out = tools["search_ask"].invoke(json!({"q": "rust"})).await.unwrap();
        assert_eq!(out, json!("answer from k-123"));

        match tools["search_fail"].invoke(json!({})).await {
            Err(ToolError::Failed { tool, message }) => {
                assert_eq!(tool, "search_fail");
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected: {other:?}"),
        }

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            tools["search_ask"].invoke(json!({"q": "again"})).await,
            Err(ToolError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn rejected_initialize_is_a_handshake_error() {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32600,"message":"unsupported protocol"}}\n' "$id"
done
"#;
        let launcher = StdioLauncher {
            request_timeout: Duration::from_secs(5),
        };
        let err = ToolSession::open(&[scripted("search", script)], &launcher)
            .await
            .err()
            .unwrap();
        match err {
            ToolSessionError::Handshake { tool, message } => {
                assert_eq!(tool, "search");
                assert!(message.contains("unsupported protocol"), "{message}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn exposed_names_are_function_safe() {
        assert_eq!(exposed_name("perplexity-ask", "perplexity_ask"), "perplexity-ask_perplexity_ask");
        assert_eq!(exposed_name("a.b", "c d"), "a_b_c_d");
        assert_eq!(exposed_name(&"x".repeat(40), &"y".repeat(40)).len(), 64);
    }
}
