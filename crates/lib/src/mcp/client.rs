//! Client for one tool server: handshake, tool listing, and tool calls over [`StdioTransport`].

use crate::mcp::transport::{StdioTransport, TransportError};
use crate::mcp::types::{InitializeResult, RemoteToolDef, ToolsCallResult, ToolsListResult, PROTOCOL_VERSION};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Upper bound on `tools/list` pages, in case a server keeps returning cursors.
const MAX_LIST_PAGES: usize = 16;

pub struct McpClient {
    server_name: String,
    transport: StdioTransport,
    closed: AtomicBool,
}

impl McpClient {
    /// Spawn the server and complete `initialize` + `notifications/initialized`.
    /// The child is killed if the handshake fails.
    pub async fn connect(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let transport = StdioTransport::spawn(server_name, command, args, env, request_timeout)
            .map_err(ConnectError::Spawn)?;
        let client = Self {
            server_name: server_name.to_string(),
            transport,
            closed: AtomicBool::new(false),
        };
        if let Err(e) = client.initialize().await {
            client.shutdown().await;
            return Err(ConnectError::Handshake(e));
        }
        Ok(client)
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "askbridge", "version": env!("CARGO_PKG_VERSION") }
        });
        let resp = self.transport.request("initialize", Some(params)).await?;
        let info: InitializeResult = resp
            .result
            .and_then(|r| serde_json::from_value(r).ok())
            .unwrap_or_default();
        log::info!(
            "tool server initialized: server={} remote={} protocol={}",
            self.server_name,
            info.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("?"),
            info.protocol_version.as_deref().unwrap_or("?")
        );
        self.transport.notify("notifications/initialized", None).await
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteToolDef>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let resp = self.transport.request("tools/list", params).await?;
            let page: ToolsListResult = resp
                .result
                .map(serde_json::from_value)
                .transpose()?
                .ok_or_else(|| TransportError::Closed("tools/list".to_string()))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        log::debug!("tool server tools: server={} count={}", self.server_name, tools.len());
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolsCallResult, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("tools/call".to_string()));
        }
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let resp = self
            .transport
            .request("tools/call", Some(json!({ "name": name, "arguments": arguments })))
            .await?;
        let result = resp
            .result
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| TransportError::Closed("tools/call".to_string()))?;
        Ok(result)
    }

    /// Kill the server process. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.kill().await;
        log::debug!("tool server stopped: server={}", self.server_name);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("{0}")]
    Spawn(TransportError),
    #[error("{0}")]
    Handshake(TransportError),
}
