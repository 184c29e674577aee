//! Stdio transport: one child process, newline-delimited JSON-RPC on stdin/stdout.
//!
//! A reader task routes responses to waiting callers by id. The child is killed when the
//! transport is shut down or dropped.

use crate::mcp::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("write to server failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("server closed before answering {0}")]
    Closed(String),
    #[error("server error on {method}: code={code} message={message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct StdioTransport {
    label: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn `command` with exactly `env` added to the inherited environment.
    pub fn spawn(
        label: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        log::info!("spawning tool server: server={} command={} args={:?}", label, command, args);
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Closed("spawn".to_string()));
        };
        if let Some(stderr) = child.stderr.take() {
            let label = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        log::debug!("tool server stderr: server={} {}", label, line.trim());
                    }
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(label.to_string(), stdout, Arc::clone(&pending)));

        Ok(Self {
            label: label.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Send a request and wait for its response. JSON-RPC errors become [`TransportError::Rpc`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut payload = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        payload.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        log::debug!("tool server request: server={} method={} id={}", self.label, method, id);

        if let Err(e) = self.write(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let resp = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(TransportError::Closed(method.to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(TransportError::Timeout {
                    method: method.to_string(),
                    after: self.request_timeout,
                });
            }
        };
        if let Some(err) = resp.error.clone() {
            return Err(TransportError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp)
    }

    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let mut payload = serde_json::to_string(&JsonRpcNotification {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        })?;
        payload.push('\n');
        self.write(&payload).await
    }

    async fn write(&self, payload: &str) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn is_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Stop the reader and kill the child. Safe to call more than once.
    pub async fn kill(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            log::debug!("tool server kill: server={} error={}", self.label, e);
        }
        // Dropping the senders wakes any caller still waiting.
        self.pending.lock().await.clear();
    }
}

async fn read_loop(label: String, stdout: tokio::process::ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let resp = match serde_json::from_str::<JsonRpcResponse>(line) {
                    Ok(resp) => resp,
                    Err(_) => {
                        log::debug!("tool server non-response line: server={} {}", label, line);
                        continue;
                    }
                };
                if let Some(method) = &resp.method {
                    log::debug!("tool server request ignored: server={} method={}", label, method);
                    continue;
                }
                let Some(id) = resp.id.as_u64() else {
                    continue;
                };
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => log::debug!("tool server response for unknown id: server={} id={}", label, id),
                }
            }
            Ok(None) => {
                log::debug!("tool server stdout closed: server={}", label);
                break;
            }
            Err(e) => {
                log::warn!("tool server read error: server={} error={}", label, e);
                break;
            }
        }
    }
    pending.lock().await.clear();
}
