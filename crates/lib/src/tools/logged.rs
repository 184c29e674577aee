//! Logging decorator for tools. Wraps any `Tool`, logs input before and output or error after,
//! and otherwise behaves exactly like the wrapped tool.

use super::{Tool, ToolError, ToolSet};
use async_trait::async_trait;
use std::sync::Arc;

pub struct LoggedTool<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: Tool + ?Sized> LoggedTool<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<T: Tool + ?Sized> Tool for LoggedTool<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.inner.parameters_schema()
    }

    async fn invoke(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let name = self.inner.name();
        log::info!("tool call: tool={} input={}", name, input);
        let started = std::time::Instant::now();
        match self.inner.invoke(input).await {
            Ok(output) => {
                log::info!(
                    "tool result: tool={} elapsed_ms={} output={}",
                    name,
                    started.elapsed().as_millis(),
                    output
                );
                Ok(output)
            }
            Err(e) => {
                log::warn!(
                    "tool error: tool={} elapsed_ms={} error={}",
                    name,
                    started.elapsed().as_millis(),
                    e
                );
                Err(e)
            }
        }
    }
}

/// Wrap every tool in the set; names and keys are unchanged.
pub fn instrument(tools: ToolSet) -> ToolSet {
    tools
        .into_iter()
        .map(|(name, tool)| {
            let logged: Arc<dyn Tool> = Arc::new(LoggedTool::new(tool));
            (name, logged)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "search_ask"
        }

        fn description(&self) -> &str {
            "echoes"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"q": {"type": "string"}}})
        }

        async fn invoke(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if input.get("fail").is_some() {
                return Err(ToolError::Failed {
                    tool: "search_ask".into(),
                    message: "boom".into(),
                });
            }
            Ok(json!({ "echo": input }))
        }
    }

    fn set(echo: Arc<Echo>) -> ToolSet {
        let tool: Arc<dyn Tool> = echo;
        ToolSet::from([("search_ask".to_string(), tool)])
    }

    #[tokio::test]
    async fn output_passes_through_unchanged() {
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        let tools = instrument(set(echo.clone()));
        let tool = &tools["search_ask"];
        assert_eq!(tool.name(), "search_ask");
        assert_eq!(tool.description(), "echoes");
        assert_eq!(tool.parameters_schema()["type"], "object");
        let out = tool.invoke(json!({"q": "rust"})).await.unwrap();
        assert_eq!(out, json!({"echo": {"q": "rust"}}));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_propagate_unchanged() {
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        let tools = instrument(set(echo));
        let err = tools["search_ask"].invoke(json!({"fail": true})).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { ref message, .. } if message == "boom"));
    }
}
