//! Tool layer: the uniform `Tool` interface, the static registry of tool servers,
//! and the logging decorator applied to every tool handed to the agent.

mod logged;
mod registry;

pub use crate::llm::ToolDefinition;
pub use logged::{instrument, LoggedTool};
pub use registry::{RegistryError, ToolDescriptor, ToolRegistry};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool {tool} failed: {message}")]
    Failed { tool: String, message: String },
    #[error("tool {tool} transport error: {message}")]
    Transport { tool: String, message: String },
    #[error("tool {tool} timed out after {after:?}")]
    Timeout { tool: String, after: Duration },
    #[error("tool {0} is closed")]
    Closed(String),
}

/// A callable tool: name, schema for the model, and an async invocation on JSON input.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;
    async fn invoke(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tool({})", self.name())
    }
}

/// Tools bound to one agent invocation, keyed by exposed name.
pub type ToolSet = BTreeMap<String, Arc<dyn Tool>>;

/// Function-calling definitions for every tool in the set.
pub fn to_definitions(tools: &ToolSet) -> Vec<ToolDefinition> {
    tools
        .values()
        .map(|t| ToolDefinition::function(t.name(), t.description(), t.parameters_schema()))
        .collect()
}
