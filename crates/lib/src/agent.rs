//! Agent Invoker: one fresh, single-shot agent run per request.
//!
//! The model sees exactly the tools in the request; tool calls are executed and fed back until the
//! model answers or [`MAX_TOOL_ROUNDS`] is reached. With an output schema the answer must parse as
//! JSON and validate, otherwise the run fails. No retries here; callers decide.

use crate::llm::{ChatMessage, LlmBackend, LlmError, ResponseFormat, ToolCall};
use crate::tools::{self, ToolSet};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Model round-trips allowed per invocation.
pub const MAX_TOOL_ROUNDS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    Invocation(#[from] LlmError),
    #[error("response does not match schema {schema}: {details}")]
    SchemaValidation { schema: String, details: String },
    #[error("agent did not finish within {0} tool rounds")]
    ToolLoopExhausted(usize),
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid output schema: {0}")]
    InvalidSchema(String),
}

/// A `{role, content}` conversation turn supplied as input.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentInput {
    Text(String),
    Turns(Vec<Turn>),
}

/// Compiled structured-output contract.
#[derive(Clone)]
pub struct OutputSchema {
    name: String,
    schema: Value,
    compiled: Arc<JSONSchema>,
}

impl fmt::Debug for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSchema")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

impl OutputSchema {
    pub fn new(name: impl Into<String>, schema: Value) -> Result<Self, AgentError> {
        let compiled =
            JSONSchema::compile(&schema).map_err(|e| AgentError::InvalidSchema(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            schema,
            compiled: Arc::new(compiled),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Every violation, rendered as `<path>: <message>`.
    pub fn validate(&self, instance: &Value) -> Result<(), Vec<String>> {
        self.compiled.validate(instance).map_err(|errors| {
            errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect()
        })
    }
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub instructions: String,
    pub tools: ToolSet,
    pub output_schema: Option<OutputSchema>,
    pub input: AgentInput,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponse {
    Text(String),
    Structured(Value),
}

fn initial_messages(request: &AgentRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if !request.instructions.trim().is_empty() {
        messages.push(ChatMessage::system(request.instructions.clone()));
    }
    match &request.input {
        AgentInput::Text(text) => messages.push(ChatMessage::user(text.clone())),
        AgentInput::Turns(turns) => messages.extend(turns.iter().map(|t| match t.role.as_str() {
            "system" => ChatMessage::system(t.content.clone()),
            "assistant" => ChatMessage::assistant(t.content.clone()),
            _ => ChatMessage::user(t.content.clone()),
        })),
    }
    messages
}

/// Run a tool call against the bound set. Failures become `error: ...` text for the model.
async fn execute_call(tools: &ToolSet, call: &ToolCall) -> String {
    let name = call.function.name.as_str();
    let Some(tool) = tools.get(name) else {
        log::warn!("agent: model requested unbound tool {}", name);
        return format!("error: unknown tool {}", name);
    };
    let args = match &call.function.arguments {
        Value::Null => Value::Object(Default::default()),
        v => v.clone(),
    };
    match tool.invoke(args).await {
        Ok(Value::String(s)) => s,
        Ok(v) => v.to_string(),
        Err(e) => format!("error: {}", e),
    }
}

/// Strip a surrounding ```json fence if the model added one.
fn strip_code_fence(content: &str) -> &str {
    let t = content.trim();
    let Some(inner) = t.strip_prefix("```") else {
        return t;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn finish(content: &str, schema: Option<&OutputSchema>) -> Result<AgentResponse, AgentError> {
    let Some(schema) = schema else {
        return Ok(AgentResponse::Text(content.trim().to_string()));
    };
    let value: Value = serde_json::from_str(strip_code_fence(content)).map_err(|e| {
        AgentError::SchemaValidation {
            schema: schema.name.clone(),
            details: format!("not valid JSON: {}", e),
        }
    })?;
    schema
        .validate(&value)
        .map_err(|details| AgentError::SchemaValidation {
            schema: schema.name.clone(),
            details: details.join("; "),
        })?;
    Ok(AgentResponse::Structured(value))
}

/// Single attempt: build the conversation, loop over tool calls, return the final answer.
pub async fn invoke(backend: &dyn LlmBackend, request: AgentRequest) -> Result<AgentResponse, AgentError> {
    let definitions = tools::to_definitions(&request.tools);
    let tool_defs = (!definitions.is_empty()).then_some(definitions.as_slice());
    let response_format = request.output_schema.as_ref().map(|s| ResponseFormat {
        name: s.name.clone(),
        schema: s.schema.clone(),
    });
    let mut messages = initial_messages(&request);
    log::info!(
        "agent: model={} tools={} structured={}",
        request.model,
        request.tools.len(),
        request.output_schema.is_some()
    );

    for round in 0..MAX_TOOL_ROUNDS {
        let res = backend
            .chat(&request.model, &messages, tool_defs, response_format.as_ref())
            .await?;
        let calls = res.tool_calls().to_vec();
        if calls.is_empty() {
            log::debug!("agent: answered after {} tool rounds", round);
            return finish(res.content(), request.output_schema.as_ref());
        }
        messages.push(res.message);
        for call in &calls {
            let output = execute_call(&request.tools, call).await;
            messages.push(ChatMessage::tool(call.id.clone(), output));
        }
    }
    Err(AgentError::ToolLoopExhausted(MAX_TOOL_ROUNDS))
}

/// [`invoke`] bounded by a hard deadline.
pub async fn invoke_with_deadline(
    backend: &dyn LlmBackend,
    request: AgentRequest,
    deadline: Duration,
) -> Result<AgentResponse, AgentError> {
    tokio::time::timeout(deadline, invoke(backend, request))
        .await
        .map_err(|_| AgentError::Timeout(deadline))?
}
