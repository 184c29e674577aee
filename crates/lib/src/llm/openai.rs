//! OpenAI chat completions client (`POST {base}/chat/completions`).
//!
//! Supports function calling and `response_format: json_schema` for structured output.
//! Tool call ids from the model are carried through so tool results are matched exactly.

use crate::llm::{
    ChatMessage, ChatResponse, LlmBackend, LlmError, ResponseFormat, ToolCall, ToolCallFunction,
    ToolDefinition,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: Option<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        response_format: Option<&ResponseFormat>,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAiChatRequest {
            model: model.to_string(),
            messages: messages.iter().map(message_to_openai).collect(),
            tools: tools
                .filter(|t| !t.is_empty())
                .map(|t| t.iter().map(tool_definition_to_openai).collect()),
            response_format: response_format.map(|f| OpenAiResponseFormat {
                typ: "json_schema".to_string(),
                json_schema: OpenAiJsonSchema {
                    name: f.name.clone(),
                    schema: f.schema.clone(),
                    strict: true,
                },
            }),
        };
        log::debug!(
            "chat request: model={} messages={} tools={}",
            model,
            body.messages.len(),
            body.tools.as_ref().map(Vec::len).unwrap_or(0)
        );
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{} {}", status, body)));
        }
        let data: OpenAiChatResponse = res.json().await?;
        openai_response_to_chat_response(data)
    }
}

// --- wire types ---

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<OpenAiResponseFormat>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
enum OpenAiMessage {
    System { content: String },
    User { content: String },
    Assistant {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCallRef>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallRef {
    id: String,
    #[serde(rename = "type")]
    typ: &'static str,
    function: OpenAiToolCallFunctionRef,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallFunctionRef {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    typ: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    #[serde(rename = "type")]
    typ: String,
    json_schema: OpenAiJsonSchema,
}

#[derive(Debug, Serialize)]
struct OpenAiJsonSchema {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

fn message_to_openai(m: &ChatMessage) -> OpenAiMessage {
    match m.role.as_str() {
        "system" => OpenAiMessage::System {
            content: m.content.clone(),
        },
        "assistant" => OpenAiMessage::Assistant {
            content: m.content.clone(),
            tool_calls: m.tool_calls.as_ref().map(|tcs| {
                tcs.iter()
                    .map(|tc| OpenAiToolCallRef {
                        id: tc.id.clone(),
                        typ: "function",
                        function: OpenAiToolCallFunctionRef {
                            name: tc.function.name.clone(),
                            arguments: serde_json::to_string(&tc.function.arguments)
                                .unwrap_or_else(|_| "{}".to_string()),
                        },
                    })
                    .collect()
            }),
        },
        "tool" => OpenAiMessage::Tool {
            tool_call_id: m.tool_call_id.clone().unwrap_or_default(),
            content: m.content.clone(),
        },
        _ => OpenAiMessage::User {
            content: m.content.clone(),
        },
    }
}

fn tool_definition_to_openai(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        typ: t.typ.clone(),
        function: OpenAiToolFunction {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            parameters: t.function.parameters.clone(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Option<Vec<OpenAiChoice>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    refusal: Option<String>,
    tool_calls: Option<Vec<OpenAiResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseToolCall {
    id: Option<String>,
    function: Option<OpenAiResponseToolCallFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseToolCallFunction {
    name: Option<String>,
    arguments: Option<String>,
}

fn openai_response_to_chat_response(data: OpenAiChatResponse) -> Result<ChatResponse, LlmError> {
    let message = data
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message)
        .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))?;
    if let Some(refusal) = message.refusal.filter(|r| !r.is_empty()) {
        return Err(LlmError::Api(format!("model refused: {}", refusal)));
    }
    let tool_calls: Option<Vec<ToolCall>> = message.tool_calls.map(|tcs| {
        tcs.into_iter()
            .enumerate()
            .filter_map(|(i, tc)| {
                let f = tc.function?;
                let name = f.name?;
                Some(ToolCall {
                    id: tc.id.unwrap_or_else(|| format!("call_{}", i)),
                    function: ToolCallFunction {
                        name,
                        arguments: f
                            .arguments
                            .as_deref()
                            .and_then(|s| serde_json::from_str(s).ok())
                            .unwrap_or(serde_json::Value::Null),
                    },
                })
            })
            .collect()
    });
    Ok(ChatResponse {
        message: ChatMessage {
            tool_calls: tool_calls.filter(|t| !t.is_empty()),
            ..ChatMessage::assistant(message.content.unwrap_or_default())
        },
    })
}
