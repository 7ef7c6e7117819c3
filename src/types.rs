use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Developer,
}

/// Non-text content attached to a message (images a tool produced, files).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mediaType")]
        media_type: String,
        /// Base64 payload or URL.
        data: String,
    },
}

/// A tool invocation requested by the model. `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parsed arguments. Empty arguments read as an empty object.
    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "toolCalls", default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(rename = "toolCallId", default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id("msg"),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            parts: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_parts(mut self, parts: Vec<ContentPart>) -> Self {
        self.parts = parts;
        self
    }
}

/// Outcome of one tool execution, ready to become a tool message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    pub content: String,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Errors are reported to the model as `{"error": ...}` so it can react.
    pub fn error(tool_call_id: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: serde_json::json!({ "error": message.as_ref() }).to_string(),
            is_error: true,
        }
    }

    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::tool(&self.tool_call_id, &self.content)
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Token usage for one or more inference calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Per-call model options. `tools` holds complete JSON tool definitions
/// (`name`, `description`, `input_schema`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
}

/// What came back from a full (non-streaming) call.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub stop_reason: StopReason,
    /// Messages appended on the way to this response (assistant turns and
    /// tool results from automatic tool invocation), oldest first.
    pub history: Vec<ChatMessage>,
}

impl ChatResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            stop_reason: StopReason::ToolUse,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// The assistant message this response represents.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::assistant(&self.text).with_tool_calls(self.tool_calls.clone())
    }

    /// Replay as the updates a streaming provider would have produced.
    pub fn into_updates(self) -> Vec<ResponseUpdate> {
        let mut updates = Vec::new();
        if !self.text.is_empty() {
            updates.push(ResponseUpdate::Text { delta: self.text });
        }
        for call in self.tool_calls {
            updates.push(ResponseUpdate::ToolCallStart {
                id: call.id.clone(),
                name: call.name,
            });
            if !call.arguments.is_empty() {
                updates.push(ResponseUpdate::ToolCallArgs {
                    id: call.id,
                    delta: call.arguments,
                });
            }
        }
        if self.usage != Usage::default() {
            updates.push(ResponseUpdate::Usage(self.usage));
        }
        updates.push(ResponseUpdate::Finished {
            stop_reason: self.stop_reason,
        });
        updates
    }
}

/// One increment of a streamed response. `Finished` closes a single model
/// response; a stream may carry several when tools are invoked in between.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseUpdate {
    Text { delta: String },
    ToolCallStart { id: String, name: String },
    ToolCallArgs { id: String, delta: String },
    ToolResult(ToolResult),
    Usage(Usage),
    Finished { stop_reason: StopReason },
}

impl ResponseUpdate {
    /// True for updates after which the current model response is complete.
    pub fn closes_response(&self) -> bool {
        matches!(self, ResponseUpdate::Finished { .. } | ResponseUpdate::ToolResult(_))
    }
}

/// Folds streamed updates back into a full response.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

impl ResponseBuilder {
    pub fn push(&mut self, update: &ResponseUpdate) {
        match update {
            ResponseUpdate::Text { delta } => self.text.push_str(delta),
            ResponseUpdate::ToolCallStart { id, name } => {
                self.tool_calls.push(ToolCall::new(id, name, ""));
            }
            ResponseUpdate::ToolCallArgs { id, delta } => {
                if let Some(call) = self.tool_calls.iter_mut().find(|c| &c.id == id) {
                    call.arguments.push_str(delta);
                }
            }
            ResponseUpdate::Usage(usage) => self.usage.accumulate(usage),
            ResponseUpdate::Finished { stop_reason } => self.stop_reason = Some(*stop_reason),
            ResponseUpdate::ToolResult(_) => {}
        }
    }

    pub fn finish(self) -> ChatResponse {
        let stop_reason = self.stop_reason.unwrap_or(if self.tool_calls.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        });
        ChatResponse {
            text: self.text,
            tool_calls: self.tool_calls,
            usage: self.usage,
            stop_reason,
            history: Vec::new(),
        }
    }
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}
