use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{ChatMessage, Role};

/// Fields shared by every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseEvent {
    /// Milliseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "rawEvent", skip_serializing_if = "Option::is_none")]
    pub raw_event: Option<Value>,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Interrupt,
}

/// Why a run paused and what the resolver needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub payload: Value,
}

impl InterruptInfo {
    pub fn new(reason: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            reason: reason.into(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// The events a run emits, in wire order. The `type` discriminator strings
/// are the protocol contract; variant names are free to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "RUN_STARTED")]
    RunStarted {
        #[serde(rename = "threadId")]
        thread_id: String,
        #[serde(rename = "runId")]
        run_id: String,
        #[serde(rename = "parentRunId", default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "RUN_FINISHED")]
    RunFinished {
        #[serde(rename = "threadId")]
        thread_id: String,
        #[serde(rename = "runId")]
        run_id: String,
        outcome: RunOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interrupt: Option<InterruptInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "RUN_ERROR")]
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "STEP_STARTED")]
    StepStarted {
        #[serde(rename = "stepName")]
        step_name: String,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "STEP_FINISHED")]
    StepFinished {
        #[serde(rename = "stepName")]
        step_name: String,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "TEXT_MESSAGE_START")]
    TextMessageStart {
        #[serde(rename = "messageId")]
        message_id: String,
        role: Role,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "TEXT_MESSAGE_CONTENT")]
    TextMessageContent {
        #[serde(rename = "messageId")]
        message_id: String,
        delta: String,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "TEXT_MESSAGE_END")]
    TextMessageEnd {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(flatten)]
        base: BaseEvent,
    },

    /// Start, content and end folded into one event. Consumers expand it.
    #[serde(rename = "TEXT_MESSAGE_CHUNK")]
    TextMessageChunk {
        #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "TOOL_CALL_START")]
    ToolCallStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolCallName")]
        tool_call_name: String,
        #[serde(rename = "parentMessageId", default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    /// A fragment of the call's JSON arguments.
    #[serde(rename = "TOOL_CALL_ARGS")]
    ToolCallArgs {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        delta: String,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "TOOL_CALL_END")]
    ToolCallEnd {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "TOOL_CALL_RESULT")]
    ToolCallResult {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "TOOL_CALL_CHUNK")]
    ToolCallChunk {
        #[serde(rename = "toolCallId", default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        #[serde(rename = "toolCallName", default, skip_serializing_if = "Option::is_none")]
        tool_call_name: Option<String>,
        #[serde(rename = "parentMessageId", default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "STATE_SNAPSHOT")]
    StateSnapshot {
        snapshot: Value,
        #[serde(flatten)]
        base: BaseEvent,
    },

    /// RFC 6902 operations against the last snapshot.
    #[serde(rename = "STATE_DELTA")]
    StateDelta {
        delta: Vec<Value>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "MESSAGES_SNAPSHOT")]
    MessagesSnapshot {
        messages: Vec<ChatMessage>,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "CUSTOM")]
    Custom {
        name: String,
        value: Value,
        #[serde(flatten)]
        base: BaseEvent,
    },

    #[serde(rename = "RAW")]
    Raw {
        event: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(flatten)]
        base: BaseEvent,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "RUN_STARTED",
    "RUN_FINISHED",
    "RUN_ERROR",
    "STEP_STARTED",
    "STEP_FINISHED",
    "TEXT_MESSAGE_START",
    "TEXT_MESSAGE_CONTENT",
    "TEXT_MESSAGE_END",
    "TEXT_MESSAGE_CHUNK",
    "TOOL_CALL_START",
    "TOOL_CALL_ARGS",
    "TOOL_CALL_END",
    "TOOL_CALL_RESULT",
    "TOOL_CALL_CHUNK",
    "STATE_SNAPSHOT",
    "STATE_DELTA",
    "MESSAGES_SNAPSHOT",
    "CUSTOM",
    "RAW",
];

impl Event {
    pub fn run_started(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Event::RunStarted {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            parent_run_id: None,
            input: None,
            base: BaseEvent::default(),
        }
    }

    pub fn run_finished(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        result: Option<Value>,
    ) -> Self {
        Event::RunFinished {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            outcome: RunOutcome::Success,
            interrupt: None,
            result,
            base: BaseEvent::default(),
        }
    }

    pub fn run_interrupted(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        interrupt: InterruptInfo,
    ) -> Self {
        Event::RunFinished {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            outcome: RunOutcome::Interrupt,
            interrupt: Some(interrupt),
            result: None,
            base: BaseEvent::default(),
        }
    }

    pub fn run_error(message: impl Into<String>, code: Option<String>) -> Self {
        Event::RunError {
            message: message.into(),
            code,
            base: BaseEvent::default(),
        }
    }

    pub fn step_started(step_name: impl Into<String>) -> Self {
        Event::StepStarted {
            step_name: step_name.into(),
            base: BaseEvent::default(),
        }
    }

    pub fn step_finished(step_name: impl Into<String>) -> Self {
        Event::StepFinished {
            step_name: step_name.into(),
            base: BaseEvent::default(),
        }
    }

    pub fn text_message_start(message_id: impl Into<String>) -> Self {
        Event::TextMessageStart {
            message_id: message_id.into(),
            role: Role::Assistant,
            base: BaseEvent::default(),
        }
    }

    pub fn text_message_content(message_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Event::TextMessageContent {
            message_id: message_id.into(),
            delta: delta.into(),
            base: BaseEvent::default(),
        }
    }

    pub fn text_message_end(message_id: impl Into<String>) -> Self {
        Event::TextMessageEnd {
            message_id: message_id.into(),
            base: BaseEvent::default(),
        }
    }

    pub fn tool_call_start(
        tool_call_id: impl Into<String>,
        tool_call_name: impl Into<String>,
        parent_message_id: Option<String>,
    ) -> Self {
        Event::ToolCallStart {
            tool_call_id: tool_call_id.into(),
            tool_call_name: tool_call_name.into(),
            parent_message_id,
            base: BaseEvent::default(),
        }
    }

    pub fn tool_call_args(tool_call_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Event::ToolCallArgs {
            tool_call_id: tool_call_id.into(),
            delta: delta.into(),
            base: BaseEvent::default(),
        }
    }

    pub fn tool_call_end(tool_call_id: impl Into<String>) -> Self {
        Event::ToolCallEnd {
            tool_call_id: tool_call_id.into(),
            base: BaseEvent::default(),
        }
    }

    pub fn tool_call_result(
        message_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Event::ToolCallResult {
            message_id: message_id.into(),
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            role: Some(Role::Tool),
            base: BaseEvent::default(),
        }
    }

    pub fn state_snapshot(snapshot: Value) -> Self {
        Event::StateSnapshot {
            snapshot,
            base: BaseEvent::default(),
        }
    }

    pub fn state_delta(delta: Vec<Value>) -> Self {
        Event::StateDelta {
            delta,
            base: BaseEvent::default(),
        }
    }

    pub fn messages_snapshot(messages: Vec<ChatMessage>) -> Self {
        Event::MessagesSnapshot {
            messages,
            base: BaseEvent::default(),
        }
    }

    pub fn custom(name: impl Into<String>, value: Value) -> Self {
        Event::Custom {
            name: name.into(),
            value,
            base: BaseEvent::default(),
        }
    }

    pub fn raw(event: Value, source: Option<String>) -> Self {
        Event::Raw {
            event,
            source,
            base: BaseEvent::default(),
        }
    }

    /// The wire discriminator.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "RUN_STARTED",
            Event::RunFinished { .. } => "RUN_FINISHED",
            Event::RunError { .. } => "RUN_ERROR",
            Event::StepStarted { .. } => "STEP_STARTED",
            Event::StepFinished { .. } => "STEP_FINISHED",
            Event::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Event::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            Event::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Event::TextMessageChunk { .. } => "TEXT_MESSAGE_CHUNK",
            Event::ToolCallStart { .. } => "TOOL_CALL_START",
            Event::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Event::ToolCallEnd { .. } => "TOOL_CALL_END",
            Event::ToolCallResult { .. } => "TOOL_CALL_RESULT",
            Event::ToolCallChunk { .. } => "TOOL_CALL_CHUNK",
            Event::StateSnapshot { .. } => "STATE_SNAPSHOT",
            Event::StateDelta { .. } => "STATE_DELTA",
            Event::MessagesSnapshot { .. } => "MESSAGES_SNAPSHOT",
            Event::Custom { .. } => "CUSTOM",
            Event::Raw { .. } => "RAW",
        }
    }

    /// `RUN_FINISHED` and `RUN_ERROR` close an invocation's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::RunFinished { .. } | Event::RunError { .. })
    }

    pub fn base(&self) -> &BaseEvent {
        match self {
            Event::RunStarted { base, .. }
            | Event::RunFinished { base, .. }
            | Event::RunError { base, .. }
            | Event::StepStarted { base, .. }
            | Event::StepFinished { base, .. }
            | Event::TextMessageStart { base, .. }
            | Event::TextMessageContent { base, .. }
            | Event::TextMessageEnd { base, .. }
            | Event::TextMessageChunk { base, .. }
            | Event::ToolCallStart { base, .. }
            | Event::ToolCallArgs { base, .. }
            | Event::ToolCallEnd { base, .. }
            | Event::ToolCallResult { base, .. }
            | Event::ToolCallChunk { base, .. }
            | Event::StateSnapshot { base, .. }
            | Event::StateDelta { base, .. }
            | Event::MessagesSnapshot { base, .. }
            | Event::Custom { base, .. }
            | Event::Raw { base, .. } => base,
        }
    }

    fn base_mut(&mut self) -> &mut BaseEvent {
        match self {
            Event::RunStarted { base, .. }
            | Event::RunFinished { base, .. }
            | Event::RunError { base, .. }
            | Event::StepStarted { base, .. }
            | Event::StepFinished { base, .. }
            | Event::TextMessageStart { base, .. }
            | Event::TextMessageContent { base, .. }
            | Event::TextMessageEnd { base, .. }
            | Event::TextMessageChunk { base, .. }
            | Event::ToolCallStart { base, .. }
            | Event::ToolCallArgs { base, .. }
            | Event::ToolCallEnd { base, .. }
            | Event::ToolCallResult { base, .. }
            | Event::ToolCallChunk { base, .. }
            | Event::StateSnapshot { base, .. }
            | Event::StateDelta { base, .. }
            | Event::MessagesSnapshot { base, .. }
            | Event::Custom { base, .. }
            | Event::Raw { base, .. } => base,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.base_mut().timestamp = Some(timestamp);
        self
    }

    /// Stamp with the current time unless already stamped.
    pub fn stamped(mut self) -> Self {
        let base = self.base_mut();
        if base.timestamp.is_none() {
            base.timestamp = Some(chrono::Utc::now().timestamp_millis());
        }
        self
    }

    pub fn with_raw_event(mut self, raw: Value) -> Self {
        self.base_mut().raw_event = Some(raw);
        self
    }

    /// Strict decode. Unknown discriminators are a protocol error.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value.get("type").and_then(Value::as_str) {
            None => Err(ProtocolError::Malformed("missing `type`".into())),
            Some(t) if !KNOWN_TYPES.contains(&t) => Err(ProtocolError::UnknownEventType(t.into())),
            Some(_) => {
                serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
            }
        }
    }

    /// Lenient decode. Unknown discriminators are wrapped in `RAW` instead of rejected.
    pub fn from_value_lenient(value: Value) -> Result<Self, ProtocolError> {
        match Self::from_value(value.clone()) {
            Err(ProtocolError::UnknownEventType(t)) => Ok(Event::raw(value, Some(t))),
            other => other,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
