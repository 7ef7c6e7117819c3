use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::ProtocolError;
use crate::events::{Event, InterruptInfo, RunOutcome};
use crate::types::{ChatMessage, Role, ToolCall};

/// How the last invocation on the stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Success { result: Option<Value> },
    Interrupt(InterruptInfo),
    Error { message: String, code: Option<String> },
}

/// Rebuilds messages, tool calls and shared state from an event stream, and
/// rejects streams that break the protocol's ordering rules.
///
/// One accumulator can follow a run across resumes: a new `RUN_STARTED`
/// after a terminal event opens the next invocation.
#[derive(Debug)]
pub struct RunAccumulator {
    messages: Vec<ChatMessage>,
    state: Value,
    open_text: HashSet<String>,
    open_calls: HashMap<String, ToolCall>,
    /// Parent message of every tool call seen.
    parents: HashMap<String, String>,
    seen_text: HashSet<String>,
    seen_calls: HashSet<String>,
    /// Id of the current chunked message or call, for chunks that omit it.
    chunk_text: Option<String>,
    chunk_call: Option<String>,
    started: bool,
    outcome: Option<TerminalOutcome>,
}

impl Default for RunAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl RunAccumulator {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            state: Value::Object(Default::default()),
            open_text: HashSet::new(),
            open_calls: HashMap::new(),
            parents: HashMap::new(),
            seen_text: HashSet::new(),
            seen_calls: HashSet::new(),
            chunk_text: None,
            chunk_call: None,
            started: false,
            outcome: None,
        }
    }

    /// Fold one event in. After an error the stream is broken; stop feeding it.
    pub fn apply(&mut self, event: &Event) -> Result<(), ProtocolError> {
        if let Event::RunStarted { .. } = event {
            if self.started && self.outcome.is_none() {
                return Err(ProtocolError::Malformed(
                    "RUN_STARTED while the previous invocation is still open".into(),
                ));
            }
            self.started = true;
            self.outcome = None;
            return Ok(());
        }
        if self.outcome.is_some() {
            return Err(ProtocolError::AfterTerminal {
                event: event.event_type().to_string(),
            });
        }

        match event {
            Event::RunStarted { .. } => {}
            Event::RunFinished { outcome, interrupt, result, .. } => {
                self.close_chunks()?;
                if let Some(id) = self.open_text.iter().next() {
                    return Err(ProtocolError::Unterminated { kind: "text message", id: id.clone() });
                }
                if let Some(id) = self.open_calls.keys().next() {
                    return Err(ProtocolError::Unterminated { kind: "tool call", id: id.clone() });
                }
                self.outcome = Some(match (outcome, interrupt) {
                    (RunOutcome::Interrupt, Some(info)) => TerminalOutcome::Interrupt(info.clone()),
                    (RunOutcome::Interrupt, None) => {
                        return Err(ProtocolError::Malformed(
                            "interrupt outcome without interrupt info".into(),
                        ))
                    }
                    (RunOutcome::Success, _) => TerminalOutcome::Success { result: result.clone() },
                });
            }
            Event::RunError { message, code, .. } => {
                self.outcome = Some(TerminalOutcome::Error {
                    message: message.clone(),
                    code: code.clone(),
                });
            }
            Event::StepStarted { .. } | Event::StepFinished { .. } => {}

            Event::TextMessageStart { message_id, role, .. } => {
                self.start_text(message_id, *role)?;
            }
            Event::TextMessageContent { message_id, delta, .. } => {
                self.append_text(message_id, delta)?;
            }
            Event::TextMessageEnd { message_id, .. } => {
                if !self.open_text.remove(message_id) {
                    return Err(ProtocolError::UnmatchedEnd {
                        kind: "text message",
                        id: message_id.clone(),
                    });
                }
            }
            Event::TextMessageChunk { message_id, role, delta, .. } => {
                let id = match (message_id, &self.chunk_text) {
                    (Some(id), _) => id.clone(),
                    (None, Some(current)) => current.clone(),
                    (None, None) => {
                        return Err(ProtocolError::Malformed(
                            "first TEXT_MESSAGE_CHUNK must carry a messageId".into(),
                        ))
                    }
                };
                if self.chunk_text.as_deref() != Some(id.as_str()) {
                    self.close_chunks()?;
                    self.start_text(&id, role.unwrap_or(Role::Assistant))?;
                    self.chunk_text = Some(id.clone());
                }
                if let Some(delta) = delta {
                    self.append_text(&id, delta)?;
                }
            }

            Event::ToolCallStart { tool_call_id, tool_call_name, parent_message_id, .. } => {
                self.start_call(tool_call_id, tool_call_name, parent_message_id.as_deref())?;
            }
            Event::ToolCallArgs { tool_call_id, delta, .. } => {
                self.append_args(tool_call_id, delta)?;
            }
            Event::ToolCallEnd { tool_call_id, .. } => self.end_call(tool_call_id)?,
            Event::ToolCallChunk { tool_call_id, tool_call_name, parent_message_id, delta, .. } => {
                let id = match (tool_call_id, &self.chunk_call) {
                    (Some(id), _) => id.clone(),
                    (None, Some(current)) => current.clone(),
                    (None, None) => {
                        return Err(ProtocolError::Malformed(
                            "first TOOL_CALL_CHUNK must carry a toolCallId".into(),
                        ))
                    }
                };
                if self.chunk_call.as_deref() != Some(id.as_str()) {
                    self.close_chunks()?;
                    let name = tool_call_name.as_deref().ok_or_else(|| {
                        ProtocolError::Malformed(format!("TOOL_CALL_CHUNK for {id} has no name"))
                    })?;
                    self.start_call(&id, name, parent_message_id.as_deref())?;
                    self.chunk_call = Some(id.clone());
                }
                if let Some(delta) = delta {
                    self.append_args(&id, delta)?;
                }
            }
            Event::ToolCallResult { message_id, tool_call_id, content, .. } => {
                self.close_chunks()?;
                if self.open_calls.contains_key(tool_call_id) {
                    return Err(ProtocolError::Malformed(format!(
                        "result for tool call {tool_call_id} before its end"
                    )));
                }
                self.messages
                    .push(ChatMessage::tool(tool_call_id, content).with_id(message_id));
            }

            Event::StateSnapshot { snapshot, .. } => self.state = snapshot.clone(),
            Event::StateDelta { delta, .. } => {
                let ops = delta
                    .iter()
                    .map(|op| serde_json::from_value(op.clone()))
                    .collect::<Result<Vec<json_patch::PatchOperation>, _>>()
                    .map_err(|e| ProtocolError::StatePatch(e.to_string()))?;
                let patch = json_patch::Patch(ops);
                let mut next = self.state.clone();
                json_patch::patch(&mut next, &patch)
                    .map_err(|e| ProtocolError::StatePatch(e.to_string()))?;
                self.state = next;
            }
            Event::MessagesSnapshot { messages, .. } => self.messages = messages.clone(),
            Event::Custom { .. } | Event::Raw { .. } => {}
        }
        Ok(())
    }

    fn start_text(&mut self, id: &str, role: Role) -> Result<(), ProtocolError> {
        if !self.seen_text.insert(id.to_string()) {
            return Err(ProtocolError::DuplicateId { kind: "text message", id: id.into() });
        }
        self.open_text.insert(id.to_string());
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.role = role;
        } else {
            self.messages.push(ChatMessage::new(role, "").with_id(id));
        }
        Ok(())
    }

    fn append_text(&mut self, id: &str, delta: &str) -> Result<(), ProtocolError> {
        if !self.open_text.contains(id) {
            return Err(ProtocolError::OrphanDelta { kind: "text message", id: id.into() });
        }
        if let Some(message) = self.messages.iter_mut().rev().find(|m| m.id == id) {
            message.content.push_str(delta);
        }
        Ok(())
    }

    fn start_call(&mut self, id: &str, name: &str, parent: Option<&str>) -> Result<(), ProtocolError> {
        if !self.seen_calls.insert(id.to_string()) {
            return Err(ProtocolError::DuplicateId { kind: "tool call", id: id.into() });
        }
        self.open_calls
            .insert(id.to_string(), ToolCall::new(id, name, ""));

        // Calls attach to their parent message, created on demand.
        let parent_id = parent.map(str::to_string).unwrap_or_else(|| format!("{id}_parent"));
        if !self.messages.iter().any(|m| m.id == parent_id) {
            self.messages
                .push(ChatMessage::assistant("").with_id(&parent_id));
        }
        self.parents.insert(id.to_string(), parent_id);
        Ok(())
    }

    fn append_args(&mut self, id: &str, delta: &str) -> Result<(), ProtocolError> {
        match self.open_calls.get_mut(id) {
            Some(call) => {
                call.arguments.push_str(delta);
                Ok(())
            }
            None => Err(ProtocolError::OrphanDelta { kind: "tool call", id: id.into() }),
        }
    }

    fn end_call(&mut self, id: &str) -> Result<(), ProtocolError> {
        let Some(call) = self.open_calls.get(id) else {
            return Err(ProtocolError::UnmatchedEnd { kind: "tool call", id: id.into() });
        };
        call.parsed_arguments()
            .map_err(|e| ProtocolError::InvalidArguments { id: id.into(), reason: e.to_string() })?;
        let call = self
            .open_calls
            .remove(id)
            .ok_or_else(|| ProtocolError::UnmatchedEnd { kind: "tool call", id: id.into() })?;
        let parent = self.parent_of(id);
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == parent) {
            message.tool_calls.push(call);
        }
        Ok(())
    }

    fn parent_of(&self, call_id: &str) -> String {
        self.parents
            .get(call_id)
            .cloned()
            .unwrap_or_else(|| format!("{call_id}_parent"))
    }

    /// Chunked messages and calls close implicitly when anything else starts.
    fn close_chunks(&mut self) -> Result<(), ProtocolError> {
        if let Some(id) = self.chunk_text.take() {
            self.open_text.remove(&id);
        }
        if let Some(id) = self.chunk_call.take() {
            self.end_call(&id)?;
        }
        Ok(())
    }

    // --- Views ---

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Concatenated assistant text of the conversation so far.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .collect()
    }

    /// Accumulated arguments of a tool call, open or closed.
    pub fn tool_arguments(&self, tool_call_id: &str) -> Option<&str> {
        if let Some(call) = self.open_calls.get(tool_call_id) {
            return Some(&call.arguments);
        }
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .find(|c| c.id == tool_call_id)
            .map(|c| c.arguments.as_str())
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn outcome(&self) -> Option<&TerminalOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn last_assistant_message_id(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.id.as_str())
    }
}
