use std::collections::HashSet;

use tracing::{debug, warn};

use crate::events::Event;
use crate::types::{new_id, ChatMessage, ResponseUpdate, Role, ToolCall, ToolResult};

/// Turns provider updates into protocol events for one invocation, and
/// rebuilds the conversation messages those updates represent.
///
/// Each model response becomes one step and one assistant message. Text
/// closes before the first tool call of the response; tool calls close when
/// the response finishes. Tool results start a fresh message id.
///
/// Tool call ids are unique within a run: a call id the run has already
/// seen (a provider retry, say) is suppressed along with its arguments and
/// any repeated result.
pub(crate) struct EventTranslator {
    step: usize,
    step_open: bool,
    message_id: String,
    text_message_id: Option<String>,
    text: String,
    tool_calls: Vec<ToolCall>,
    open_calls: Vec<String>,
    completed: Vec<ChatMessage>,
    emitted_calls: HashSet<String>,
    emitted_results: HashSet<String>,
    suppressed: HashSet<String>,
}

impl EventTranslator {
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::for_history(&[])
    }

    /// Translator for a run whose conversation so far is `history`.
    pub(crate) fn for_history(history: &[ChatMessage]) -> Self {
        let emitted_calls = history
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
            .collect();
        let emitted_results = history
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        Self {
            step: 0,
            step_open: false,
            message_id: new_id("msg"),
            text_message_id: None,
            text: String::new(),
            tool_calls: Vec::new(),
            open_calls: Vec::new(),
            completed: Vec::new(),
            emitted_calls,
            emitted_results,
            suppressed: HashSet::new(),
        }
    }

    fn step_name(&self) -> String {
        format!("step_{}", self.step)
    }

    fn ensure_step(&mut self, events: &mut Vec<Event>) {
        if !self.step_open {
            self.step += 1;
            self.step_open = true;
            events.push(Event::step_started(self.step_name()));
        }
    }

    fn close_text(&mut self, events: &mut Vec<Event>) {
        if let Some(id) = self.text_message_id.take() {
            events.push(Event::text_message_end(id));
        }
    }

    pub(crate) fn translate(&mut self, update: ResponseUpdate) -> Vec<Event> {
        let mut events = Vec::new();
        match update {
            ResponseUpdate::Text { delta } => {
                if delta.is_empty() {
                    return events;
                }
                self.ensure_step(&mut events);
                let id = match self.text_message_id {
                    Some(ref id) => id.clone(),
                    None => {
                        // Text resuming after a tool call gets its own message id.
                        let id = if self.text.is_empty() && self.tool_calls.is_empty() {
                            self.message_id.clone()
                        } else {
                            new_id("msg")
                        };
                        events.push(Event::text_message_start(&id));
                        self.text_message_id = Some(id.clone());
                        id
                    }
                };
                self.text.push_str(&delta);
                events.push(Event::text_message_content(id, delta));
            }
            ResponseUpdate::ToolCallStart { id, name } => {
                if !self.emitted_calls.insert(id.clone()) {
                    debug!(tool_call_id = %id, "tool call id already used in this run, suppressing");
                    self.suppressed.insert(id);
                    return events;
                }
                self.ensure_step(&mut events);
                self.close_text(&mut events);
                events.push(Event::tool_call_start(&id, &name, Some(self.message_id.clone())));
                self.open_calls.push(id.clone());
                self.tool_calls.push(ToolCall::new(id, name, ""));
            }
            ResponseUpdate::ToolCallArgs { id, delta } => {
                if self.suppressed.contains(&id) {
                    return events;
                }
                if !self.open_calls.contains(&id) {
                    warn!(tool_call_id = %id, "arguments for a tool call that is not open, dropping");
                    return events;
                }
                if let Some(call) = self.tool_calls.iter_mut().find(|c| c.id == id) {
                    call.arguments.push_str(&delta);
                }
                if !delta.is_empty() {
                    events.push(Event::tool_call_args(id, delta));
                }
            }
            ResponseUpdate::Finished { .. } => self.close_response(&mut events),
            ResponseUpdate::ToolResult(result) => {
                self.close_response(&mut events);
                events.extend(self.tool_result(result));
            }
            ResponseUpdate::Usage(_) => {}
        }
        events
    }

    /// Event for a tool result produced outside the provider stream, or
    /// `None` when the call already has one.
    pub(crate) fn tool_result(&mut self, result: ToolResult) -> Option<Event> {
        if !self.emitted_results.insert(result.tool_call_id.clone()) {
            debug!(tool_call_id = %result.tool_call_id, "result already emitted, suppressing");
            return None;
        }
        let message_id = new_id("msg");
        self.completed
            .push(result.to_message().with_id(message_id.clone()));
        Some(Event::tool_call_result(message_id, result.tool_call_id, result.content))
    }

    fn close_response(&mut self, events: &mut Vec<Event>) {
        self.suppressed.clear();
        self.close_text(events);
        for id in std::mem::take(&mut self.open_calls) {
            // Argument-less calls still close on valid JSON.
            if let Some(call) = self.tool_calls.iter_mut().find(|c| c.id == id) {
                if call.arguments.trim().is_empty() {
                    call.arguments = "{}".into();
                    events.push(Event::tool_call_args(&id, "{}"));
                }
            }
            events.push(Event::tool_call_end(id));
        }
        if !self.text.is_empty() || !self.tool_calls.is_empty() {
            let message = ChatMessage {
                id: std::mem::replace(&mut self.message_id, new_id("msg")),
                role: Role::Assistant,
                content: std::mem::take(&mut self.text),
                tool_calls: std::mem::take(&mut self.tool_calls),
                tool_call_id: None,
                parts: Vec::new(),
            };
            self.completed.push(message);
        }
        if self.step_open {
            self.step_open = false;
            events.push(Event::step_finished(self.step_name()));
        }
    }

    /// Close anything still open when the provider stream ends.
    pub(crate) fn finish(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        self.close_response(&mut events);
        events
    }

    /// Messages completed since the last call.
    pub(crate) fn take_messages(&mut self) -> Vec<ChatMessage> {
        std::mem::take(&mut self.completed)
    }
}
