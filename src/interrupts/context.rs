use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::Resumer;
use crate::engine::ResumeInput;
use crate::error::AgentError;
use crate::transport::{BoxEventStream, RunAccumulator};
use crate::types::{ChatMessage, Role, ToolCall, ToolResult};

/// What the agent is doing, as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    AwaitingApproval,
}

/// What an interrupt handler sees and may do while resolving one interrupt.
pub struct InterruptContext {
    thread_id: String,
    run_id: String,
    interrupt_id: Option<String>,
    messages: Vec<ChatMessage>,
    results: Mutex<Vec<ToolResult>>,
    resumer: Arc<dyn Resumer>,
    resumed: Mutex<Option<BoxEventStream>>,
    status: Arc<watch::Sender<AgentStatus>>,
}

impl InterruptContext {
    /// Snapshot the conversation reconstructed so far.
    pub fn new(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        interrupt_id: Option<String>,
        accumulator: &RunAccumulator,
        resumer: Arc<dyn Resumer>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            interrupt_id,
            messages: accumulator.messages().to_vec(),
            results: Mutex::new(Vec::new()),
            resumer,
            resumed: Mutex::new(None),
            status: Arc::new(watch::channel(AgentStatus::Working).0),
        }
    }

    /// Publish status changes on a shared channel instead of a private one.
    pub fn with_status(mut self, status: Arc<watch::Sender<AgentStatus>>) -> Self {
        self.status = status;
        self
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn interrupt_id(&self) -> Option<&str> {
        self.interrupt_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last_assistant_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// Tool calls the model made since the last user message, oldest first.
    /// A response can split into several assistant messages when text
    /// follows its calls, so this looks at all of them.
    pub fn current_turn_tool_calls(&self) -> Vec<&ToolCall> {
        let start = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .map_or(0, |i| i + 1);
        self.messages[start..]
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter())
            .collect()
    }

    pub fn last_assistant_message_id(&self) -> Option<&str> {
        self.last_assistant_message().map(|m| m.id.as_str())
    }

    /// True when the conversation or this context already holds a result for the call.
    pub fn has_result(&self, tool_call_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some(tool_call_id))
            || self
                .results
                .lock()
                .iter()
                .any(|r| r.tool_call_id == tool_call_id)
    }

    /// Queue a result to send with the next [`resume`](Self::resume).
    pub fn record_tool_result(&self, result: ToolResult) {
        self.results.lock().push(result);
    }

    pub fn tool_results(&self) -> Vec<ToolResult> {
        self.results.lock().clone()
    }

    pub fn set_status(&self, status: AgentStatus) {
        self.status.send_replace(status);
    }

    /// Continue the run with the recorded tool results and `payload`.
    pub async fn resume(&self, payload: Option<Value>) -> Result<(), AgentError> {
        let input = ResumeInput {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            interrupt_id: self.interrupt_id.clone(),
            tool_results: std::mem::take(&mut *self.results.lock()),
            payload,
        };
        debug!(
            run_id = %self.run_id,
            results = input.tool_results.len(),
            "resuming interrupted run"
        );
        self.set_status(AgentStatus::Working);
        let stream = self.resumer.resume(input).await?;
        *self.resumed.lock() = Some(stream);
        Ok(())
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.lock().is_some()
    }

    /// The continuation stream, if a handler resumed.
    pub fn take_resumed(&self) -> Option<BoxEventStream> {
        self.resumed.lock().take()
    }
}

impl std::fmt::Debug for InterruptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptContext")
            .field("thread_id", &self.thread_id)
            .field("run_id", &self.run_id)
            .field("interrupt_id", &self.interrupt_id)
            .field("messages", &self.messages.len())
            .field("resumed", &self.is_resumed())
            .finish()
    }
}
