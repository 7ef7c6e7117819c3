/// Top-level error for a run. Everything the engine or a consumer can fail with.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("run cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("no handler registered for interrupt reason {reason:?}")]
    UnhandledInterrupt { reason: String },
    #[error("interrupt for run {run_id} is stale")]
    StaleInterrupt { run_id: String },
    #[error("store error: {0}")]
    Store(String),
    #[error("approval error: {0}")]
    Approval(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl AgentError {
    /// Stable code carried on `RUN_ERROR` events.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Inference(InferenceError::ToolLoopExceeded { .. }) => "tool_loop_exceeded",
            AgentError::Inference(InferenceError::Cancelled) | AgentError::Cancelled => "cancelled",
            AgentError::Inference(_) => "provider_error",
            AgentError::Protocol(_) => "protocol_error",
            AgentError::InvalidState(_) => "invalid_state",
            AgentError::UnhandledInterrupt { .. } => "unhandled_interrupt",
            AgentError::StaleInterrupt { .. } => "stale_interrupt",
            AgentError::Store(_) | AgentError::Approval(_) | AgentError::Transport(_) => {
                "internal_error"
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            AgentError::Cancelled | AgentError::Inference(InferenceError::Cancelled)
        )
    }
}

/// Failures at the completion-provider boundary, including the middleware
/// layered on top of it.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("tool loop exceeded {limit} iterations")]
    ToolLoopExceeded { limit: usize },
    #[error("cancelled")]
    Cancelled,
}

/// A malformed or out-of-order event seen by a consumer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("{kind} end without matching start: {id}")]
    UnmatchedEnd { kind: &'static str, id: String },
    #[error("duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },
    #[error("{kind} delta for {id} outside its start/end")]
    OrphanDelta { kind: &'static str, id: String },
    #[error("arguments for tool call {id} are not valid JSON: {reason}")]
    InvalidArguments { id: String, reason: String },
    #[error("{event} received after the run finished")]
    AfterTerminal { event: String },
    #[error("run finished with {kind} {id} still open")]
    Unterminated { kind: &'static str, id: String },
    #[error("state patch failed: {0}")]
    StatePatch(String),
}
