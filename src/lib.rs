pub mod context;
mod emitter;
pub mod engine;
pub mod error;
pub mod events;
pub mod inference;
pub mod interrupts;
pub mod middleware;
pub mod provider;
pub mod resources;
pub mod store;
pub mod tools;
pub mod transport;
pub mod types;

use serde::Deserialize;
use tracing::warn;

pub use context::{RequestContext, RuntimeContent, UsageRecord};
pub use engine::{pending_tool_calls, ResumeInput, RunEngine, RunInput, RunReport};
pub use error::{AgentError, InferenceError, ProtocolError};
pub use events::{BaseEvent, Event, InterruptInfo, RunOutcome};
pub use inference::OpenAiProvider;
pub use interrupts::{
    AgentStatus, ApprovalDecision, ApprovalRequest, ApprovalSurface, ChannelApprovalSurface,
    DefaultInterruptHandler, EngineResumer, HumanApprovalHandler, InterruptContext,
    InterruptHandler, InterruptRegistry, PendingApproval, Resumer, RunDriver,
    ToolExecutionHandler,
};
pub use middleware::{
    standard_pipeline, ContextInjectionMiddleware, FunctionInvocationMiddleware, Middleware,
    PipelineBuilder, UsageTrackingMiddleware,
};
pub use provider::{CompletionProvider, ResponseStream};
pub use resources::{
    ContextLookupTool, ContextResolver, ContextResource, InjectionMode, StaticContextResolver,
};
pub use store::{FileRunStore, InMemoryRunStore, RunState, RunStatus, RunStore};
pub use tools::{ExecutionSite, ToolExecutor, ToolHandler, ToolRegistry, ToolResolution};
pub use transport::{
    event_channel, EventSink, EventStream, HttpAgentClient, RunAccumulator, TerminalOutcome,
};
pub use types::{
    ChatMessage, ChatOptions, ChatResponse, ContentPart, ResponseUpdate, Role, StopReason,
    ToolCall, ToolResult, Usage,
};

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Passed to the provider when the caller doesn't pick one.
    pub model: String,
    pub max_tokens: u32,
    /// Model calls allowed per run invocation before the tool loop gives up.
    pub max_tool_iterations: usize,
    /// How long an interrupt may wait for its resume.
    pub stale_interrupt_after_secs: u64,
    /// Emit `MESSAGES_SNAPSHOT` before every terminal event.
    pub emit_messages_snapshot: bool,
    /// Events buffered between a run and its consumer.
    pub event_buffer: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            max_tokens: 4096,
            max_tool_iterations: 10,
            stale_interrupt_after_secs: 86_400,
            emit_messages_snapshot: false,
            event_buffer: 64,
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `AGUI_*` environment variables. Unparseable
    /// values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_var(&lookup, "AGUI_MAX_TOOL_ITERATIONS") {
            config.max_tool_iterations = v;
        }
        if let Some(v) = parse_var(&lookup, "AGUI_STALE_INTERRUPT_SECS") {
            config.stale_interrupt_after_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "AGUI_EMIT_MESSAGES_SNAPSHOT") {
            config.emit_messages_snapshot = v;
        }
        if let Some(v) = parse_var(&lookup, "AGUI_EVENT_BUFFER") {
            config.event_buffer = v;
        }
        config
    }

    pub fn stale_after(&self) -> chrono::Duration {
        let secs = i64::try_from(self.stale_interrupt_after_secs).unwrap_or(i64::MAX);
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable config value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults_and_skips_garbage() {
        let vars: HashMap<&str, &str> = [
            ("AGUI_MAX_TOOL_ITERATIONS", "3"),
            ("AGUI_EMIT_MESSAGES_SNAPSHOT", "true"),
            ("AGUI_EVENT_BUFFER", "lots"),
        ]
        .into_iter()
        .collect();

        let config = AgentConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.max_tool_iterations, 3);
        assert!(config.emit_messages_snapshot);
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.stale_interrupt_after_secs, 86_400);
    }

    #[test]
    fn partial_json_config_keeps_defaults() {
        let config: AgentConfig = serde_json::from_str(r#"{"max_tool_iterations": 2}"#).unwrap();
        assert_eq!(config.max_tool_iterations, 2);
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.stale_after(), chrono::Duration::hours(24));
    }
}
