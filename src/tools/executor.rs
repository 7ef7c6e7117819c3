use std::sync::Arc;

use tracing::{debug, warn};

use super::registry::ToolRegistry;
use crate::context::RequestContext;
use crate::types::{ToolCall, ToolResult};

/// Runs tool calls against a registry, at most once per tool-call id.
///
/// The ledger lives on the request context, so a provider that repeats a
/// call id gets the recorded result back instead of a second execution.
/// Tool failures never escape: they come back as error results the model
/// can read.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn execute(&self, call: &ToolCall, ctx: &RequestContext) -> ToolResult {
        if let Some(previous) = ctx.executed_result(&call.id) {
            debug!(tool = %call.name, tool_call_id = %call.id, "tool call already executed");
            return previous;
        }

        let result = match call.parsed_arguments() {
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool arguments are not valid JSON");
                ToolResult::error(&call.id, format!("invalid arguments: {e}"))
            }
            Ok(input) => match self.registry.execute(&call.name, &input, ctx).await {
                Ok(output) => ToolResult::ok(&call.id, output),
                Err(e) => {
                    warn!(tool = %call.name, tool_call_id = %call.id, error = %e, "tool failed");
                    ToolResult::error(&call.id, e)
                }
            },
        };

        ctx.record_executed(result.clone());
        result
    }

    /// Execute calls sequentially, in request order.
    pub async fn execute_all(&self, calls: &[ToolCall], ctx: &RequestContext) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute(call, ctx).await);
        }
        results
    }
}
