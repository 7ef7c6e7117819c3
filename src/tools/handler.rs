use async_trait::async_trait;
use serde_json::Value;

use crate::context::RequestContext;

/// A tool's execution handler. Consumers implement this for each tool.
///
/// The request context is the only channel to run-scoped data: on-demand
/// resources, shared state, runtime content.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value, ctx: &RequestContext) -> Result<String, String>;
}

/// Where a tool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionSite {
    /// In this process, through its handler.
    Server,
    /// Only in the caller's environment. The run pauses for it.
    Frontend,
}

/// A tool definition: schema for the LLM plus how to run it.
pub struct ToolDef {
    pub name: String,
    pub schema: Value,
    pub site: ExecutionSite,
    /// Pause for a human decision before running.
    pub requires_approval: bool,
    pub(crate) handler: Option<Box<dyn ToolHandler>>,
}

impl std::fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("site", &self.site)
            .field("requires_approval", &self.requires_approval)
            .finish()
    }
}
