use serde_json::Value;

use super::handler::{ExecutionSite, ToolDef, ToolHandler};
use crate::context::RequestContext;

/// How a requested tool name can be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResolution {
    /// Runs here without asking anyone.
    Local,
    /// Runs here, but only after a human approves it.
    RequiresApproval,
    /// Runs in the caller's environment.
    Frontend,
    /// Nothing registered under that name.
    Unknown,
}

impl ToolResolution {
    pub fn is_local(self) -> bool {
        self == ToolResolution::Local
    }
}

/// Catalog of available tools. Stores definitions, provides schemas and
/// resolves names to a place the call can run.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a server tool. The schema is the complete JSON tool definition
    /// (name, description, input_schema) sent to the LLM.
    pub fn add(
        self,
        name: impl Into<String>,
        schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        self.push(name.into(), schema, ExecutionSite::Server, false, Some(Box::new(handler)))
    }

    /// Register a server tool that needs a human decision before it runs.
    pub fn add_with_approval(
        self,
        name: impl Into<String>,
        schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        self.push(name.into(), schema, ExecutionSite::Server, true, Some(Box::new(handler)))
    }

    /// Register a tool the model may call but only the caller can execute.
    pub fn add_frontend(self, name: impl Into<String>, schema: Value) -> Self {
        self.push(name.into(), schema, ExecutionSite::Frontend, false, None)
    }

    fn push(
        mut self,
        name: String,
        schema: Value,
        site: ExecutionSite,
        requires_approval: bool,
        handler: Option<Box<dyn ToolHandler>>,
    ) -> Self {
        self.tools.retain(|t| t.name != name);
        self.tools.push(ToolDef {
            name,
            schema,
            site,
            requires_approval,
            handler,
        });
        self
    }

    fn get(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn resolve(&self, name: &str) -> ToolResolution {
        match self.get(name) {
            None => ToolResolution::Unknown,
            Some(t) if t.site == ExecutionSite::Frontend || t.handler.is_none() => {
                ToolResolution::Frontend
            }
            Some(t) if t.requires_approval => ToolResolution::RequiresApproval,
            Some(_) => ToolResolution::Local,
        }
    }

    /// All tool schemas for the LLM API request.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    /// Schema for a specific tool by name.
    pub fn schema(&self, name: &str) -> Option<&Value> {
        self.get(name).map(|t| &t.schema)
    }

    /// Run a tool's handler. Approval is the caller's concern; this only
    /// refuses names with no handler here.
    pub async fn execute(
        &self,
        name: &str,
        input: &Value,
        ctx: &RequestContext,
    ) -> Result<String, String> {
        let handler = self
            .get(name)
            .and_then(|t| t.handler.as_deref())
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        handler.call(input, ctx).await
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl ToolHandler for NoopHandler {
        async fn call(&self, _input: &Value, _ctx: &RequestContext) -> Result<String, String> {
            Ok("ok".into())
        }
    }

    fn test_registry() -> ToolRegistry {
        ToolRegistry::new()
            .add(
                "read_file",
                json!({"name": "read_file", "description": "Read a file"}),
                NoopHandler,
            )
            .add_with_approval(
                "delete_file",
                json!({"name": "delete_file", "description": "Delete a file"}),
                NoopHandler,
            )
            .add_frontend(
                "pick_color",
                json!({"name": "pick_color", "description": "Ask the user for a colour"}),
            )
    }

    #[test]
    fn resolves_each_kind() {
        let reg = test_registry();
        assert_eq!(reg.resolve("read_file"), ToolResolution::Local);
        assert_eq!(reg.resolve("delete_file"), ToolResolution::RequiresApproval);
        assert_eq!(reg.resolve("pick_color"), ToolResolution::Frontend);
        assert_eq!(reg.resolve("launch_rocket"), ToolResolution::Unknown);
    }

    #[test]
    fn re_registering_replaces() {
        let reg = test_registry().add_frontend(
            "read_file",
            json!({"name": "read_file", "description": "Now a browser tool"}),
        );
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.resolve("read_file"), ToolResolution::Frontend);
    }

    #[test]
    fn schemas_in_registration_order() {
        let names: Vec<String> = test_registry()
            .schemas()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["read_file", "delete_file", "pick_color"]);
    }

    #[tokio::test]
    async fn frontend_tools_cannot_execute_here() {
        let reg = test_registry();
        let ctx = RequestContext::new("t", "r", CancellationToken::new());
        assert_eq!(reg.execute("read_file", &json!({}), &ctx).await.unwrap(), "ok");
        let err = reg.execute("pick_color", &json!({}), &ctx).await.unwrap_err();
        assert_eq!(err, "unknown tool: pick_color");
    }
}
