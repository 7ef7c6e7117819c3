use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::context::RequestContext;
use crate::tools::ToolHandler;

/// When a resource reaches the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    /// Formatted into the system prompt on every call.
    Always,
    /// Listed only; tools fetch it through the request context.
    OnDemand,
}

/// A piece of ambient context (brand voice, the page being edited, a style guide).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResource {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub mode: InjectionMode,
    /// A string renders verbatim, anything else as pretty JSON.
    pub data: Value,
}

impl ContextResource {
    pub fn always(id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            mode: InjectionMode::Always,
            data,
        }
    }

    pub fn on_demand(id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            mode: InjectionMode::OnDemand,
            ..Self::always(id, name, data)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn render(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{0}")]
    Failed(String),
}

/// Supplies the resources that apply to a request.
#[async_trait]
pub trait ContextResolver: Send + Sync {
    async fn resolve(&self, ctx: &RequestContext) -> Result<Vec<ContextResource>, ResolveError>;
}

/// Fixed resource list, the same for every request.
#[derive(Debug, Clone, Default)]
pub struct StaticContextResolver {
    resources: Vec<ContextResource>,
}

impl StaticContextResolver {
    pub fn new(resources: Vec<ContextResource>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl ContextResolver for StaticContextResolver {
    async fn resolve(&self, _ctx: &RequestContext) -> Result<Vec<ContextResource>, ResolveError> {
        Ok(self.resources.clone())
    }
}

/// Format the system-prompt section for a resolved resource set.
/// `None` when nothing needs injecting.
pub fn format_resources(resources: &[ContextResource]) -> Option<String> {
    let always: Vec<&ContextResource> = resources
        .iter()
        .filter(|r| r.mode == InjectionMode::Always)
        .collect();
    let on_demand: Vec<&ContextResource> = resources
        .iter()
        .filter(|r| r.mode == InjectionMode::OnDemand)
        .collect();

    if always.is_empty() && on_demand.is_empty() {
        return None;
    }

    let mut out = String::from("## Context\n");
    for r in &always {
        out.push_str(&format!("\n### {}\n", r.name));
        if let Some(ref desc) = r.description {
            out.push_str(desc);
            out.push('\n');
        }
        out.push_str(&r.render());
        out.push('\n');
    }

    if !on_demand.is_empty() {
        out.push_str(&format!(
            "\n### Available on request\nCall `{}` with one of these ids when you need it:\n",
            ContextLookupTool::NAME
        ));
        for r in &on_demand {
            match r.description {
                Some(ref desc) => out.push_str(&format!("- `{}`: {} ({})\n", r.id, r.name, desc)),
                None => out.push_str(&format!("- `{}`: {}\n", r.id, r.name)),
            }
        }
    }

    Some(out)
}

/// Tool that returns an on-demand resource resolved for the current request.
pub struct ContextLookupTool;

impl ContextLookupTool {
    pub const NAME: &'static str = "get_context_resource";

    pub fn schema() -> Value {
        json!({
            "name": Self::NAME,
            "description": "Fetch a context resource listed as available on request.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "Resource id" }
                },
                "required": ["id"]
            }
        })
    }
}

#[async_trait]
impl ToolHandler for ContextLookupTool {
    async fn call(&self, input: &Value, ctx: &RequestContext) -> Result<String, String> {
        let id = input["id"].as_str().ok_or("missing `id`")?;
        ctx.resource(id)
            .map(|r| r.render())
            .ok_or_else(|| format!("unknown context resource: {id}"))
    }
}
