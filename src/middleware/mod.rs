pub mod context_injection;
pub mod function_invocation;
pub mod tracking;

use std::sync::Arc;

use tracing::debug;

use crate::provider::CompletionProvider;
use crate::resources::ContextResolver;
use crate::tools::ToolRegistry;

pub use context_injection::ContextInjectionMiddleware;
pub use function_invocation::FunctionInvocationMiddleware;
pub use tracking::UsageTrackingMiddleware;

/// Wraps a completion provider to add one concern.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Return a provider of the same shape that delegates to `inner`.
    fn apply(&self, inner: Arc<dyn CompletionProvider>) -> Arc<dyn CompletionProvider>;
}

/// Ordered middleware list. The first entry ends up closest to the base
/// provider; each later entry wraps everything before it.
#[derive(Default)]
pub struct PipelineBuilder {
    middleware: Vec<Box<dyn Middleware>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Fold the list around `base`. Done once; the result is shared by every run.
    pub fn build(self, base: Arc<dyn CompletionProvider>) -> Arc<dyn CompletionProvider> {
        self.middleware.iter().fold(base, |inner, m| {
            debug!(middleware = m.name(), "wrapping provider");
            m.apply(inner)
        })
    }
}

/// Context injection, then tool invocation, then usage tracking, innermost first.
pub fn standard_pipeline(
    base: Arc<dyn CompletionProvider>,
    resolver: Arc<dyn ContextResolver>,
    tools: Arc<ToolRegistry>,
    max_tool_iterations: usize,
) -> Arc<dyn CompletionProvider> {
    PipelineBuilder::new()
        .with(ContextInjectionMiddleware::new(resolver))
        .with(FunctionInvocationMiddleware::new(tools).with_max_iterations(max_tool_iterations))
        .with(UsageTrackingMiddleware)
        .build(base)
}
