use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Middleware;
use crate::context::RequestContext;
use crate::error::InferenceError;
use crate::provider::{CompletionProvider, ResponseStream};
use crate::resources::{format_resources, ContextResolver};
use crate::types::{ChatMessage, ChatOptions, ChatResponse, Role};

/// Resolves context resources once per invocation, formats them into the
/// system prompt and re-injects runtime content only when new content appeared.
pub struct ContextInjectionMiddleware {
    resolver: Arc<dyn ContextResolver>,
}

impl ContextInjectionMiddleware {
    pub fn new(resolver: Arc<dyn ContextResolver>) -> Self {
        Self { resolver }
    }
}

impl Middleware for ContextInjectionMiddleware {
    fn name(&self) -> &str {
        "context_injection"
    }

    fn apply(&self, inner: Arc<dyn CompletionProvider>) -> Arc<dyn CompletionProvider> {
        Arc::new(ContextInjectingProvider {
            inner,
            resolver: self.resolver.clone(),
        })
    }
}

struct ContextInjectingProvider {
    inner: Arc<dyn CompletionProvider>,
    resolver: Arc<dyn ContextResolver>,
}

impl ContextInjectingProvider {
    async fn prepare(
        &self,
        mut messages: Vec<ChatMessage>,
        ctx: &RequestContext,
    ) -> Result<Vec<ChatMessage>, InferenceError> {
        ctx.check_cancelled()?;

        let resources = match ctx.resolved_resources() {
            Some(resources) => resources,
            None => {
                // A failing resolver costs context, not the run.
                let resolved = match self.resolver.resolve(ctx).await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        warn!(run_id = ctx.run_id(), error = %e, "context resolution failed");
                        Vec::new()
                    }
                };
                debug!(run_id = ctx.run_id(), resources = resolved.len(), "context resolved");
                ctx.set_resolved_resources(resolved.clone());
                resolved
            }
        };

        // Earlier injections are replayed at the position they were first made,
        // as if they had been appended to the history at the time.
        let mut injected = ctx.injected_messages();
        injected.sort_by_key(|(anchor, _)| *anchor);
        for (offset, (anchor, message)) in injected.into_iter().enumerate() {
            let at = (anchor + offset).min(messages.len());
            messages.insert(at, message);
        }

        let pending = ctx.take_pending_content();
        if !pending.is_empty() {
            debug!(run_id = ctx.run_id(), parts = pending.len(), "injecting runtime content");
            let anchor = messages.len() - ctx.injected_messages().len();
            let message = ChatMessage::user("").with_parts(pending);
            ctx.record_injected_message(anchor, message.clone());
            messages.push(message);
        }

        if let Some(section) = format_resources(&resources) {
            match messages.iter_mut().find(|m| m.role == Role::System) {
                Some(system) => {
                    system.content.push_str("\n\n");
                    system.content.push_str(&section);
                }
                None => messages.insert(0, ChatMessage::system(section)),
            }
        }

        Ok(messages)
    }
}

#[async_trait]
impl CompletionProvider for ContextInjectingProvider {
    async fn respond(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatResponse, InferenceError> {
        let messages = self.prepare(messages, ctx).await?;
        self.inner.respond(messages, options, ctx).await
    }

    async fn respond_streaming(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ResponseStream, InferenceError> {
        let messages = self.prepare(messages, ctx).await?;
        self.inner.respond_streaming(messages, options, ctx).await
    }
}
