use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::info;

use super::Middleware;
use crate::context::RequestContext;
use crate::error::InferenceError;
use crate::provider::{CompletionProvider, ResponseStream};
use crate::types::{ChatMessage, ChatOptions, ChatResponse, ResponseUpdate};

/// Outermost layer. Records token usage and the final assistant text on the
/// request context. Passes every response and update through untouched.
pub struct UsageTrackingMiddleware;

impl Middleware for UsageTrackingMiddleware {
    fn name(&self) -> &str {
        "usage_tracking"
    }

    fn apply(&self, inner: Arc<dyn CompletionProvider>) -> Arc<dyn CompletionProvider> {
        Arc::new(TrackingProvider { inner })
    }
}

struct TrackingProvider {
    inner: Arc<dyn CompletionProvider>,
}

#[async_trait]
impl CompletionProvider for TrackingProvider {
    async fn respond(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatResponse, InferenceError> {
        ctx.check_cancelled()?;
        let response = self.inner.respond(messages, options, ctx).await?;
        ctx.record_usage(&response.usage);
        ctx.record_response_text(response.text.clone());
        info!(
            run_id = ctx.run_id(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "response complete"
        );
        Ok(response)
    }

    async fn respond_streaming(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ResponseStream, InferenceError> {
        ctx.check_cancelled()?;
        let stream = self.inner.respond_streaming(messages, options, ctx).await?;
        let ctx = ctx.clone();
        let mut text = String::new();
        Ok(Box::pin(stream.inspect(move |update| match update {
            Ok(ResponseUpdate::Text { delta }) => text.push_str(delta),
            Ok(ResponseUpdate::Usage(usage)) => ctx.record_usage(usage),
            Ok(ResponseUpdate::Finished { stop_reason }) => {
                let final_text = std::mem::take(&mut text);
                ctx.record_response_text(final_text);
                let record = ctx.usage_record();
                info!(
                    run_id = ctx.run_id(),
                    ?stop_reason,
                    input_tokens = record.usage.input_tokens,
                    output_tokens = record.usage.output_tokens,
                    "response complete"
                );
            }
            _ => {}
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Usage;
    use tokio_util::sync::CancellationToken;

    struct Fixed;

    #[async_trait]
    impl CompletionProvider for Fixed {
        async fn respond(
            &self,
            _messages: Vec<ChatMessage>,
            _options: &ChatOptions,
            _ctx: &RequestContext,
        ) -> Result<ChatResponse, InferenceError> {
            Ok(ChatResponse::text("All done.")
                .with_usage(Usage { input_tokens: 12, output_tokens: 3 }))
        }
    }

    struct Failing;

    #[async_trait]
    impl CompletionProvider for Failing {
        async fn respond(
            &self,
            _messages: Vec<ChatMessage>,
            _options: &ChatOptions,
            _ctx: &RequestContext,
        ) -> Result<ChatResponse, InferenceError> {
            Err(InferenceError::ApiError { status: 500, body: "oops".into() })
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("t", "r", CancellationToken::new())
    }

    #[tokio::test]
    async fn records_usage_and_text() {
        let provider = UsageTrackingMiddleware.apply(Arc::new(Fixed));
        let ctx = ctx();
        let response = provider
            .respond(vec![], &ChatOptions::default(), &ctx)
            .await
            .unwrap();

        assert_eq!(response.text, "All done.");
        let record = ctx.usage_record();
        assert_eq!(record.usage.total(), 15);
        assert_eq!(record.final_text, "All done.");
        assert_eq!(record.responses, 1);
    }

    #[tokio::test]
    async fn streaming_passes_updates_through_unchanged() {
        let ctx = ctx();
        let direct: Vec<ResponseUpdate> = Arc::new(Fixed)
            .respond_streaming(vec![], &ChatOptions::default(), &ctx)
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        let tracked: Vec<ResponseUpdate> = UsageTrackingMiddleware
            .apply(Arc::new(Fixed))
            .respond_streaming(vec![], &ChatOptions::default(), &ctx)
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(direct, tracked);
        assert_eq!(ctx.usage_record().final_text, "All done.");
        assert_eq!(ctx.usage_record().usage.input_tokens, 12);
    }

    #[tokio::test]
    async fn errors_are_not_recorded() {
        let provider = UsageTrackingMiddleware.apply(Arc::new(Failing));
        let ctx = ctx();
        let err = provider
            .respond(vec![], &ChatOptions::default(), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
        assert_eq!(ctx.usage_record().responses, 0);
    }
}
