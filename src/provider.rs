use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::context::RequestContext;
use crate::error::InferenceError;
use crate::types::{ChatMessage, ChatOptions, ChatResponse, ResponseUpdate};

/// Stream of response increments, in the order the model produced them.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseUpdate, InferenceError>> + Send>>;

/// The boundary to the language model. Messages in, response (or a stream
/// of increments) out. Middleware implements this too, wrapping an inner
/// provider.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn respond(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatResponse, InferenceError>;

    /// Defaults to replaying the full response as a single burst.
    async fn respond_streaming(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ResponseStream, InferenceError> {
        let response = self.respond(messages, options, ctx).await?;
        Ok(Box::pin(futures::stream::iter(
            response.into_updates().into_iter().map(Ok),
        )))
    }
}

#[async_trait]
impl<T: CompletionProvider + ?Sized> CompletionProvider for Arc<T> {
    async fn respond(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatResponse, InferenceError> {
        (**self).respond(messages, options, ctx).await
    }

    async fn respond_streaming(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ResponseStream, InferenceError> {
        (**self).respond_streaming(messages, options, ctx).await
    }
}

#[async_trait]
impl<T: CompletionProvider + ?Sized> CompletionProvider for Box<T> {
    async fn respond(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatResponse, InferenceError> {
        (**self).respond(messages, options, ctx).await
    }

    async fn respond_streaming(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ResponseStream, InferenceError> {
        (**self).respond_streaming(messages, options, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StopReason, ToolCall, Usage};
    use futures::StreamExt;
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
            Ok(ChatResponse {
                text: "hi".into(),
                tool_calls: vec![ToolCall::new("c1", "echo", "{}")],
                usage: Usage { input_tokens: 1, output_tokens: 2 },
                stop_reason: StopReason::ToolUse,
                history: vec![],
            })
        }
    }

    #[tokio::test]
    async fn default_streaming_replays_response() {
        let ctx = RequestContext::new("t", "r", CancellationToken::new());
        let provider: Arc<dyn CompletionProvider> = Arc::new(Fixed);
        let updates: Vec<ResponseUpdate> = provider
            .respond_streaming(vec![], &ChatOptions::default(), &ctx)
            .await
            .unwrap()
            .map(|u| u.unwrap())
            .collect()
            .await;

        assert_eq!(
            updates,
            vec![
                ResponseUpdate::Text { delta: "hi".into() },
                ResponseUpdate::ToolCallStart { id: "c1".into(), name: "echo".into() },
                ResponseUpdate::ToolCallArgs { id: "c1".into(), delta: "{}".into() },
                ResponseUpdate::Usage(Usage { input_tokens: 1, output_tokens: 2 }),
                ResponseUpdate::Finished { stop_reason: StopReason::ToolUse },
            ]
        );
    }
}
