use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::Middleware;
use crate::context::RequestContext;
use crate::error::InferenceError;
use crate::provider::{CompletionProvider, ResponseStream};
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::types::{
    ChatMessage, ChatOptions, ChatResponse, ResponseBuilder, ResponseUpdate, ToolCall, Usage,
};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Executes tool calls the model makes, as long as every requested tool can
/// run here, and calls the model again with the results.
///
/// A request naming any tool that cannot run locally (frontend, approval
/// required, unknown) ends the loop: the locally runnable calls of that turn
/// are still executed, the rest are left for the caller to interrupt on.
pub struct FunctionInvocationMiddleware {
    tools: Arc<ToolRegistry>,
    max_iterations: usize,
}

impl FunctionInvocationMiddleware {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Maximum rounds of tool execution per call. Clamped to at least 1.
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }
}

impl Middleware for FunctionInvocationMiddleware {
    fn name(&self) -> &str {
        "function_invocation"
    }

    fn apply(&self, inner: Arc<dyn CompletionProvider>) -> Arc<dyn CompletionProvider> {
        Arc::new(FunctionInvokingProvider {
            inner,
            executor: ToolExecutor::new(self.tools.clone()),
            max_iterations: self.max_iterations,
        })
    }
}

#[derive(Clone)]
struct FunctionInvokingProvider {
    inner: Arc<dyn CompletionProvider>,
    executor: ToolExecutor,
    max_iterations: usize,
}

/// What to do with the tool calls of one model response.
enum Round {
    /// No calls. The model is done.
    Done,
    /// Every call runs here. Execute and go again.
    Continue,
    /// Some calls need the caller. Execute what can run here and stop.
    Propagate(Vec<ToolCall>),
}

impl FunctionInvokingProvider {
    fn classify(&self, calls: &[ToolCall]) -> Round {
        if calls.is_empty() {
            return Round::Done;
        }
        let registry = self.executor.registry();
        let (local, remote): (Vec<&ToolCall>, Vec<&ToolCall>) =
            calls.iter().partition(|c| registry.resolve(&c.name).is_local());
        if remote.is_empty() {
            Round::Continue
        } else {
            debug!(
                pending = ?remote.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "tool calls cannot run locally, stopping invocation loop"
            );
            Round::Propagate(local.into_iter().cloned().collect())
        }
    }

    fn check_cap(&self, round: usize) -> Result<(), InferenceError> {
        if round >= self.max_iterations {
            warn!(limit = self.max_iterations, "tool loop exceeded");
            return Err(InferenceError::ToolLoopExceeded {
                limit: self.max_iterations,
            });
        }
        Ok(())
    }

    async fn run_streaming(
        self,
        mut messages: Vec<ChatMessage>,
        options: ChatOptions,
        ctx: RequestContext,
        tx: mpsc::Sender<Result<ResponseUpdate, InferenceError>>,
    ) -> Result<(), InferenceError> {
        let mut round = 0;
        loop {
            ctx.check_cancelled()?;
            let mut stream = self
                .inner
                .respond_streaming(messages.clone(), &options, &ctx)
                .await?;

            let mut builder = ResponseBuilder::default();
            while let Some(update) = stream.next().await {
                let update = update?;
                ctx.check_cancelled()?;
                builder.push(&update);
                if tx.send(Ok(update)).await.is_err() {
                    debug!("consumer dropped the stream");
                    return Ok(());
                }
            }

            let response = builder.finish();
            let to_run = match self.classify(&response.tool_calls) {
                Round::Done => return Ok(()),
                Round::Continue => {
                    self.check_cap(round)?;
                    response.tool_calls.clone()
                }
                Round::Propagate(local) => local,
            };
            let stop_after = to_run.len() != response.tool_calls.len();

            info!(round, calls = to_run.len(), run_id = ctx.run_id(), "invoking tools");
            messages.push(response.to_message());
            for call in &to_run {
                ctx.check_cancelled()?;
                let result = self.executor.execute(call, &ctx).await;
                messages.push(result.to_message());
                if tx.send(Ok(ResponseUpdate::ToolResult(result))).await.is_err() {
                    return Ok(());
                }
            }

            if stop_after {
                return Ok(());
            }
            round += 1;
        }
    }
}

#[async_trait]
impl CompletionProvider for FunctionInvokingProvider {
    async fn respond(
        &self,
        mut messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ChatResponse, InferenceError> {
        let mut history = Vec::new();
        let mut usage = Usage::default();
        let mut round = 0;
        loop {
            ctx.check_cancelled()?;
            let mut response = self.inner.respond(messages.clone(), options, ctx).await?;
            usage.accumulate(&response.usage);

            let to_run = match self.classify(&response.tool_calls) {
                Round::Done => Vec::new(),
                Round::Continue => {
                    self.check_cap(round)?;
                    response.tool_calls.clone()
                }
                Round::Propagate(local) => local,
            };
            if to_run.is_empty() {
                response.usage = usage;
                response.history = history;
                return Ok(response);
            }
            let stop_after = to_run.len() != response.tool_calls.len();

            info!(round, calls = to_run.len(), run_id = ctx.run_id(), "invoking tools");
            let assistant = response.to_message();
            messages.push(assistant.clone());
            history.push(assistant);
            for result in self.executor.execute_all(&to_run, ctx).await {
                let message = result.to_message();
                messages.push(message.clone());
                history.push(message);
            }

            if stop_after {
                // The pending calls are still on `response.tool_calls`.
                response.usage = usage;
                response.history = history;
                return Ok(response);
            }
            round += 1;
        }
    }

    async fn respond_streaming(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        ctx: &RequestContext,
    ) -> Result<ResponseStream, InferenceError> {
        ctx.check_cancelled()?;
        let (tx, rx) = mpsc::channel(32);
        let this = self.clone();
        let options = options.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let err_tx = tx.clone();
            if let Err(e) = this.run_streaming(messages, options, ctx, tx).await {
                let _ = err_tx.send(Err(e)).await;
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
