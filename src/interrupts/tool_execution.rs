use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::context::{AgentStatus, InterruptContext};
use super::{InterruptHandler, TOOL_EXECUTION};
use crate::context::RequestContext;
use crate::error::AgentError;
use crate::events::InterruptInfo;
use crate::tools::{ToolExecutor, ToolRegistry};
use crate::types::ToolCall;

/// Runs the caller-side tools the model asked for, then resumes the run
/// with their results.
///
/// Only calls made since the last user message are considered, and only
/// those this registry can run and that have no result yet. Each runs once,
/// in request order.
pub struct ToolExecutionHandler {
    executor: ToolExecutor,
}

impl ToolExecutionHandler {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            executor: ToolExecutor::new(tools),
        }
    }

    fn runnable(&self, ctx: &InterruptContext) -> Vec<ToolCall> {
        let registry = self.executor.registry();
        ctx.current_turn_tool_calls()
            .into_iter()
            .filter(|c| registry.resolve(&c.name).is_local() && !ctx.has_result(&c.id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InterruptHandler for ToolExecutionHandler {
    fn reason(&self) -> &str {
        TOOL_EXECUTION
    }

    async fn handle(&self, _interrupt: &InterruptInfo, ctx: &InterruptContext) -> Result<(), AgentError> {
        let calls = self.runnable(ctx);
        if calls.is_empty() {
            debug!(run_id = ctx.run_id(), "no runnable tool calls, leaving run paused");
            ctx.set_status(AgentStatus::Idle);
            return Ok(());
        }

        ctx.set_status(AgentStatus::Working);
        let tool_ctx = RequestContext::new(ctx.thread_id(), ctx.run_id(), CancellationToken::new());
        for call in &calls {
            info!(tool = %call.name, tool_call_id = %call.id, "executing caller-side tool");
            let result = self.executor.execute(call, &tool_ctx).await;
            ctx.record_tool_result(result);
        }
        ctx.resume(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResumeInput;
    use crate::events::Event;
    use crate::interrupts::Resumer;
    use crate::tools::ToolHandler;
    use crate::transport::{BoxEventStream, RunAccumulator};
    use crate::types::ChatMessage;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CapturingResumer {
        inputs: Mutex<Vec<ResumeInput>>,
    }

    #[async_trait]
    impl Resumer for CapturingResumer {
        async fn resume(&self, input: ResumeInput) -> Result<BoxEventStream, AgentError> {
            self.inputs.lock().push(input);
            Ok(Box::pin(futures::stream::empty::<Result<Event, AgentError>>()))
        }
    }

    struct Color(Arc<AtomicUsize>);

    #[async_trait]
    impl ToolHandler for Color {
        async fn call(&self, _input: &Value, _ctx: &RequestContext) -> Result<String, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("blue".into())
        }
    }

    fn accumulator(events: &[Event]) -> RunAccumulator {
        let mut acc = RunAccumulator::new();
        for e in events {
            acc.apply(e).unwrap();
        }
        acc
    }

    fn interrupted_stream() -> Vec<Event> {
        vec![
            Event::run_started("t", "r"),
            Event::tool_call_start("c1", "pick_color", Some("m1".into())),
            Event::tool_call_end("c1"),
            Event::tool_call_start("c2", "server_only", Some("m1".into())),
            Event::tool_call_end("c2"),
        ]
    }

    #[tokio::test]
    async fn executes_each_runnable_call_once_and_resumes() {
        let count = Arc::new(AtomicUsize::new(0));
        let tools = Arc::new(ToolRegistry::new().add("pick_color", json!({}), Color(count.clone())));
        let resumer = Arc::new(CapturingResumer::default());
        let ctx = InterruptContext::new(
            "t",
            "r",
            Some("i1".into()),
            &accumulator(&interrupted_stream()),
            resumer.clone(),
        );

        ToolExecutionHandler::new(tools)
            .handle(&InterruptInfo::new(TOOL_EXECUTION, json!({})), &ctx)
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let inputs = resumer.inputs.lock();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].interrupt_id.as_deref(), Some("i1"));
        assert_eq!(inputs[0].tool_results.len(), 1);
        assert_eq!(inputs[0].tool_results[0].tool_call_id, "c1");
        assert!(ctx.is_resumed());
    }

    #[tokio::test]
    async fn calls_before_trailing_text_still_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let tools = Arc::new(ToolRegistry::new().add("pick_color", json!({}), Color(count.clone())));
        let resumer = Arc::new(CapturingResumer::default());
        let events = vec![
            Event::run_started("t", "r"),
            Event::tool_call_start("c1", "pick_color", Some("m1".into())),
            Event::tool_call_end("c1"),
            Event::text_message_start("m2"),
            Event::text_message_content("m2", "one moment"),
            Event::text_message_end("m2"),
        ];
        let acc = accumulator(&events);
        assert_eq!(acc.messages().len(), 2);
        let ctx = InterruptContext::new("t", "r", None, &acc, resumer.clone());

        ToolExecutionHandler::new(tools)
            .handle(&InterruptInfo::new(TOOL_EXECUTION, json!({})), &ctx)
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(resumer.inputs.lock()[0].tool_results[0].tool_call_id, "c1");
    }

    #[tokio::test]
    async fn calls_from_earlier_turns_are_ignored() {
        let count = Arc::new(AtomicUsize::new(0));
        let tools = Arc::new(ToolRegistry::new().add("pick_color", json!({}), Color(count.clone())));
        let resumer = Arc::new(CapturingResumer::default());
        let mut events = interrupted_stream();
        events.push(Event::messages_snapshot(vec![
            ChatMessage::assistant("")
                .with_id("m1")
                .with_tool_calls(vec![ToolCall::new("c1", "pick_color", "{}")]),
            ChatMessage::user("never mind"),
        ]));
        let ctx = InterruptContext::new("t", "r", None, &accumulator(&events), resumer.clone());

        ToolExecutionHandler::new(tools)
            .handle(&InterruptInfo::new(TOOL_EXECUTION, json!({})), &ctx)
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!ctx.is_resumed());
    }

    #[tokio::test]
    async fn nothing_runnable_means_no_resume() {
        let resumer = Arc::new(CapturingResumer::default());
        let mut events = interrupted_stream();
        events.push(Event::tool_call_result("m2", "c1", "already"));
        let ctx = InterruptContext::new("t", "r", None, &accumulator(&events), resumer.clone());

        let tools = Arc::new(
            ToolRegistry::new().add("pick_color", json!({}), Color(Arc::new(AtomicUsize::new(0)))),
        );
        ToolExecutionHandler::new(tools)
            .handle(&InterruptInfo::new(TOOL_EXECUTION, json!({})), &ctx)
            .await
            .unwrap();

        assert!(resumer.inputs.lock().is_empty());
        assert!(!ctx.is_resumed());
    }
}
