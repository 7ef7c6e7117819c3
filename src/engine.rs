use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::emitter::EventTranslator;
use crate::error::AgentError;
use crate::events::{Event, InterruptInfo};
use crate::interrupts::{HUMAN_APPROVAL, TOOL_EXECUTION};
use crate::middleware::standard_pipeline;
use crate::provider::CompletionProvider;
use crate::resources::ContextResolver;
use crate::store::{InMemoryRunStore, RunState, RunStatus, RunStore};
use crate::tools::{ToolExecutor, ToolRegistry, ToolResolution};
use crate::transport::{event_channel, EventSink, EventStream};
use crate::types::{new_id, ChatMessage, ChatOptions, Role, ToolCall, ToolResult, Usage};
use crate::AgentConfig;

/// Request to start a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInput {
    pub thread_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Tools the caller can execute itself. Calls to these interrupt the run.
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_props: Option<Value>,
}

impl RunInput {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_forwarded_props(mut self, props: Value) -> Self {
        self.forwarded_props = Some(props);
        self
    }
}

/// Request to continue an interrupted run.
///
/// `payload` is interpreted by shape: an object with `approved` is an
/// approval decision (optionally scoped by `toolCallIds`, with an `answer`
/// for the model), an object with only `toolResults` supplies results, and
/// anything else is passed to the model as a user message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInput {
    pub thread_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ResumeInput {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn with_interrupt_id(mut self, id: impl Into<String>) -> Self {
        self.interrupt_id = Some(id.into());
        self
    }

    pub fn with_tool_result(mut self, result: ToolResult) -> Self {
        self.tool_results.push(result);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Summary of one invocation, returned to the in-process caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub thread_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub interrupt: Option<InterruptInfo>,
    /// Text of the last assistant message.
    pub text: String,
    pub usage: Usage,
}

/// Tool calls in `messages` that no tool message answers yet, oldest first.
pub fn pending_tool_calls(messages: &[ChatMessage]) -> Vec<ToolCall> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter())
        .filter(|c| !answered.contains(c.id.as_str()))
        .cloned()
        .collect()
}

/// Drives runs: feeds the middleware pipeline, turns its output into events,
/// and pauses and resumes runs around interrupts.
///
/// One engine serves many runs concurrently. A given run id is only ever
/// driven by one invocation at a time.
pub struct RunEngine {
    pipeline: Arc<dyn CompletionProvider>,
    executor: ToolExecutor,
    store: Arc<dyn RunStore>,
    config: AgentConfig,
    active: Mutex<HashSet<String>>,
}

/// Holds a run id in the active set until dropped.
struct ActiveRun<'a> {
    active: &'a Mutex<HashSet<String>>,
    run_id: String,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.run_id);
    }
}

impl RunEngine {
    /// `pipeline` is the fully built provider chain; `tools` the registry
    /// it was built with.
    pub fn new(
        pipeline: Arc<dyn CompletionProvider>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            pipeline,
            executor: ToolExecutor::new(tools),
            store: Arc::new(InMemoryRunStore::new()),
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Engine over the standard middleware chain.
    pub fn with_standard_pipeline(
        provider: Arc<dyn CompletionProvider>,
        resolver: Arc<dyn ContextResolver>,
        tools: Arc<ToolRegistry>,
        config: AgentConfig,
    ) -> Self {
        let pipeline = standard_pipeline(
            provider,
            resolver,
            tools.clone(),
            config.max_tool_iterations,
        );
        Self::new(pipeline, tools, config)
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        self.executor.registry()
    }

    /// Current status of a run, if the store knows it.
    pub async fn status(&self, run_id: &str) -> Result<Option<RunStatus>, AgentError> {
        Ok(self.store.load(run_id).await?.map(|r| r.status))
    }

    /// Interrupted runs that have waited longer than the configured limit.
    pub async fn stale_runs(&self) -> Result<Vec<RunState>, AgentError> {
        let after = self.config.stale_after();
        let now = Utc::now();
        Ok(self
            .store
            .interrupted()
            .await?
            .into_iter()
            .filter(|r| r.is_stale(after, now))
            .collect())
    }

    // --- Entry points ---

    /// Start a run, writing its events to `sink`.
    pub async fn start(
        &self,
        input: RunInput,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<RunReport, AgentError> {
        let guard = match self.claim(&input.run_id) {
            Ok(guard) => guard,
            Err(e) => return self.reject(e, &sink).await,
        };
        match self.store.load(&input.run_id).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                drop(guard);
                let e = AgentError::InvalidState(format!("run {} already exists", input.run_id));
                return self.reject(e, &sink).await;
            }
            Err(e) => {
                drop(guard);
                return self.reject(e, &sink).await;
            }
        }

        info!(thread_id = %input.thread_id, run_id = %input.run_id, "starting run");
        let mut run = RunState::new(&input.thread_id, &input.run_id);
        run.parent_run_id = input.parent_run_id.clone();
        run.messages = input.messages.clone();
        run.tools = input.tools.clone();
        run.scope = input.forwarded_props.clone().unwrap_or(Value::Null);
        if let Some(ref state) = input.state {
            run.state = state.clone();
        }

        let outcome = self.run_start(&mut run, &input, &sink, &cancel).await;
        self.conclude(run, outcome, guard, &sink).await
    }

    /// Continue an interrupted run with the caller's resolution.
    pub async fn resume(
        &self,
        input: ResumeInput,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> Result<RunReport, AgentError> {
        let guard = match self.claim(&input.run_id) {
            Ok(guard) => guard,
            Err(e) => return self.reject(e, &sink).await,
        };
        let mut run = match self.load_resumable(&input).await {
            Ok(run) => run,
            Err(e) => {
                drop(guard);
                return self.reject(e, &sink).await;
            }
        };

        info!(thread_id = %run.thread_id, run_id = %run.run_id, "resuming run");
        let outcome = self.run_resume(&mut run, input, &sink, &cancel).await;
        self.conclude(run, outcome, guard, &sink).await
    }

    /// Start a run on a background task and hand back its event stream.
    /// Dropping or cancelling the stream cancels the run.
    pub fn start_stream(self: &Arc<Self>, input: RunInput) -> EventStream {
        let (sink, stream) = event_channel(self.config.event_buffer);
        let cancel = stream.cancel_token();
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.start(input, sink, cancel).await {
                debug!(error = %e, "run ended with error");
            }
        });
        stream
    }

    /// Resume a run on a background task and hand back its event stream.
    pub fn resume_stream(self: &Arc<Self>, input: ResumeInput) -> EventStream {
        let (sink, stream) = event_channel(self.config.event_buffer);
        let cancel = stream.cancel_token();
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.resume(input, sink, cancel).await {
                debug!(error = %e, "resume ended with error");
            }
        });
        stream
    }

    // --- Invocation bodies ---

    async fn run_start(
        &self,
        run: &mut RunState,
        input: &RunInput,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.store.save(run).await?;

        let mut started = Event::run_started(&run.thread_id, &run.run_id);
        if let Event::RunStarted { parent_run_id, input: echoed, .. } = &mut started {
            *parent_run_id = run.parent_run_id.clone();
            *echoed = serde_json::to_value(input).ok();
        }
        sink.send(started).await?;
        if input.state.is_some() {
            sink.send(Event::state_snapshot(run.state.clone())).await?;
        }

        let ctx = self.context_for(run, cancel);
        self.drive(run, &ctx, sink, cancel).await?;
        absorb(run, &ctx);
        Ok(())
    }

    async fn run_resume(
        &self,
        run: &mut RunState,
        input: ResumeInput,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        run.status = RunStatus::Running;
        run.interrupt = None;
        run.interrupted_at = None;
        run.updated_at = Utc::now();
        self.store.save(run).await?;

        sink.send(Event::run_started(&run.thread_id, &run.run_id)).await?;

        let ctx = self.context_for(run, cancel);
        self.apply_resolution(run, input, &ctx, sink).await?;
        absorb(run, &ctx);

        if !pending_tool_calls(&run.messages).is_empty() {
            debug!(run_id = %run.run_id, "calls still pending after resume, interrupting again");
            return Ok(());
        }

        self.drive(run, &ctx, sink, cancel).await?;
        absorb(run, &ctx);
        Ok(())
    }

    /// Fold the caller's resolution of an interrupt into the conversation.
    async fn apply_resolution(
        &self,
        run: &mut RunState,
        input: ResumeInput,
        ctx: &RequestContext,
        sink: &EventSink,
    ) -> Result<(), AgentError> {
        let pending = pending_tool_calls(&run.messages);
        let mut translator = EventTranslator::for_history(&run.messages);
        let mut last_state = ctx.state();

        let mut results = input.tool_results;
        let mut note = None;
        let mut decision = None;
        match input.payload {
            None | Some(Value::Null) => {}
            Some(Value::Object(mut map)) if map.contains_key("approved") => {
                decision = Some(Decision::from_map(&mut map));
            }
            Some(Value::Object(mut map)) if map.contains_key("toolResults") => {
                if let Some(raw) = map.remove("toolResults") {
                    match serde_json::from_value::<Vec<ToolResult>>(raw) {
                        Ok(parsed) => results.extend(parsed),
                        Err(e) => warn!(error = %e, "ignoring malformed toolResults in resume payload"),
                    }
                }
                if !map.is_empty() {
                    note = Some(Value::Object(map));
                }
            }
            Some(other) => note = Some(other),
        }

        let mut answered = HashSet::new();
        for result in results {
            let known = pending.iter().any(|c| c.id == result.tool_call_id);
            if !known || !answered.insert(result.tool_call_id.clone()) {
                warn!(tool_call_id = %result.tool_call_id, "result for a call that is not pending, ignoring");
                continue;
            }
            ctx.record_executed(result.clone());
            if let Some(event) = translator.tool_result(result) {
                sink.send(event).await?;
            }
        }

        if let Some(decision) = decision {
            let registry = self.executor.registry();
            let targets = pending.iter().filter(|c| {
                !answered.contains(&c.id)
                    && match &decision.tool_call_ids {
                        Some(ids) => ids.contains(&c.id),
                        None => registry.resolve(&c.name) == ToolResolution::RequiresApproval,
                    }
            });
            for call in targets {
                ctx.check_cancelled()?;
                let result = if decision.approved {
                    info!(tool = %call.name, tool_call_id = %call.id, "executing approved tool");
                    self.executor.execute(call, ctx).await
                } else {
                    info!(tool = %call.name, tool_call_id = %call.id, "tool call denied");
                    let denied = ToolResult::error(&call.id, "denied by user");
                    ctx.record_executed(denied.clone());
                    denied
                };
                if let Some(event) = translator.tool_result(result) {
                    sink.send(event).await?;
                }
            }
            note = decision.answer;
        }

        run.messages.extend(translator.take_messages());
        if let Some(note) = note {
            let content = match note {
                Value::String(s) => s,
                other => other.to_string(),
            };
            run.messages.push(ChatMessage::user(content));
        }

        emit_state_delta(ctx, &mut last_state, sink).await
    }

    /// Stream one pipeline invocation into events and messages.
    async fn drive(
        &self,
        run: &mut RunState,
        ctx: &RequestContext,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        ctx.check_cancelled()?;
        let options = self.options_for(run);
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            stream = self.pipeline.respond_streaming(run.messages.clone(), &options, ctx) => stream?,
        };

        let mut translator = EventTranslator::for_history(&run.messages);
        let mut last_state = ctx.state();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(run_id = %run.run_id, "run cancelled");
                    return Err(AgentError::Cancelled);
                }
                next = stream.next() => next,
            };
            let Some(update) = next else { break };
            let update = update?;

            let boundary = update.closes_response();
            for event in translator.translate(update) {
                sink.send(event).await?;
            }
            if boundary {
                run.messages.extend(translator.take_messages());
                emit_state_delta(ctx, &mut last_state, sink).await?;
            }
        }

        for event in translator.finish() {
            sink.send(event).await?;
        }
        run.messages.extend(translator.take_messages());
        emit_state_delta(ctx, &mut last_state, sink).await
    }

    // --- Settlement ---

    /// Record the outcome and emit the terminal event. The run is released
    /// before the terminal event goes out, so a consumer may resume as soon
    /// as it sees it.
    async fn conclude(
        &self,
        mut run: RunState,
        outcome: Result<(), AgentError>,
        guard: ActiveRun<'_>,
        sink: &EventSink,
    ) -> Result<RunReport, AgentError> {
        let outcome = match outcome {
            Ok(()) => self.settle(&mut run).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(events) => {
                drop(guard);
                for event in events {
                    if sink.send(event).await.is_err() {
                        debug!(run_id = %run.run_id, "consumer gone before the terminal event");
                        break;
                    }
                }
                Ok(report(&run))
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, code = e.code(), "run failed");
                run.status = RunStatus::Failed;
                run.interrupt = None;
                run.updated_at = Utc::now();
                if let Err(store_err) = self.store.save(&run).await {
                    warn!(run_id = %run.run_id, error = %store_err, "failed to save failed run");
                }
                drop(guard);
                if !sink.is_closed() {
                    let _ = sink
                        .send(Event::run_error(e.to_string(), Some(e.code().to_string())))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Decide between success and interrupt, save, and return the closing events.
    async fn settle(&self, run: &mut RunState) -> Result<Vec<Event>, AgentError> {
        let pending = pending_tool_calls(&run.messages);
        let now = Utc::now();
        run.updated_at = now;

        let mut events = Vec::new();
        if self.config.emit_messages_snapshot {
            events.push(Event::messages_snapshot(run.messages.clone()));
        }

        if pending.is_empty() {
            run.status = RunStatus::Succeeded;
            self.store.save(run).await?;
            info!(run_id = %run.run_id, "run finished");
            events.push(Event::run_finished(&run.thread_id, &run.run_id, None));
            return Ok(events);
        }

        let interrupt = self.interrupt_for(&pending);
        info!(
            run_id = %run.run_id,
            reason = %interrupt.reason,
            pending = pending.len(),
            "run interrupted"
        );
        run.status = RunStatus::Interrupted;
        run.interrupt = Some(interrupt.clone());
        run.interrupted_at = Some(now);
        self.store.save(run).await?;
        events.push(Event::run_interrupted(&run.thread_id, &run.run_id, interrupt));
        Ok(events)
    }

    /// Approval outranks plain tool execution. An approval interrupt lists
    /// only the calls awaiting approval; the rest surface on the next pause.
    fn interrupt_for(&self, pending: &[ToolCall]) -> InterruptInfo {
        let registry = self.executor.registry();
        let approval: Vec<&ToolCall> = pending
            .iter()
            .filter(|c| registry.resolve(&c.name) == ToolResolution::RequiresApproval)
            .collect();
        let (reason, calls) = if approval.is_empty() {
            (TOOL_EXECUTION, pending.iter().collect())
        } else {
            (HUMAN_APPROVAL, approval)
        };
        let calls: Vec<Value> = calls
            .into_iter()
            .map(|c| json!({"id": c.id, "name": c.name, "arguments": c.arguments}))
            .collect();
        InterruptInfo::new(reason, json!({ "toolCalls": calls })).with_id(new_id("int"))
    }

    // --- Helpers ---

    fn claim(&self, run_id: &str) -> Result<ActiveRun<'_>, AgentError> {
        if run_id.is_empty() {
            return Err(AgentError::InvalidState("run id is empty".into()));
        }
        let mut active = self.active.lock();
        if !active.insert(run_id.to_string()) {
            return Err(AgentError::InvalidState(format!("run {run_id} is already running")));
        }
        Ok(ActiveRun {
            active: &self.active,
            run_id: run_id.to_string(),
        })
    }

    async fn reject(&self, e: AgentError, sink: &EventSink) -> Result<RunReport, AgentError> {
        warn!(error = %e, code = e.code(), "rejecting invocation");
        let _ = sink
            .send(Event::run_error(e.to_string(), Some(e.code().to_string())))
            .await;
        Err(e)
    }

    async fn load_resumable(&self, input: &ResumeInput) -> Result<RunState, AgentError> {
        let run = self
            .store
            .load(&input.run_id)
            .await?
            .ok_or_else(|| AgentError::InvalidState(format!("unknown run {}", input.run_id)))?;
        if run.thread_id != input.thread_id {
            return Err(AgentError::InvalidState(format!(
                "run {} does not belong to thread {}",
                input.run_id, input.thread_id
            )));
        }
        if run.status != RunStatus::Interrupted {
            return Err(AgentError::InvalidState(format!(
                "run {} is {:?}, not interrupted",
                input.run_id, run.status
            )));
        }
        if let Some(ref wanted) = input.interrupt_id {
            let current = run.interrupt.as_ref().and_then(|i| i.id.as_deref());
            if current != Some(wanted.as_str()) {
                return Err(AgentError::InvalidState(format!(
                    "interrupt {wanted} is not pending on run {}",
                    input.run_id
                )));
            }
        }
        if run.is_stale(self.config.stale_after(), Utc::now()) {
            return Err(AgentError::StaleInterrupt {
                run_id: input.run_id.clone(),
            });
        }
        Ok(run)
    }

    fn context_for(&self, run: &RunState, cancel: &CancellationToken) -> RequestContext {
        RequestContext::for_run(
            &run.thread_id,
            &run.run_id,
            cancel.clone(),
            run.scope.clone(),
            run.state.clone(),
            run.executed.clone(),
        )
        .with_runtime_content(run.runtime.clone())
    }

    /// Server tools plus the caller's tools, server definitions winning on
    /// name clashes.
    fn options_for(&self, run: &RunState) -> ChatOptions {
        let registry = self.executor.registry();
        let mut tools = registry.schemas();
        tools.extend(
            run.tools
                .iter()
                .filter(|t| {
                    t.get("name")
                        .and_then(Value::as_str)
                        .map_or(true, |name| registry.schema(name).is_none())
                })
                .cloned(),
        );
        ChatOptions {
            model: Some(self.config.model.clone()),
            max_tokens: Some(self.config.max_tokens),
            temperature: None,
            tools,
        }
    }
}

/// An approval decision carried in a resume payload.
struct Decision {
    approved: bool,
    tool_call_ids: Option<Vec<String>>,
    answer: Option<Value>,
}

impl Decision {
    fn from_map(map: &mut serde_json::Map<String, Value>) -> Self {
        let approved = map.get("approved").and_then(Value::as_bool).unwrap_or(false);
        let tool_call_ids = map.get("toolCallIds").and_then(Value::as_array).map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });
        let answer = map.remove("answer").filter(|a| !a.is_null());
        Self {
            approved,
            tool_call_ids,
            answer,
        }
    }
}

/// Copy what the invocation changed on the context back onto the run.
fn absorb(run: &mut RunState, ctx: &RequestContext) {
    run.executed = ctx.executed();
    run.runtime = ctx.runtime_content();
    run.state = ctx.state();
    run.usage.accumulate(&ctx.usage_record().usage);
    run.updated_at = Utc::now();
}

async fn emit_state_delta(
    ctx: &RequestContext,
    last: &mut Value,
    sink: &EventSink,
) -> Result<(), AgentError> {
    let current = ctx.state();
    if current == *last {
        return Ok(());
    }
    let patch = json_patch::diff(last, &current);
    let ops = patch
        .0
        .iter()
        .filter_map(|op| serde_json::to_value(op).ok())
        .collect();
    *last = current;
    sink.send(Event::state_delta(ops)).await
}

fn report(run: &RunState) -> RunReport {
    let text = run
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.content.is_empty())
        .map(|m| m.content.clone())
        .unwrap_or_default();
    RunReport {
        thread_id: run.thread_id.clone(),
        run_id: run.run_id.clone(),
        status: run.status,
        interrupt: run.interrupt.clone(),
        text,
        usage: run.usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::events::RunOutcome;
    use crate::middleware::{ContextInjectionMiddleware, FunctionInvocationMiddleware, PipelineBuilder};
    use crate::resources::StaticContextResolver;
    use crate::tools::ToolHandler;
    use crate::transport::{RunAccumulator, TerminalOutcome};
    use crate::types::{ChatResponse, ContentPart};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    // --- Mock Provider ---

    struct MockProvider {
        responses: AsyncMutex<VecDeque<Result<ChatResponse, InferenceError>>>,
        seen: AsyncMutex<Vec<Vec<ChatMessage>>>,
    }

    impl MockProvider {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: AsyncMutex::new(responses.into_iter().map(Ok).collect()),
                seen: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for MockProvider {
        async fn respond(
            &self,
            messages: Vec<ChatMessage>,
            _options: &ChatOptions,
            _ctx: &RequestContext,
        ) -> Result<ChatResponse, InferenceError> {
            self.seen.lock().await.push(messages);
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(InferenceError::Request("no more mock responses".into())))
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl ToolHandler for Counter {
        async fn call(&self, _input: &Value, ctx: &RequestContext) -> Result<String, String> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.update_state(|s| s["count"] = json!(n));
            Ok(format!("count={n}"))
        }
    }

    fn engine(provider: Arc<MockProvider>, count: Arc<AtomicUsize>) -> Arc<RunEngine> {
        let tools = Arc::new(
            ToolRegistry::new()
                .add("bump", json!({"name": "bump"}), Counter(count.clone()))
                .add_with_approval("wipe", json!({"name": "wipe"}), Counter(count))
                .add_frontend("pick_color", json!({"name": "pick_color"})),
        );
        let pipeline = PipelineBuilder::new()
            .with(FunctionInvocationMiddleware::new(tools.clone()))
            .build(provider);
        Arc::new(RunEngine::new(pipeline, tools, AgentConfig::default()))
    }

    async fn collect(mut stream: EventStream) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    fn input(run_id: &str) -> RunInput {
        RunInput::new("t1", run_id).with_message(ChatMessage::user("hi"))
    }

    fn interrupt_of(events: &[Event]) -> InterruptInfo {
        match events.last() {
            Some(Event::RunFinished { outcome: RunOutcome::Interrupt, interrupt: Some(i), .. }) => {
                i.clone()
            }
            other => panic!("expected interrupt, got {other:?}"),
        }
    }

    #[test]
    fn pending_calls_skip_answered_ids() {
        let messages = vec![
            ChatMessage::assistant("").with_tool_calls(vec![
                ToolCall::new("a", "x", "{}"),
                ToolCall::new("b", "y", "{}"),
            ]),
            ChatMessage::tool("a", "done"),
        ];
        let pending = pending_tool_calls(&messages);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }

    #[tokio::test]
    async fn local_tool_run_succeeds_with_state_delta() {
        let count = Arc::new(AtomicUsize::new(0));
        let provider = MockProvider::new(vec![
            ChatResponse::tool_calls(vec![ToolCall::new("c1", "bump", "{}")]),
            ChatResponse::text("Bumped."),
        ]);
        let engine = engine(provider, count.clone());

        let events = collect(engine.start_stream(input("r1").with_state(json!({})))).await;
        let types: Vec<&str> = events.iter().map(Event::event_type).collect();

        assert_eq!(types.first(), Some(&"RUN_STARTED"));
        assert_eq!(types[1], "STATE_SNAPSHOT");
        assert!(types.contains(&"TOOL_CALL_RESULT"));
        assert!(types.contains(&"STATE_DELTA"));
        assert_eq!(types.iter().filter(|t| **t == "RUN_STARTED").count(), 1);
        assert!(matches!(
            events.last(),
            Some(Event::RunFinished { outcome: RunOutcome::Success, .. })
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(engine.status("r1").await.unwrap(), Some(RunStatus::Succeeded));
    }

    #[tokio::test]
    async fn frontend_call_interrupts_then_resumes_with_results() {
        let provider = MockProvider::new(vec![
            ChatResponse::tool_calls(vec![ToolCall::new("c1", "pick_color", "{}")]),
            ChatResponse::text("Blue it is."),
        ]);
        let engine = engine(provider.clone(), Arc::new(AtomicUsize::new(0)));

        let events = collect(engine.start_stream(input("r1"))).await;
        let interrupt = interrupt_of(&events);
        assert_eq!(interrupt.reason, TOOL_EXECUTION);
        assert_eq!(interrupt.payload["toolCalls"][0]["name"], "pick_color");

        let resume = ResumeInput::new("t1", "r1")
            .with_interrupt_id(interrupt.id.clone().unwrap())
            .with_tool_result(ToolResult::ok("c1", "blue"));
        let events = collect(engine.resume_stream(resume)).await;

        assert_eq!(events[0].event_type(), "RUN_STARTED");
        assert_eq!(events[1].event_type(), "TOOL_CALL_RESULT");
        assert!(matches!(
            events.last(),
            Some(Event::RunFinished { outcome: RunOutcome::Success, .. })
        ));
        let seen = provider.seen.lock().await;
        let last_call = seen.last().unwrap();
        assert_eq!(last_call.last().unwrap().content, "blue");
    }

    #[tokio::test]
    async fn duplicate_resume_is_rejected() {
        let provider = MockProvider::new(vec![
            ChatResponse::tool_calls(vec![ToolCall::new("c1", "pick_color", "{}")]),
            ChatResponse::text("ok"),
        ]);
        let engine = engine(provider, Arc::new(AtomicUsize::new(0)));
        let interrupt = interrupt_of(&collect(engine.start_stream(input("r1"))).await);

        let resume = ResumeInput::new("t1", "r1")
            .with_interrupt_id(interrupt.id.unwrap())
            .with_tool_result(ToolResult::ok("c1", "blue"));
        collect(engine.resume_stream(resume.clone())).await;

        let events = collect(engine.resume_stream(resume)).await;
        assert!(matches!(
            events.as_slice(),
            [Event::RunError { code: Some(code), .. }] if code == "invalid_state"
        ));
    }

    #[tokio::test]
    async fn denied_approval_still_answers_the_call() {
        let count = Arc::new(AtomicUsize::new(0));
        let provider = MockProvider::new(vec![
            ChatResponse::tool_calls(vec![ToolCall::new("c1", "wipe", "{}")]),
            ChatResponse::text("Understood, not wiping."),
        ]);
        let engine = engine(provider, count.clone());

        let interrupt = interrupt_of(&collect(engine.start_stream(input("r1"))).await);
        assert_eq!(interrupt.reason, HUMAN_APPROVAL);

        let resume = ResumeInput::new("t1", "r1").with_payload(json!({"approved": false}));
        let events = collect(engine.resume_stream(resume)).await;

        let result = events.iter().find_map(|e| match e {
            Event::ToolCallResult { content, .. } => Some(content.clone()),
            _ => None,
        });
        assert_eq!(result.as_deref(), Some(r#"{"error":"denied by user"}"#));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(matches!(
            events.last(),
            Some(Event::RunFinished { outcome: RunOutcome::Success, .. })
        ));
    }

    #[tokio::test]
    async fn approval_outranks_frontend_and_reinterrupts() {
        let count = Arc::new(AtomicUsize::new(0));
        let provider = MockProvider::new(vec![ChatResponse::tool_calls(vec![
            ToolCall::new("c1", "pick_color", "{}"),
            ToolCall::new("c2", "wipe", "{}"),
        ])]);
        let engine = engine(provider, count.clone());

        let interrupt = interrupt_of(&collect(engine.start_stream(input("r1"))).await);
        assert_eq!(interrupt.reason, HUMAN_APPROVAL);
        assert_eq!(interrupt.payload["toolCalls"].as_array().unwrap().len(), 1);

        let resume = ResumeInput::new("t1", "r1").with_payload(json!({"approved": true}));
        let events = collect(engine.resume_stream(resume)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let next = interrupt_of(&events);
        assert_eq!(next.reason, TOOL_EXECUTION);
        assert_eq!(next.payload["toolCalls"][0]["id"], "c1");
        assert_ne!(next.id, interrupt.id);
    }

    #[tokio::test]
    async fn starting_an_existing_run_is_rejected() {
        let provider = MockProvider::new(vec![ChatResponse::text("one")]);
        let engine = engine(provider, Arc::new(AtomicUsize::new(0)));
        collect(engine.start_stream(input("r1"))).await;

        let events = collect(engine.start_stream(input("r1"))).await;
        assert!(matches!(
            events.as_slice(),
            [Event::RunError { code: Some(code), .. }] if code == "invalid_state"
        ));
    }

    #[tokio::test]
    async fn provider_failure_emits_run_error_and_fails_the_run() {
        let provider = MockProvider::new(vec![]);
        let engine = engine(provider, Arc::new(AtomicUsize::new(0)));

        let events = collect(engine.start_stream(input("r1"))).await;
        assert!(matches!(
            events.last(),
            Some(Event::RunError { code: Some(code), .. }) if code == "provider_error"
        ));
        assert!(!events.iter().any(|e| matches!(e, Event::RunFinished { .. })));
        assert_eq!(engine.status("r1").await.unwrap(), Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn stale_interrupts_are_listed_and_refused() {
        let provider = MockProvider::new(vec![ChatResponse::tool_calls(vec![ToolCall::new(
            "c1",
            "pick_color",
            "{}",
        )])]);
        let store = Arc::new(InMemoryRunStore::new());
        let tools = Arc::new(ToolRegistry::new().add_frontend("pick_color", json!({})));
        let config = AgentConfig {
            stale_interrupt_after_secs: 60,
            ..AgentConfig::default()
        };
        let engine = Arc::new(RunEngine::new(provider, tools, config).with_store(store.clone()));

        collect(engine.start_stream(input("r1"))).await;
        let mut run = store.load("r1").await.unwrap().unwrap();
        run.interrupted_at = Some(Utc::now() - chrono::Duration::minutes(5));
        store.save(&run).await.unwrap();

        assert_eq!(engine.stale_runs().await.unwrap().len(), 1);
        let events = collect(engine.resume_stream(ResumeInput::new("t1", "r1"))).await;
        assert!(matches!(
            events.as_slice(),
            [Event::RunError { code: Some(code), .. }] if code == "stale_interrupt"
        ));
    }

    #[tokio::test]
    async fn repeated_call_id_streams_cleanly_into_an_accumulator() {
        let count = Arc::new(AtomicUsize::new(0));
        let provider = MockProvider::new(vec![
            ChatResponse::tool_calls(vec![ToolCall::new("same", "bump", "{}")]),
            ChatResponse::tool_calls(vec![ToolCall::new("same", "bump", "{}")]),
            ChatResponse::text("Done."),
        ]);
        let engine = engine(provider, count.clone());

        let events = collect(engine.start_stream(input("r1"))).await;
        let mut acc = RunAccumulator::new();
        for event in &events {
            acc.apply(event).unwrap();
        }

        let starts = events
            .iter()
            .filter(|e| matches!(e, Event::ToolCallStart { tool_call_id, .. } if tool_call_id == "same"))
            .count();
        let results = events
            .iter()
            .filter(|e| matches!(e, Event::ToolCallResult { .. }))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(results, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(acc.outcome(), Some(&TerminalOutcome::Success { result: None }));
    }

    struct Draw;

    #[async_trait]
    impl ToolHandler for Draw {
        async fn call(&self, _input: &Value, ctx: &RequestContext) -> Result<String, String> {
            ctx.add_runtime_content(ContentPart::Image {
                media_type: "image/png".into(),
                data: "AAAA".into(),
            });
            Ok("drawn".into())
        }
    }

    #[tokio::test]
    async fn runtime_content_from_an_interrupted_turn_reaches_the_model_after_resume() {
        let provider = MockProvider::new(vec![
            ChatResponse::tool_calls(vec![
                ToolCall::new("d1", "draw", "{}"),
                ToolCall::new("p1", "pick_color", "{}"),
            ]),
            ChatResponse::text("Nice picture."),
        ]);
        let tools = Arc::new(
            ToolRegistry::new()
                .add("draw", json!({"name": "draw"}), Draw)
                .add_frontend("pick_color", json!({"name": "pick_color"})),
        );
        let pipeline = PipelineBuilder::new()
            .with(ContextInjectionMiddleware::new(Arc::new(StaticContextResolver::new(vec![]))))
            .with(FunctionInvocationMiddleware::new(tools.clone()))
            .build(provider.clone());
        let store = Arc::new(InMemoryRunStore::new());
        let engine =
            Arc::new(RunEngine::new(pipeline, tools, AgentConfig::default()).with_store(store.clone()));

        let interrupt = interrupt_of(&collect(engine.start_stream(input("r1"))).await);
        let saved = store.load("r1").await.unwrap().unwrap();
        assert_eq!(saved.runtime.pending().len(), 1);

        let resume = ResumeInput::new("t1", "r1")
            .with_interrupt_id(interrupt.id.unwrap())
            .with_tool_result(ToolResult::ok("p1", "teal"));
        collect(engine.resume_stream(resume)).await;

        let seen = provider.seen.lock().await;
        let with_images: Vec<usize> = seen
            .iter()
            .map(|call| {
                call.iter()
                    .filter(|m| m.parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
                    .count()
            })
            .collect();
        assert_eq!(with_images, vec![0, 1]);
        assert!(store.load("r1").await.unwrap().unwrap().runtime.pending().is_empty());
    }

    #[tokio::test]
    async fn messages_snapshot_precedes_the_terminal_event() {
        let provider = MockProvider::new(vec![ChatResponse::text("hello")]);
        let tools = Arc::new(ToolRegistry::new());
        let config = AgentConfig {
            emit_messages_snapshot: true,
            ..AgentConfig::default()
        };
        let engine = Arc::new(RunEngine::new(provider, tools, config));

        let events = collect(engine.start_stream(input("r1"))).await;
        let n = events.len();
        match &events[n - 2] {
            Event::MessagesSnapshot { messages, .. } => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[1].content, "hello");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
}
