use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::InferenceError;
use crate::resources::ContextResource;
use crate::types::{ChatMessage, ContentPart, ToolResult, Usage};

/// What the tracking layer observed across every model call of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub usage: Usage,
    pub final_text: String,
    pub responses: u32,
}

/// Request-scoped state handed explicitly through the pipeline and into tools.
///
/// Cheap to clone; clones share the same state. One context lives for one
/// invocation of a run (a start or a resume).
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

struct Inner {
    thread_id: String,
    run_id: String,
    scope: Value,
    cancel: CancellationToken,
    resources: Mutex<Option<Vec<ContextResource>>>,
    runtime: Mutex<RuntimeContent>,
    executed: Mutex<HashMap<String, ToolResult>>,
    state: Mutex<Value>,
    usage: Mutex<UsageRecord>,
}

/// Content added by tools during a run (output images and the like).
/// Items past `injected` have not reached the model yet.
///
/// Saved with the run, so content added just before an interrupt still
/// reaches the model after the resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContent {
    parts: Vec<ContentPart>,
    injected: usize,
    /// Messages already injected, keyed by the history length they follow.
    messages: Vec<(usize, ChatMessage)>,
}

impl RuntimeContent {
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty() && self.messages.is_empty()
    }

    /// Parts not yet shown to the model.
    pub fn pending(&self) -> &[ContentPart] {
        &self.parts[self.injected.min(self.parts.len())..]
    }
}

impl RequestContext {
    pub fn new(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self::build(thread_id.into(), run_id.into(), cancel, Value::Null, Value::Null, HashMap::new())
    }

    /// Context for a run with caller scope, initial shared state and the
    /// results of tool calls already executed in earlier invocations.
    pub fn for_run(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        cancel: CancellationToken,
        scope: Value,
        state: Value,
        executed: HashMap<String, ToolResult>,
    ) -> Self {
        Self::build(thread_id.into(), run_id.into(), cancel, scope, state, executed)
    }

    fn build(
        thread_id: String,
        run_id: String,
        cancel: CancellationToken,
        scope: Value,
        state: Value,
        executed: HashMap<String, ToolResult>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                thread_id,
                run_id,
                scope,
                cancel,
                resources: Mutex::new(None),
                runtime: Mutex::new(RuntimeContent::default()),
                executed: Mutex::new(executed),
                state: Mutex::new(state),
                usage: Mutex::new(UsageRecord::default()),
            }),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.inner.thread_id
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Caller-supplied scope (forwarded props). Resolvers read it to decide
    /// which context applies.
    pub fn scope(&self) -> &Value {
        &self.inner.scope
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), InferenceError> {
        if self.is_cancelled() {
            Err(InferenceError::Cancelled)
        } else {
            Ok(())
        }
    }

    // --- Context resources ---

    /// Resources resolved for this invocation, if resolution already ran.
    pub fn resolved_resources(&self) -> Option<Vec<ContextResource>> {
        self.inner.resources.lock().clone()
    }

    pub fn set_resolved_resources(&self, resources: Vec<ContextResource>) {
        *self.inner.resources.lock() = Some(resources);
    }

    /// Look up a resolved resource by id. Used by tools to fetch on-demand context.
    pub fn resource(&self, id: &str) -> Option<ContextResource> {
        self.inner
            .resources
            .lock()
            .as_ref()
            .and_then(|all| all.iter().find(|r| r.id == id).cloned())
    }

    // --- Runtime content ---

    /// Carry over runtime content from an earlier invocation of the run.
    pub fn with_runtime_content(self, content: RuntimeContent) -> Self {
        *self.inner.runtime.lock() = content;
        self
    }

    pub fn runtime_content(&self) -> RuntimeContent {
        self.inner.runtime.lock().clone()
    }

    /// Attach content for the model to see on its next call.
    pub fn add_runtime_content(&self, part: ContentPart) {
        self.inner.runtime.lock().parts.push(part);
    }

    /// True when content was added since the last injection.
    pub fn is_dirty(&self) -> bool {
        let runtime = self.inner.runtime.lock();
        runtime.parts.len() > runtime.injected
    }

    /// Take the content not yet injected and mark it clean.
    pub(crate) fn take_pending_content(&self) -> Vec<ContentPart> {
        let mut runtime = self.inner.runtime.lock();
        let pending = runtime.pending().to_vec();
        runtime.injected = runtime.parts.len();
        pending
    }

    pub(crate) fn record_injected_message(&self, anchor: usize, message: ChatMessage) {
        self.inner.runtime.lock().messages.push((anchor, message));
    }

    pub(crate) fn injected_messages(&self) -> Vec<(usize, ChatMessage)> {
        self.inner.runtime.lock().messages.clone()
    }

    // --- Tool ledger ---

    /// Result of a tool call already executed under this run, if any.
    pub fn executed_result(&self, tool_call_id: &str) -> Option<ToolResult> {
        self.inner.executed.lock().get(tool_call_id).cloned()
    }

    pub fn record_executed(&self, result: ToolResult) {
        self.inner
            .executed
            .lock()
            .insert(result.tool_call_id.clone(), result);
    }

    pub fn executed(&self) -> HashMap<String, ToolResult> {
        self.inner.executed.lock().clone()
    }

    // --- Shared state ---

    pub fn state(&self) -> Value {
        self.inner.state.lock().clone()
    }

    pub fn update_state(&self, f: impl FnOnce(&mut Value)) {
        f(&mut self.inner.state.lock());
    }

    // --- Tracking ---

    pub(crate) fn record_usage(&self, usage: &Usage) {
        self.inner.usage.lock().usage.accumulate(usage);
    }

    pub(crate) fn record_response_text(&self, text: String) {
        let mut record = self.inner.usage.lock();
        record.final_text = text;
        record.responses += 1;
    }

    pub fn usage_record(&self) -> UsageRecord {
        self.inner.usage.lock().clone()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("thread_id", &self.inner.thread_id)
            .field("run_id", &self.inner.run_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext::new("t", "r", CancellationToken::new())
    }

    #[test]
    fn clones_share_state() {
        let a = ctx();
        let b = a.clone();
        b.update_state(|s| *s = json!({"count": 1}));
        assert_eq!(a.state()["count"], 1);
    }

    #[test]
    fn runtime_content_goes_clean_after_take() {
        let c = ctx();
        assert!(!c.is_dirty());
        c.add_runtime_content(ContentPart::Text { text: "a".into() });
        assert!(c.is_dirty());
        assert_eq!(c.take_pending_content().len(), 1);
        assert!(!c.is_dirty());
        assert!(c.take_pending_content().is_empty());

        c.add_runtime_content(ContentPart::Text { text: "b".into() });
        let delta = c.take_pending_content();
        assert_eq!(delta, vec![ContentPart::Text { text: "b".into() }]);
    }

    #[test]
    fn runtime_content_carries_into_a_new_context() {
        let first = ctx();
        first.add_runtime_content(ContentPart::Text { text: "seen".into() });
        first.take_pending_content();
        first.record_injected_message(1, ChatMessage::user("").with_id("inj"));
        first.add_runtime_content(ContentPart::Text { text: "unseen".into() });

        let saved: RuntimeContent =
            serde_json::from_value(serde_json::to_value(first.runtime_content()).unwrap()).unwrap();
        assert_eq!(saved.pending(), [ContentPart::Text { text: "unseen".into() }]);

        let second = ctx().with_runtime_content(saved);
        assert!(second.is_dirty());
        assert_eq!(second.injected_messages()[0].1.id, "inj");
        assert_eq!(
            second.take_pending_content(),
            vec![ContentPart::Text { text: "unseen".into() }]
        );
    }

    #[test]
    fn cancellation_is_observed() {
        let token = CancellationToken::new();
        let c = RequestContext::new("t", "r", token.clone());
        assert!(c.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(c.check_cancelled(), Err(InferenceError::Cancelled)));
    }

    #[test]
    fn ledger_is_seeded_from_previous_invocations() {
        let mut executed = HashMap::new();
        executed.insert("c1".to_string(), ToolResult::ok("c1", "done"));
        let c = RequestContext::for_run(
            "t",
            "r",
            CancellationToken::new(),
            Value::Null,
            json!({}),
            executed,
        );
        assert_eq!(c.executed_result("c1").unwrap().content, "done");
        assert!(c.executed_result("c2").is_none());
    }
}
