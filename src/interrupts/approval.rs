use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::context::{AgentStatus, InterruptContext};
use super::{InterruptHandler, HUMAN_APPROVAL};
use crate::error::AgentError;
use crate::events::InterruptInfo;

/// What the human is asked to decide.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub thread_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_id: Option<String>,
    /// The interrupt payload, usually `{"toolCalls": [...]}`.
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self { approved: true, answer: None }
    }

    pub fn deny() -> Self {
        Self { approved: false, answer: None }
    }

    pub fn with_answer(mut self, answer: impl Into<Value>) -> Self {
        self.answer = Some(answer.into());
        self
    }

    /// The resume payload carrying this decision.
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({ "approved": self.approved });
        if let Some(ref answer) = self.answer {
            payload["answer"] = answer.clone();
        }
        payload
    }
}

/// Where approval requests are shown to a human. `request` returns once
/// the human has decided.
#[async_trait]
pub trait ApprovalSurface: Send + Sync {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, AgentError>;
}

/// Asks an [`ApprovalSurface`] and resumes with the decision.
pub struct HumanApprovalHandler {
    surface: Arc<dyn ApprovalSurface>,
}

impl HumanApprovalHandler {
    pub fn new(surface: Arc<dyn ApprovalSurface>) -> Self {
        Self { surface }
    }
}

#[async_trait]
impl InterruptHandler for HumanApprovalHandler {
    fn reason(&self) -> &str {
        HUMAN_APPROVAL
    }

    async fn handle(&self, interrupt: &InterruptInfo, ctx: &InterruptContext) -> Result<(), AgentError> {
        ctx.set_status(AgentStatus::AwaitingApproval);
        let decision = self
            .surface
            .request(ApprovalRequest {
                thread_id: ctx.thread_id().to_string(),
                run_id: ctx.run_id().to_string(),
                interrupt_id: interrupt.id.clone(),
                payload: interrupt.payload.clone(),
            })
            .await?;
        info!(run_id = ctx.run_id(), approved = decision.approved, "approval decided");
        ctx.resume(Some(decision.to_payload())).await
    }
}

// --- ChannelApprovalSurface ---

/// An approval waiting on a human. Answer it exactly once; dropping it
/// unanswered fails the request.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalDecision>,
}

impl PendingApproval {
    pub fn approve(self) {
        self.decide(ApprovalDecision::approve());
    }

    pub fn deny(self) {
        self.decide(ApprovalDecision::deny());
    }

    pub fn decide(self, decision: ApprovalDecision) {
        // The requester may have given up; nothing to do then.
        let _ = self.responder.send(decision);
    }
}

/// Hands approval requests to whoever holds the receiving end, such as a
/// UI task or a terminal prompt.
#[derive(Clone)]
pub struct ChannelApprovalSurface {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelApprovalSurface {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalSurface for ChannelApprovalSurface {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, AgentError> {
        let (responder, decision) = oneshot::channel();
        self.tx
            .send(PendingApproval { request, responder })
            .await
            .map_err(|_| AgentError::Approval("approval surface closed".into()))?;
        decision
            .await
            .map_err(|_| AgentError::Approval("approval dropped without a decision".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResumeInput;
    use crate::interrupts::Resumer;
    use crate::transport::{BoxEventStream, RunAccumulator};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CapturingResumer {
        payloads: Mutex<Vec<Option<Value>>>,
    }

    #[async_trait]
    impl Resumer for CapturingResumer {
        async fn resume(&self, input: ResumeInput) -> Result<BoxEventStream, AgentError> {
            self.payloads.lock().push(input.payload);
            Ok(Box::pin(futures::stream::empty::<Result<crate::events::Event, AgentError>>()))
        }
    }

    fn interrupt() -> InterruptInfo {
        InterruptInfo::new(HUMAN_APPROVAL, json!({"toolCalls": [{"id": "c1", "name": "wipe"}]}))
            .with_id("i1")
    }

    #[tokio::test]
    async fn resumes_with_the_decision_once_it_arrives() {
        let (surface, mut pending) = ChannelApprovalSurface::new(1);
        let resumer = Arc::new(CapturingResumer::default());
        let ctx = InterruptContext::new("t", "r", Some("i1".into()), &RunAccumulator::new(), resumer.clone());
        let handler = HumanApprovalHandler::new(Arc::new(surface));

        let human = tokio::spawn(async move {
            let approval = pending.recv().await.unwrap();
            assert_eq!(approval.request.payload["toolCalls"][0]["name"], "wipe");
            approval.decide(ApprovalDecision::approve().with_answer("go ahead"));
        });

        handler.handle(&interrupt(), &ctx).await.unwrap();
        human.await.unwrap();

        let payloads = resumer.payloads.lock();
        assert_eq!(payloads[0], Some(json!({"approved": true, "answer": "go ahead"})));
    }

    #[tokio::test]
    async fn denial_still_resumes() {
        let (surface, mut pending) = ChannelApprovalSurface::new(1);
        let resumer = Arc::new(CapturingResumer::default());
        let ctx = InterruptContext::new("t", "r", None, &RunAccumulator::new(), resumer.clone());

        tokio::spawn(async move { pending.recv().await.unwrap().deny() });
        HumanApprovalHandler::new(Arc::new(surface))
            .handle(&interrupt(), &ctx)
            .await
            .unwrap();

        assert_eq!(resumer.payloads.lock()[0], Some(json!({"approved": false})));
    }

    #[tokio::test]
    async fn dropped_request_is_an_approval_error() {
        let (surface, mut pending) = ChannelApprovalSurface::new(1);
        tokio::spawn(async move { drop(pending.recv().await) });

        let err = surface
            .request(ApprovalRequest {
                thread_id: "t".into(),
                run_id: "r".into(),
                interrupt_id: None,
                payload: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Approval(_)));
    }
}
