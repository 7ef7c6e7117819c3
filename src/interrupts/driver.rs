use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::{AgentStatus, InterruptContext};
use super::{InterruptRegistry, Resumer};
use crate::engine::{ResumeInput, RunEngine};
use crate::error::{AgentError, ProtocolError};
use crate::events::Event;
use crate::transport::{BoxEventStream, RunAccumulator, TerminalOutcome};

/// Resumes runs on an in-process engine.
pub struct EngineResumer {
    engine: Arc<RunEngine>,
}

impl EngineResumer {
    pub fn new(engine: Arc<RunEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Resumer for EngineResumer {
    async fn resume(&self, input: ResumeInput) -> Result<BoxEventStream, AgentError> {
        Ok(self.engine.resume_stream(input).boxed())
    }
}

/// Consumer-side loop: reads a run's events, hands interrupts to the
/// registered handlers and follows the continuation when one resumes.
///
/// The accumulator persists across resumes, so handlers always see the
/// whole conversation.
pub struct RunDriver {
    registry: InterruptRegistry,
    resumer: Arc<dyn Resumer>,
    status: Arc<watch::Sender<AgentStatus>>,
    accumulator: RunAccumulator,
}

impl RunDriver {
    pub fn new(registry: InterruptRegistry, resumer: Arc<dyn Resumer>) -> Self {
        Self {
            registry,
            resumer,
            status: Arc::new(watch::channel(AgentStatus::Idle).0),
            accumulator: RunAccumulator::new(),
        }
    }

    /// Watch what the agent is doing.
    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    pub fn accumulator(&self) -> &RunAccumulator {
        &self.accumulator
    }

    /// Consume `stream` through every interrupt until the run finishes,
    /// fails, or pauses with no handler willing to resume it.
    ///
    /// `on_event` sees each event after it has been validated.
    pub async fn drive<F>(&mut self, stream: BoxEventStream, mut on_event: F) -> Result<TerminalOutcome, AgentError>
    where
        F: FnMut(&Event) + Send,
    {
        self.status.send_replace(AgentStatus::Working);
        let result = self.drive_inner(stream, &mut on_event).await;
        self.status.send_replace(AgentStatus::Idle);
        result
    }

    async fn drive_inner<F>(&mut self, mut stream: BoxEventStream, on_event: &mut F) -> Result<TerminalOutcome, AgentError>
    where
        F: FnMut(&Event) + Send,
    {
        let mut ids = None;
        loop {
            let outcome = self.consume(&mut stream, on_event, &mut ids).await?;
            let TerminalOutcome::Interrupt(interrupt) = outcome else {
                return Ok(outcome);
            };
            let Some((thread_id, run_id)) = ids.clone() else {
                return Err(ProtocolError::Malformed("interrupt before RUN_STARTED".into()).into());
            };

            info!(reason = %interrupt.reason, run_id = %run_id, "run paused");
            let ctx = InterruptContext::new(
                thread_id,
                run_id,
                interrupt.id.clone(),
                &self.accumulator,
                self.resumer.clone(),
            )
            .with_status(self.status.clone());

            self.registry.handle(&interrupt, &ctx).await?;
            match ctx.take_resumed() {
                Some(next) => {
                    debug!("following resumed run");
                    stream = next;
                }
                None => return Ok(TerminalOutcome::Interrupt(interrupt)),
            }
        }
    }

    /// Read until a terminal event. Anything past it on the same stream is
    /// ignored.
    async fn consume<F>(
        &mut self,
        stream: &mut BoxEventStream,
        on_event: &mut F,
        ids: &mut Option<(String, String)>,
    ) -> Result<TerminalOutcome, AgentError>
    where
        F: FnMut(&Event) + Send,
    {
        while let Some(event) = stream.next().await {
            let event = event?;
            self.accumulator.apply(&event)?;
            if let Event::RunStarted { thread_id, run_id, .. } = &event {
                *ids = Some((thread_id.clone(), run_id.clone()));
            }
            on_event(&event);
            if event.is_terminal() {
                if let Some(outcome) = self.accumulator.outcome() {
                    return Ok(outcome.clone());
                }
            }
        }
        warn!("event stream ended without a terminal event");
        Err(ProtocolError::Malformed("stream ended without a terminal event".into()).into())
    }
}

impl std::fmt::Debug for RunDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunDriver")
            .field("registry", &self.registry)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InterruptInfo;
    use crate::interrupts::{DefaultInterruptHandler, InterruptHandler, TOOL_EXECUTION};
    use parking_lot::Mutex;
    use serde_json::json;

    fn boxed(events: Vec<Event>) -> BoxEventStream {
        Box::pin(futures::stream::iter(events.into_iter().map(Ok)))
    }

    /// Serves a canned continuation for every resume.
    struct Scripted {
        continuation: Mutex<Option<Vec<Event>>>,
        inputs: Mutex<Vec<ResumeInput>>,
    }

    #[async_trait]
    impl Resumer for Scripted {
        async fn resume(&self, input: ResumeInput) -> Result<BoxEventStream, AgentError> {
            self.inputs.lock().push(input);
            let events = self
                .continuation
                .lock()
                .take()
                .ok_or_else(|| AgentError::InvalidState("resumed twice".into()))?;
            Ok(boxed(events))
        }
    }

    struct AlwaysResume;

    #[async_trait]
    impl InterruptHandler for AlwaysResume {
        fn reason(&self) -> &str {
            TOOL_EXECUTION
        }

        async fn handle(&self, _: &InterruptInfo, ctx: &InterruptContext) -> Result<(), AgentError> {
            ctx.resume(Some(json!({"ok": true}))).await
        }
    }

    fn paused() -> Vec<Event> {
        vec![
            Event::run_started("t", "r"),
            Event::run_interrupted("t", "r", InterruptInfo::new(TOOL_EXECUTION, json!({})).with_id("i1")),
        ]
    }

    #[tokio::test]
    async fn follows_the_continuation_to_completion() {
        let resumer = Arc::new(Scripted {
            continuation: Mutex::new(Some(vec![
                Event::run_started("t", "r"),
                Event::run_finished("t", "r", Some(json!("done"))),
            ])),
            inputs: Mutex::new(Vec::new()),
        });
        let mut driver = RunDriver::new(InterruptRegistry::new().with(AlwaysResume), resumer.clone());
        let status = driver.subscribe();

        let mut seen = Vec::new();
        let outcome = driver
            .drive(boxed(paused()), |e| seen.push(e.event_type()))
            .await
            .unwrap();

        assert_eq!(outcome, TerminalOutcome::Success { result: Some(json!("done")) });
        assert_eq!(seen, vec!["RUN_STARTED", "RUN_FINISHED", "RUN_STARTED", "RUN_FINISHED"]);
        assert_eq!(resumer.inputs.lock()[0].interrupt_id.as_deref(), Some("i1"));
        assert_eq!(*status.borrow(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn fallback_leaves_the_run_paused() {
        let resumer = Arc::new(Scripted {
            continuation: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
        });
        let mut driver = RunDriver::new(InterruptRegistry::new().with(DefaultInterruptHandler), resumer.clone());

        let outcome = driver.drive(boxed(paused()), |_| {}).await.unwrap();

        assert!(matches!(outcome, TerminalOutcome::Interrupt(ref i) if i.reason == TOOL_EXECUTION));
        assert!(resumer.inputs.lock().is_empty());
    }

    #[tokio::test]
    async fn unhandled_interrupt_is_an_error() {
        let resumer = Arc::new(Scripted {
            continuation: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
        });
        let mut driver = RunDriver::new(InterruptRegistry::new(), resumer);

        let err = driver.drive(boxed(paused()), |_| {}).await.unwrap_err();
        assert!(matches!(err, AgentError::UnhandledInterrupt { .. }));
    }

    #[tokio::test]
    async fn truncated_stream_is_malformed() {
        let resumer = Arc::new(Scripted {
            continuation: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
        });
        let mut driver = RunDriver::new(InterruptRegistry::new(), resumer);

        let err = driver
            .drive(boxed(vec![Event::run_started("t", "r")]), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Protocol(ProtocolError::Malformed(_))));
    }
}
