pub mod approval;
pub mod context;
pub mod driver;
pub mod fallback;
pub mod tool_execution;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::engine::ResumeInput;
use crate::error::AgentError;
use crate::events::InterruptInfo;
use crate::transport::BoxEventStream;

pub use approval::{
    ApprovalDecision, ApprovalRequest, ApprovalSurface, ChannelApprovalSurface,
    HumanApprovalHandler, PendingApproval,
};
pub use context::{AgentStatus, InterruptContext};
pub use driver::{EngineResumer, RunDriver};
pub use fallback::DefaultInterruptHandler;
pub use tool_execution::ToolExecutionHandler;

/// Pending calls need executing by the caller.
pub const TOOL_EXECUTION: &str = "tool_execution";
/// Pending calls need a human decision first.
pub const HUMAN_APPROVAL: &str = "human_approval";
/// Registry slot consulted when no handler matches the reason.
pub const FALLBACK: &str = "*";

/// Resolves one kind of interrupt, usually ending in [`InterruptContext::resume`].
#[async_trait]
pub trait InterruptHandler: Send + Sync {
    /// The interrupt reason this handler answers, or [`FALLBACK`].
    fn reason(&self) -> &str;

    async fn handle(&self, interrupt: &InterruptInfo, ctx: &InterruptContext) -> Result<(), AgentError>;
}

/// Something that can continue a paused run and stream the continuation.
#[async_trait]
pub trait Resumer: Send + Sync {
    async fn resume(&self, input: ResumeInput) -> Result<BoxEventStream, AgentError>;
}

/// Routes interrupts to handlers by reason.
#[derive(Default, Clone)]
pub struct InterruptRegistry {
    handlers: HashMap<String, Arc<dyn InterruptHandler>>,
    fallback: Option<Arc<dyn InterruptHandler>>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the handler's reason. A later registration for the
    /// same reason replaces the earlier one. The fallback is a single slot,
    /// so a second [`FALLBACK`] handler replaces the first with a warning.
    pub fn register(&mut self, handler: impl InterruptHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn InterruptHandler>) {
        let reason = handler.reason().to_string();
        if reason == FALLBACK {
            if self.fallback.replace(handler).is_some() {
                warn!("replaced the fallback interrupt handler");
            }
        } else if self.handlers.insert(reason.clone(), handler).is_some() {
            debug!(reason = %reason, "replaced interrupt handler");
        }
    }

    pub fn register_all(&mut self, handlers: impl IntoIterator<Item = Arc<dyn InterruptHandler>>) {
        for handler in handlers {
            self.register_arc(handler);
        }
    }

    pub fn with(mut self, handler: impl InterruptHandler + 'static) -> Self {
        self.register(handler);
        self
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
        self.fallback = None;
    }

    /// Exact match first, then the fallback.
    pub fn get(&self, reason: &str) -> Option<&Arc<dyn InterruptHandler>> {
        self.handlers.get(reason).or(self.fallback.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len() + usize::from(self.fallback.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch if some handler applies. `Ok(false)` when none does.
    pub async fn try_handle(
        &self,
        interrupt: &InterruptInfo,
        ctx: &InterruptContext,
    ) -> Result<bool, AgentError> {
        let Some(handler) = self.get(&interrupt.reason) else {
            return Ok(false);
        };
        info!(
            reason = %interrupt.reason,
            handler = handler.reason(),
            run_id = ctx.run_id(),
            "dispatching interrupt"
        );
        handler.handle(interrupt, ctx).await?;
        Ok(true)
    }

    pub async fn handle(&self, interrupt: &InterruptInfo, ctx: &InterruptContext) -> Result<(), AgentError> {
        if self.try_handle(interrupt, ctx).await? {
            Ok(())
        } else {
            Err(AgentError::UnhandledInterrupt {
                reason: interrupt.reason.clone(),
            })
        }
    }
}

impl std::fmt::Debug for InterruptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptRegistry")
            .field("reasons", &self.handlers.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
