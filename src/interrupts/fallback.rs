use async_trait::async_trait;
use tracing::info;

use super::context::{AgentStatus, InterruptContext};
use super::{InterruptHandler, FALLBACK};
use crate::error::AgentError;
use crate::events::InterruptInfo;

/// Catch-all for reasons nothing else handles. Leaves the run paused.
pub struct DefaultInterruptHandler;

#[async_trait]
impl InterruptHandler for DefaultInterruptHandler {
    fn reason(&self) -> &str {
        FALLBACK
    }

    async fn handle(&self, interrupt: &InterruptInfo, ctx: &InterruptContext) -> Result<(), AgentError> {
        info!(reason = %interrupt.reason, run_id = ctx.run_id(), "no handler for interrupt, run stays paused");
        ctx.set_status(AgentStatus::Idle);
        Ok(())
    }
}
