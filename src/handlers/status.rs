//! `/agent/status`: snapshot of the agent state

use crate::dispatch::{CommandHandler, CommandRequest, HandlerContext, HandlerOutcome};
use crate::error::HandlerError;
use async_trait::async_trait;

pub const AGENT_STATUS_TOPIC: &str = "/agent/status";

pub struct AgentStatusHandler;

#[async_trait]
impl CommandHandler for AgentStatusHandler {
    fn name(&self) -> &str {
        "agent_status"
    }

    async fn handle(
        &self,
        _request: CommandRequest,
        ctx: HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let snapshot = ctx.status.snapshot().snapshot();
        Ok(HandlerOutcome::json(serde_json::to_value(snapshot)?))
    }
}
