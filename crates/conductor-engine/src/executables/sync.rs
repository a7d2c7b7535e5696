use super::{ExecutableStrategy, ExecuteOutcome, StrategyContext};
use crate::errors::{EngineError, EngineResult};
use crate::step::StepKind;
use conductor_store::{CorrelationId, ExecutionMode, ResponseData};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct SyncStrategy;

#[async_trait::async_trait]
impl ExecutableStrategy for SyncStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }

    async fn start(&self, ctx: &StrategyContext<'_>) -> EngineResult<ExecuteOutcome> {
        let StepKind::Sync(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        Ok(ExecuteOutcome::Completed(step.execute_sync(ctx.step_ctx).await?))
    }

    async fn resume(
        &self,
        ctx: &StrategyContext<'_>,
        _responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<ExecuteOutcome> {
        Err(EngineError::Runtime(format!(
            "sync node '{}' has nothing to resume",
            ctx.node.uuid
        )))
    }
}
