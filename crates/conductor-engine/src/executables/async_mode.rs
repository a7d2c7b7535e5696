use super::{ExecutableStrategy, ExecuteOutcome, StrategyContext};
use crate::errors::{EngineError, EngineResult};
use crate::step::StepKind;
use conductor_store::{CorrelationId, ExecutableResponse, ExecutionMode, ResponseData, Status};
use std::collections::BTreeMap;

/// Suspends on callback ids that some external party later answers through
/// `Orchestrator::handle_callback`.
#[derive(Debug, Default)]
pub struct AsyncStrategy;

#[async_trait::async_trait]
impl ExecutableStrategy for AsyncStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn start(&self, ctx: &StrategyContext<'_>) -> EngineResult<ExecuteOutcome> {
        let StepKind::Async(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let response = step.execute_async(ctx.step_ctx).await?;
        if response.callback_ids.is_empty() {
            return Err(EngineError::Runtime(format!(
                "async step '{}' returned no callback ids",
                ctx.node.step_type
            )));
        }
        if !matches!(response.status, Status::AsyncWaiting | Status::ApprovalWaiting) {
            return Err(EngineError::Runtime(format!(
                "async step '{}' cannot wait in {}",
                ctx.node.step_type, response.status
            )));
        }
        Ok(ExecuteOutcome::Waiting {
            status: response.status,
            response: ExecutableResponse::Async {
                callback_ids: response.callback_ids.clone(),
                status: response.status,
            },
            correlation_ids: response.callback_ids,
        })
    }

    async fn resume(
        &self,
        ctx: &StrategyContext<'_>,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<ExecuteOutcome> {
        let StepKind::Async(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        Ok(ExecuteOutcome::Completed(
            step.handle_async_response(ctx.step_ctx, responses).await?,
        ))
    }

    async fn abort(&self, ctx: &StrategyContext<'_>) -> EngineResult<()> {
        let StepKind::Async(step) = ctx.step else {
            return Ok(());
        };
        let callback_ids = ctx
            .node
            .executable_responses
            .iter()
            .rev()
            .find_map(|response| match response {
                ExecutableResponse::Async { callback_ids, .. } => Some(callback_ids.clone()),
                _ => None,
            })
            .unwrap_or_default();
        step.handle_abort(ctx.step_ctx, &callback_ids).await
    }
}
