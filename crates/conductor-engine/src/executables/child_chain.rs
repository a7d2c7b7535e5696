use super::{ChildLaunch, ExecutableStrategy, ExecuteOutcome, StrategyContext, child_response};
use crate::errors::{EngineError, EngineResult};
use crate::step::{ChildChainResponse, StepKind};
use conductor_store::{CorrelationId, ExecutableResponse, ExecutionMode, ResponseData};
use serde_json::Value;
use std::collections::BTreeMap;

/// Runs children one at a time. The pass-through document rides along in the
/// node's executable responses, so the chain survives a process restart.
#[derive(Debug, Default)]
pub struct ChildChainStrategy;

impl ChildChainStrategy {
    async fn advance(
        &self,
        ctx: &StrategyContext<'_>,
        chain: ChildChainResponse,
        last: Option<&conductor_store::StepResponseNotifyData>,
    ) -> EngineResult<ExecuteOutcome> {
        let StepKind::ChildChain(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        match chain.next_child {
            Some(spec) => {
                let launch = ChildLaunch::from_spec(spec);
                Ok(ExecuteOutcome::Spawn {
                    response: ExecutableResponse::ChildChain {
                        next_child_id: launch.plan_node_id.clone(),
                        child_runtime_id: launch.runtime_id.clone(),
                        pass_through: chain.pass_through,
                        last_link: chain.last_link,
                        input_overrides: launch.input_overrides.clone(),
                    },
                    children: vec![launch],
                })
            }
            None => Ok(ExecuteOutcome::Completed(
                step.finalize_execution(ctx.step_ctx, &chain.pass_through, last)
                    .await?,
            )),
        }
    }
}

fn current_link(ctx: &StrategyContext<'_>) -> Option<(String, Value, bool)> {
    ctx.node
        .executable_responses
        .iter()
        .rev()
        .find_map(|response| match response {
            ExecutableResponse::ChildChain {
                child_runtime_id,
                pass_through,
                last_link,
                ..
            } => Some((child_runtime_id.clone(), pass_through.clone(), *last_link)),
            _ => None,
        })
}

#[async_trait::async_trait]
impl ExecutableStrategy for ChildChainStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::ChildChain
    }

    async fn start(&self, ctx: &StrategyContext<'_>) -> EngineResult<ExecuteOutcome> {
        let StepKind::ChildChain(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let chain = step.execute_first_child(ctx.step_ctx).await?;
        self.advance(ctx, chain, None).await
    }

    /// A broken child or the last link ends the chain; otherwise the step picks
    /// the next child from the previous result.
    async fn resume(
        &self,
        ctx: &StrategyContext<'_>,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<ExecuteOutcome> {
        let StepKind::ChildChain(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let (child_runtime_id, pass_through, last_link) = current_link(ctx).ok_or_else(|| {
            EngineError::Runtime(format!("node '{}' has no chain link", ctx.node.uuid))
        })?;
        let previous = child_response(responses, &child_runtime_id)?;
        if last_link || !previous.status.is_positive() {
            return Ok(ExecuteOutcome::Completed(
                step.finalize_execution(ctx.step_ctx, &pass_through, Some(&previous))
                    .await?,
            ));
        }
        let chain = step
            .execute_next_child(ctx.step_ctx, &pass_through, &previous)
            .await?;
        self.advance(ctx, chain, Some(&previous)).await
    }
}
