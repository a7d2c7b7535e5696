use super::{ChildLaunch, ExecutableStrategy, ExecuteOutcome, StrategyContext, child_response};
use crate::errors::{EngineError, EngineResult};
use crate::step::StepKind;
use conductor_store::{CorrelationId, ExecutableResponse, ExecutionMode, ResponseData};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct ChildStrategy;

#[async_trait::async_trait]
impl ExecutableStrategy for ChildStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Child
    }

    async fn start(&self, ctx: &StrategyContext<'_>) -> EngineResult<ExecuteOutcome> {
        let StepKind::Child(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let launch = ChildLaunch::from_spec(step.obtain_child(ctx.step_ctx).await?);
        Ok(ExecuteOutcome::Spawn {
            response: ExecutableResponse::Child {
                child_node_id: launch.plan_node_id.clone(),
                child_runtime_id: launch.runtime_id.clone(),
                input_overrides: launch.input_overrides.clone(),
            },
            children: vec![launch],
        })
    }

    async fn resume(
        &self,
        ctx: &StrategyContext<'_>,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<ExecuteOutcome> {
        let StepKind::Child(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let child_runtime_id = ctx
            .node
            .executable_responses
            .iter()
            .rev()
            .find_map(|response| match response {
                ExecutableResponse::Child {
                    child_runtime_id, ..
                } => Some(child_runtime_id.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                EngineError::Runtime(format!("node '{}' has no spawned child", ctx.node.uuid))
            })?;
        let child = child_response(responses, &child_runtime_id)?;
        Ok(ExecuteOutcome::Completed(
            step.handle_child_response(ctx.step_ctx, &child).await?,
        ))
    }
}
