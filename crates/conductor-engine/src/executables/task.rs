use super::{ExecutableStrategy, ExecuteOutcome, StrategyContext, single_response};
use crate::errors::{EngineError, EngineResult};
use crate::notifier::CallbackSender;
use crate::retry::{RetryBackoffConfig, retry_with_backoff};
use crate::step::StepKind;
use crate::task::SharedTaskExecutor;
use conductor_store::{CorrelationId, ExecutableResponse, ExecutionMode, ResponseData, Status};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Hands work to a [`crate::task::TaskExecutor`] and waits on the task id.
pub struct TaskStrategy {
    executor: SharedTaskExecutor,
    callbacks: CallbackSender,
    abort_backoff: RetryBackoffConfig,
}

impl TaskStrategy {
    pub fn new(
        executor: SharedTaskExecutor,
        callbacks: CallbackSender,
        abort_backoff: RetryBackoffConfig,
    ) -> Self {
        Self {
            executor,
            callbacks,
            abort_backoff,
        }
    }
}

fn pending_task(ctx: &StrategyContext<'_>) -> Option<(String, String)> {
    ctx.node
        .executable_responses
        .iter()
        .rev()
        .find_map(|response| match response {
            ExecutableResponse::Task { task_id, task_type } => {
                Some((task_id.clone(), task_type.clone()))
            }
            _ => None,
        })
}

#[async_trait::async_trait]
impl ExecutableStrategy for TaskStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Task
    }

    async fn start(&self, ctx: &StrategyContext<'_>) -> EngineResult<ExecuteOutcome> {
        let StepKind::Task(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let mut request = step.obtain_task(ctx.step_ctx).await?;
        request.node_execution_id = ctx.node.uuid.clone();
        let task_type = request.task_type.clone();
        let task_id = self.executor.submit(request, self.callbacks.clone()).await?;
        debug!(
            node_execution_id = %ctx.node.uuid,
            task_id = %task_id,
            task_type = %task_type,
            "task submitted"
        );
        Ok(ExecuteOutcome::Waiting {
            status: Status::TaskWaiting,
            response: ExecutableResponse::Task {
                task_id: task_id.clone(),
                task_type,
            },
            correlation_ids: vec![task_id],
        })
    }

    async fn resume(
        &self,
        ctx: &StrategyContext<'_>,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<ExecuteOutcome> {
        let StepKind::Task(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let (task_id, _) = pending_task(ctx).ok_or_else(|| {
            EngineError::Runtime(format!("node '{}' has no submitted task", ctx.node.uuid))
        })?;
        let data = single_response(responses, &task_id)?;
        Ok(ExecuteOutcome::Completed(
            step.handle_task_result(ctx.step_ctx, &task_id, data).await?,
        ))
    }

    /// Failing to reach the executor never blocks the local abort.
    async fn abort(&self, ctx: &StrategyContext<'_>) -> EngineResult<()> {
        let Some((task_id, _)) = pending_task(ctx) else {
            return Ok(());
        };
        let seed = ctx.node.created_at;
        let result = retry_with_backoff(&self.abort_backoff, seed, |attempt| {
            let executor = self.executor.clone();
            let task_id = task_id.clone();
            async move {
                debug!(task_id = %task_id, attempt, "requesting task abort");
                executor.abort(&task_id).await
            }
        })
        .await;
        if let Err(error) = result {
            warn!(
                node_execution_id = %ctx.node.uuid,
                task_id = %task_id,
                error = %error,
                "task abort did not reach the executor"
            );
        }
        Ok(())
    }
}
