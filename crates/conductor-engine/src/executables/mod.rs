pub mod async_mode;
pub mod child;
pub mod child_chain;
pub mod children;
pub mod sync;
pub mod task;

use crate::errors::{EngineError, EngineResult};
use crate::plan::PlanNode;
use crate::step::{ChildSpec, StepContext, StepKind, StepResponse};
use crate::task::SharedTaskExecutor;
use crate::notifier::CallbackSender;
use crate::retry::RetryBackoffConfig;
use conductor_store::{
    CorrelationId, ExecutableResponse, ExecutionMode, NodeExecution, ResponseData, Status,
};
use serde_json::Value;
use std::collections::BTreeMap;

pub use async_mode::AsyncStrategy;
pub use child::ChildStrategy;
pub use child_chain::ChildChainStrategy;
pub use children::{ChildrenStrategy, JoinPolicy, aggregate_children, aggregate_status};
pub use sync::SyncStrategy;
pub use task::TaskStrategy;

/// A child node the orchestrator must create and start under the current one.
#[derive(Clone, Debug, PartialEq)]
pub struct ChildLaunch {
    pub plan_node_id: String,
    pub runtime_id: String,
    pub input_overrides: BTreeMap<String, Value>,
}

impl ChildLaunch {
    pub fn from_spec(spec: ChildSpec) -> Self {
        Self {
            plan_node_id: spec.child_node_id,
            runtime_id: uuid::Uuid::new_v4().to_string(),
            input_overrides: spec.input_overrides,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExecuteOutcome {
    /// The step settled; conclude the node with this response.
    Completed(StepResponse),
    /// Suspend in `status` until every correlation id has a response.
    Waiting {
        status: Status,
        response: ExecutableResponse,
        correlation_ids: Vec<CorrelationId>,
    },
    /// Create and start `children`, then wait for all of them.
    Spawn {
        response: ExecutableResponse,
        children: Vec<ChildLaunch>,
    },
}

pub struct StrategyContext<'a> {
    pub step: &'a StepKind,
    pub step_ctx: &'a StepContext,
    pub node: &'a NodeExecution,
    pub plan_node: &'a PlanNode,
}

impl StrategyContext<'_> {
    pub(crate) fn mismatch(&self, expected: ExecutionMode) -> EngineError {
        EngineError::ModeMismatch {
            step_type: self.node.step_type.clone(),
            expected,
            actual: self.step.mode(),
        }
    }
}

#[async_trait::async_trait]
pub trait ExecutableStrategy: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    async fn start(&self, ctx: &StrategyContext<'_>) -> EngineResult<ExecuteOutcome>;

    /// Called with the responses of a completed wait.
    async fn resume(
        &self,
        ctx: &StrategyContext<'_>,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<ExecuteOutcome>;

    /// Best-effort cancellation of outstanding work before the node is aborted.
    async fn abort(&self, _ctx: &StrategyContext<'_>) -> EngineResult<()> {
        Ok(())
    }
}

/// Closed mode-to-strategy lookup, built once per orchestrator.
pub struct StrategyTable {
    sync: SyncStrategy,
    async_mode: AsyncStrategy,
    task: TaskStrategy,
    child: ChildStrategy,
    children: ChildrenStrategy,
    child_chain: ChildChainStrategy,
}

impl StrategyTable {
    pub fn new(
        task_executor: SharedTaskExecutor,
        callbacks: CallbackSender,
        abort_backoff: RetryBackoffConfig,
    ) -> Self {
        Self {
            sync: SyncStrategy,
            async_mode: AsyncStrategy,
            task: TaskStrategy::new(task_executor, callbacks, abort_backoff),
            child: ChildStrategy,
            children: ChildrenStrategy,
            child_chain: ChildChainStrategy,
        }
    }

    pub fn for_mode(&self, mode: ExecutionMode) -> &dyn ExecutableStrategy {
        match mode {
            ExecutionMode::Sync => &self.sync,
            ExecutionMode::Async => &self.async_mode,
            ExecutionMode::Task => &self.task,
            ExecutionMode::Child => &self.child,
            ExecutionMode::Children => &self.children,
            ExecutionMode::ChildChain => &self.child_chain,
        }
    }
}

pub(crate) fn single_response<'a>(
    responses: &'a BTreeMap<CorrelationId, ResponseData>,
    correlation_id: &str,
) -> EngineResult<&'a ResponseData> {
    responses.get(correlation_id).ok_or_else(|| {
        EngineError::Runtime(format!("no response recorded for '{correlation_id}'"))
    })
}

pub(crate) fn child_response(
    responses: &BTreeMap<CorrelationId, ResponseData>,
    child_runtime_id: &str,
) -> EngineResult<conductor_store::StepResponseNotifyData> {
    single_response(responses, child_runtime_id)?
        .as_step_response()
        .cloned()
        .ok_or_else(|| {
            EngineError::Runtime(format!(
                "child '{child_runtime_id}' reported a non step response"
            ))
        })
}
