use crate::errors::{EngineError, EngineResult};
use crate::executables::children::{JoinPolicy, aggregate_children};
use conductor_store::{
    Ambiance, CorrelationId, ExecutionMode, FailureInfo, FailureType, Outcomes, ResponseData,
    Status, StepResponseNotifyData,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepingOutput {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub group: Option<String>,
}

/// Result of a step once its work is done.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default)]
    pub outcomes: Outcomes,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub sweeping_outputs: Vec<SweepingOutput>,
}

impl StepResponse {
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            outcomes: Outcomes::new(),
            failure_info: None,
            sweeping_outputs: Vec::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::with_status(Status::Succeeded)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            failure_info: Some(FailureInfo::new(message, FailureType::Application)),
            ..Self::with_status(Status::Failed)
        }
    }

    pub fn outcome(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outcomes.insert(key.into(), value);
        self
    }

    pub fn output(mut self, name: impl Into<String>, value: Value) -> Self {
        self.sweeping_outputs.push(SweepingOutput {
            name: name.into(),
            value,
            group: None,
        });
        self
    }

    pub fn group_output(
        mut self,
        name: impl Into<String>,
        value: Value,
        group: impl Into<String>,
    ) -> Self {
        self.sweeping_outputs.push(SweepingOutput {
            name: name.into(),
            value,
            group: Some(group.into()),
        });
        self
    }
}

/// Values a step reads: resolved sweeping outputs plus per-child overrides.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepInputs {
    pub resolved: BTreeMap<String, Value>,
    pub overrides: BTreeMap<String, Value>,
}

impl StepInputs {
    /// Overrides shadow resolved outputs of the same name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.overrides
            .get(name)
            .or_else(|| self.resolved.get(name))
    }
}

#[derive(Clone, Debug)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub node_execution_id: String,
    pub step_parameters: Value,
    pub inputs: StepInputs,
}

impl StepContext {
    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.step_parameters.get(key)
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameter(key).and_then(Value::as_str)
    }

    pub fn new_callback_id(&self) -> CorrelationId {
        uuid::Uuid::new_v4().to_string()
    }
}

#[async_trait::async_trait]
pub trait SyncExecutable: Send + Sync {
    async fn execute_sync(&self, ctx: &StepContext) -> EngineResult<StepResponse>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct AsyncExecutableResponse {
    pub callback_ids: Vec<CorrelationId>,
    pub status: Status,
}

impl AsyncExecutableResponse {
    pub fn new(callback_ids: Vec<CorrelationId>) -> Self {
        Self {
            callback_ids,
            status: Status::AsyncWaiting,
        }
    }

    /// Waits for a human decision instead of a machine callback.
    pub fn approval(callback_ids: Vec<CorrelationId>) -> Self {
        Self {
            callback_ids,
            status: Status::ApprovalWaiting,
        }
    }
}

#[async_trait::async_trait]
pub trait AsyncExecutable: Send + Sync {
    async fn execute_async(&self, ctx: &StepContext) -> EngineResult<AsyncExecutableResponse>;

    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<StepResponse>;

    async fn handle_abort(
        &self,
        _ctx: &StepContext,
        _callback_ids: &[CorrelationId],
    ) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub node_execution_id: String,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
            node_execution_id: String::new(),
        }
    }
}

#[async_trait::async_trait]
pub trait TaskExecutable: Send + Sync {
    async fn obtain_task(&self, ctx: &StepContext) -> EngineResult<TaskRequest>;

    async fn handle_task_result(
        &self,
        _ctx: &StepContext,
        task_id: &str,
        response: &ResponseData,
    ) -> EngineResult<StepResponse> {
        Ok(match response {
            ResponseData::Payload { value } => StepResponse::succeeded()
                .outcome("task_id", Value::String(task_id.to_string()))
                .outcome("result", value.clone()),
            ResponseData::Error { message } => {
                StepResponse::failed(message.clone())
                    .outcome("task_id", Value::String(task_id.to_string()))
            }
            ResponseData::StepResponse(data) => StepResponse {
                failure_info: data.failure_info.clone(),
                outcomes: data.outcomes.clone(),
                ..StepResponse::with_status(data.status)
            },
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub child_node_id: String,
    #[serde(default)]
    pub input_overrides: BTreeMap<String, Value>,
}

impl ChildSpec {
    pub fn new(child_node_id: impl Into<String>) -> Self {
        Self {
            child_node_id: child_node_id.into(),
            input_overrides: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.input_overrides.insert(name.into(), value);
        self
    }
}

/// Reads `children` from step parameters: a list of node ids or of
/// `{child_node_id, input_overrides}` objects.
pub fn child_specs_from_parameters(parameters: &Value, key: &str) -> EngineResult<Vec<ChildSpec>> {
    let Some(raw) = parameters.get(key) else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(EngineError::InvalidPlan(format!(
            "step parameter '{key}' must be a list"
        )));
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(id) => Ok(ChildSpec::new(id.clone())),
            other => serde_json::from_value::<ChildSpec>(other.clone()).map_err(|err| {
                EngineError::InvalidPlan(format!("invalid child entry in '{key}': {err}"))
            }),
        })
        .collect()
}

pub(crate) fn step_response_from_child(child: &StepResponseNotifyData) -> StepResponse {
    StepResponse {
        outcomes: child.outcomes.clone(),
        failure_info: child.failure_info.clone(),
        ..StepResponse::with_status(child.status)
    }
}

#[async_trait::async_trait]
pub trait ChildExecutable: Send + Sync {
    async fn obtain_child(&self, ctx: &StepContext) -> EngineResult<ChildSpec>;

    async fn handle_child_response(
        &self,
        _ctx: &StepContext,
        child: &StepResponseNotifyData,
    ) -> EngineResult<StepResponse> {
        Ok(step_response_from_child(child))
    }
}

#[async_trait::async_trait]
pub trait ChildrenExecutable: Send + Sync {
    async fn obtain_children(&self, ctx: &StepContext) -> EngineResult<Vec<ChildSpec>>;

    fn join_policy(&self, ctx: &StepContext) -> EngineResult<JoinPolicy> {
        match ctx.parameter_str("join_policy") {
            Some(raw) => raw.parse(),
            None => Ok(JoinPolicy::AllSuccess),
        }
    }

    /// Called once every child has settled, keyed by child runtime id.
    async fn handle_children_response(
        &self,
        ctx: &StepContext,
        children: &BTreeMap<String, StepResponseNotifyData>,
    ) -> EngineResult<StepResponse> {
        Ok(aggregate_children(self.join_policy(ctx)?, children))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChildChainResponse {
    /// `None` ends the chain.
    pub next_child: Option<ChildSpec>,
    pub pass_through: Value,
    pub last_link: bool,
}

impl ChildChainResponse {
    pub fn next(child: ChildSpec, pass_through: Value, last_link: bool) -> Self {
        Self {
            next_child: Some(child),
            pass_through,
            last_link,
        }
    }

    pub fn end(pass_through: Value) -> Self {
        Self {
            next_child: None,
            pass_through,
            last_link: true,
        }
    }
}

#[async_trait::async_trait]
pub trait ChildChainExecutable: Send + Sync {
    async fn execute_first_child(&self, ctx: &StepContext) -> EngineResult<ChildChainResponse>;

    async fn execute_next_child(
        &self,
        ctx: &StepContext,
        pass_through: &Value,
        previous: &StepResponseNotifyData,
    ) -> EngineResult<ChildChainResponse>;

    async fn finalize_execution(
        &self,
        _ctx: &StepContext,
        _pass_through: &Value,
        last: Option<&StepResponseNotifyData>,
    ) -> EngineResult<StepResponse> {
        Ok(last
            .map(step_response_from_child)
            .unwrap_or_else(StepResponse::succeeded))
    }
}

#[derive(Clone)]
pub enum StepKind {
    Sync(Arc<dyn SyncExecutable>),
    Async(Arc<dyn AsyncExecutable>),
    Task(Arc<dyn TaskExecutable>),
    Child(Arc<dyn ChildExecutable>),
    Children(Arc<dyn ChildrenExecutable>),
    ChildChain(Arc<dyn ChildChainExecutable>),
}

impl StepKind {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            StepKind::Sync(_) => ExecutionMode::Sync,
            StepKind::Async(_) => ExecutionMode::Async,
            StepKind::Task(_) => ExecutionMode::Task,
            StepKind::Child(_) => ExecutionMode::Child,
            StepKind::Children(_) => ExecutionMode::Children,
            StepKind::ChildChain(_) => ExecutionMode::ChildChain,
        }
    }
}

/// Immutable step-type lookup built once at startup.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: Arc<BTreeMap<String, StepKind>>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    pub fn get(&self, step_type: &str) -> EngineResult<&StepKind> {
        self.steps
            .get(step_type)
            .ok_or_else(|| EngineError::UnknownStep(step_type.to_string()))
    }

    /// The step for `step_type`, checked against the mode the plan asks for.
    pub fn resolve(
        &self,
        step_type: &str,
        expected: Option<ExecutionMode>,
    ) -> EngineResult<&StepKind> {
        let step = self.get(step_type)?;
        match expected {
            Some(expected) if expected != step.mode() => Err(EngineError::ModeMismatch {
                step_type: step_type.to_string(),
                expected,
                actual: step.mode(),
            }),
            _ => Ok(step),
        }
    }

    pub fn step_types(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

#[derive(Default)]
pub struct StepRegistryBuilder {
    steps: BTreeMap<String, StepKind>,
}

impl StepRegistryBuilder {
    pub fn register(mut self, step_type: impl Into<String>, step: StepKind) -> EngineResult<Self> {
        let step_type = step_type.into();
        if self.steps.contains_key(&step_type) {
            return Err(EngineError::Configuration(format!(
                "step type '{step_type}' registered twice"
            )));
        }
        self.steps.insert(step_type, step);
        Ok(self)
    }

    pub fn sync(
        self,
        step_type: impl Into<String>,
        step: impl SyncExecutable + 'static,
    ) -> EngineResult<Self> {
        self.register(step_type, StepKind::Sync(Arc::new(step)))
    }

    pub fn async_step(
        self,
        step_type: impl Into<String>,
        step: impl AsyncExecutable + 'static,
    ) -> EngineResult<Self> {
        self.register(step_type, StepKind::Async(Arc::new(step)))
    }

    pub fn task(
        self,
        step_type: impl Into<String>,
        step: impl TaskExecutable + 'static,
    ) -> EngineResult<Self> {
        self.register(step_type, StepKind::Task(Arc::new(step)))
    }

    pub fn child(
        self,
        step_type: impl Into<String>,
        step: impl ChildExecutable + 'static,
    ) -> EngineResult<Self> {
        self.register(step_type, StepKind::Child(Arc::new(step)))
    }

    pub fn children(
        self,
        step_type: impl Into<String>,
        step: impl ChildrenExecutable + 'static,
    ) -> EngineResult<Self> {
        self.register(step_type, StepKind::Children(Arc::new(step)))
    }

    pub fn child_chain(
        self,
        step_type: impl Into<String>,
        step: impl ChildChainExecutable + 'static,
    ) -> EngineResult<Self> {
        self.register(step_type, StepKind::ChildChain(Arc::new(step)))
    }

    pub fn build(self) -> StepRegistry {
        StepRegistry {
            steps: Arc::new(self.steps),
        }
    }
}
