use crate::ambiance::Ambiance;
use crate::status::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub type NodeExecutionId = String;
pub type PlanExecutionId = String;
pub type CorrelationId = String;
pub type Outcomes = BTreeMap<String, Value>;

pub fn now_ms() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(elapsed).unwrap_or(u64::MAX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    Child,
    Children,
    ChildChain,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::Task => "TASK",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
            ExecutionMode::ChildChain => "CHILD_CHAIN",
        }
    }

    /// Modes whose work happens in the step itself rather than in child nodes.
    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            ExecutionMode::Sync | ExecutionMode::Async | ExecutionMode::Task
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Application,
    Configuration,
    DataIntegrity,
    Timeout,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            message: message.into(),
            failure_types: vec![failure_type],
        }
    }
}

/// Completion report a node sends to whoever waits on its `notify_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResponseNotifyData {
    pub node_execution_id: NodeExecutionId,
    pub plan_node_id: String,
    pub identifier: String,
    pub status: Status,
    #[serde(default)]
    pub outcomes: Outcomes,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
}

/// Payload delivered for a correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    Payload { value: Value },
    StepResponse(StepResponseNotifyData),
    Error { message: String },
}

impl ResponseData {
    pub fn payload(value: Value) -> Self {
        Self::Payload { value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn as_step_response(&self) -> Option<&StepResponseNotifyData> {
        match self {
            Self::StepResponse(data) => Some(data),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    pub plan_node_id: String,
    pub runtime_id: NodeExecutionId,
    #[serde(default)]
    pub input_overrides: BTreeMap<String, Value>,
}

/// What a node is waiting on after its step returned control.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Sync,
    Async {
        callback_ids: Vec<CorrelationId>,
        status: Status,
    },
    Task {
        task_id: String,
        task_type: String,
    },
    Child {
        child_node_id: String,
        child_runtime_id: NodeExecutionId,
        #[serde(default)]
        input_overrides: BTreeMap<String, Value>,
    },
    Children {
        children: Vec<ChildRef>,
    },
    ChildChain {
        next_child_id: String,
        child_runtime_id: NodeExecutionId,
        #[serde(default)]
        pass_through: Value,
        last_link: bool,
        #[serde(default)]
        input_overrides: BTreeMap<String, Value>,
    },
}

impl ExecutableResponse {
    /// Correlation ids a node holding this response is suspended on.
    pub fn correlation_ids(&self) -> Vec<CorrelationId> {
        match self {
            Self::Sync => Vec::new(),
            Self::Async { callback_ids, .. } => callback_ids.clone(),
            Self::Task { task_id, .. } => vec![task_id.clone()],
            Self::Children { children } => {
                children.iter().map(|child| child.runtime_id.clone()).collect()
            }
            Self::Child {
                child_runtime_id, ..
            }
            | Self::ChildChain {
                child_runtime_id, ..
            } => vec![child_runtime_id.clone()],
        }
    }

    /// Children this response launched; empty for leaf responses.
    pub fn spawned_children(&self) -> Vec<ChildRef> {
        match self {
            Self::Children { children } => children.clone(),
            Self::Child {
                child_node_id,
                child_runtime_id,
                input_overrides,
            }
            | Self::ChildChain {
                next_child_id: child_node_id,
                child_runtime_id,
                input_overrides,
                ..
            } => vec![ChildRef {
                plan_node_id: child_node_id.clone(),
                runtime_id: child_runtime_id.clone(),
                input_overrides: input_overrides.clone(),
            }],
            Self::Sync | Self::Async { .. } | Self::Task { .. } => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    AbortAll,
    PauseAll,
    ResumeAll,
    Abort,
    Pause,
    Resume,
    Retry,
    MarkFailed,
    MarkSuccess,
    Ignore,
    MarkExpired,
}

impl InterruptType {
    pub const ALL: [InterruptType; 11] = [
        InterruptType::AbortAll,
        InterruptType::PauseAll,
        InterruptType::ResumeAll,
        InterruptType::Abort,
        InterruptType::Pause,
        InterruptType::Resume,
        InterruptType::Retry,
        InterruptType::MarkFailed,
        InterruptType::MarkSuccess,
        InterruptType::Ignore,
        InterruptType::MarkExpired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::PauseAll => "PAUSE_ALL",
            InterruptType::ResumeAll => "RESUME_ALL",
            InterruptType::Abort => "ABORT",
            InterruptType::Pause => "PAUSE",
            InterruptType::Resume => "RESUME",
            InterruptType::Retry => "RETRY",
            InterruptType::MarkFailed => "MARK_FAILED",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::Ignore => "IGNORE",
            InterruptType::MarkExpired => "MARK_EXPIRED",
        }
    }

    pub fn is_plan_level(self) -> bool {
        matches!(
            self,
            InterruptType::AbortAll | InterruptType::PauseAll | InterruptType::ResumeAll
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

impl InterruptState {
    pub fn is_processed(self) -> bool {
        matches!(
            self,
            InterruptState::ProcessedSuccessfully | InterruptState::ProcessedUnsuccessfully
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub uuid: String,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: PlanExecutionId,
    #[serde(default)]
    pub node_execution_id: Option<NodeExecutionId>,
    pub state: InterruptState,
    pub created_at: u64,
    pub last_updated_at: u64,
    #[serde(default)]
    pub issued_by: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Trace left on a node by an interrupt that affected it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub took_effect_at: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub uuid: NodeExecutionId,
    pub plan_execution_id: PlanExecutionId,
    pub node_id: String,
    pub identifier: String,
    pub step_type: String,
    pub ambiance: Ambiance,
    pub status: Status,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub start_ts: Option<u64>,
    #[serde(default)]
    pub end_ts: Option<u64>,
    pub created_at: u64,
    pub last_updated_at: u64,
    #[serde(default)]
    pub retry_ids: Vec<NodeExecutionId>,
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub interrupt_histories: Vec<InterruptEffect>,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub step_parameters: Value,
    #[serde(default)]
    pub additional_inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub outcomes: Outcomes,
    #[serde(default)]
    pub parent_id: Option<NodeExecutionId>,
    #[serde(default)]
    pub previous_id: Option<NodeExecutionId>,
    #[serde(default)]
    pub next_id: Option<NodeExecutionId>,
    #[serde(default)]
    pub notify_id: Option<CorrelationId>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl NodeExecution {
    /// A fresh `QUEUED` record for the current level of `ambiance`.
    pub fn queued(
        ambiance: Ambiance,
        identifier: impl Into<String>,
        step_parameters: Value,
    ) -> Option<Self> {
        let level = ambiance.current_level()?.clone();
        let now = now_ms();
        Some(Self {
            uuid: level.runtime_id,
            plan_execution_id: ambiance.plan_execution_id.clone(),
            node_id: level.setup_id,
            identifier: identifier.into(),
            step_type: level.step_type,
            ambiance,
            status: Status::Queued,
            mode: None,
            start_ts: None,
            end_ts: None,
            created_at: now,
            last_updated_at: now,
            retry_ids: Vec::new(),
            old_retry: false,
            interrupt_histories: Vec::new(),
            executable_responses: Vec::new(),
            failure_info: None,
            step_parameters,
            additional_inputs: BTreeMap::new(),
            outcomes: Outcomes::new(),
            parent_id: None,
            previous_id: None,
            next_id: None,
            notify_id: None,
            timeout_ms: None,
            expires_at: None,
        })
    }

    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }

    pub fn latest_executable_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    pub fn to_notify_data(&self) -> StepResponseNotifyData {
        StepResponseNotifyData {
            node_execution_id: self.uuid.clone(),
            plan_node_id: self.node_id.clone(),
            identifier: self.identifier.clone(),
            status: self.status,
            outcomes: self.outcomes.clone(),
            failure_info: self.failure_info.clone(),
        }
    }
}

/// Field updates applied together with a status transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeExecutionOp {
    SetMode(ExecutionMode),
    SetStartTs(u64),
    SetEndTs(u64),
    SetFailureInfo(FailureInfo),
    ClearFailureInfo,
    AddExecutableResponse(ExecutableResponse),
    AddInterruptHistory(InterruptEffect),
    SetOutcomes(Outcomes),
    MarkOldRetry,
    SetNextId(NodeExecutionId),
}

impl NodeExecutionOp {
    pub fn apply(self, node: &mut NodeExecution) {
        match self {
            NodeExecutionOp::SetMode(mode) => node.mode = Some(mode),
            NodeExecutionOp::SetStartTs(ts) => node.start_ts = Some(ts),
            NodeExecutionOp::SetEndTs(ts) => node.end_ts = Some(ts),
            NodeExecutionOp::SetFailureInfo(info) => node.failure_info = Some(info),
            NodeExecutionOp::ClearFailureInfo => node.failure_info = None,
            NodeExecutionOp::AddExecutableResponse(response) => {
                node.executable_responses.push(response)
            }
            NodeExecutionOp::AddInterruptHistory(effect) => node.interrupt_histories.push(effect),
            NodeExecutionOp::SetOutcomes(outcomes) => node.outcomes = outcomes,
            NodeExecutionOp::MarkOldRetry => node.old_retry = true,
            NodeExecutionOp::SetNextId(next_id) => node.next_id = Some(next_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepingOutputInstance {
    pub uuid: String,
    pub plan_execution_id: PlanExecutionId,
    pub level_runtime_id_idx: String,
    pub name: String,
    #[serde(default)]
    pub group_name: Option<String>,
    pub value: Value,
    pub created_at: u64,
    pub valid_until: u64,
}

impl SweepingOutputInstance {
    pub fn unique_key(&self) -> String {
        sweeping_output_key(&self.plan_execution_id, &self.level_runtime_id_idx, &self.name)
    }
}

/// Content-addressed key of the `(plan execution, level path, name)` unique index.
pub fn sweeping_output_key(
    plan_execution_id: &str,
    level_runtime_id_idx: &str,
    name: &str,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(plan_execution_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(level_runtime_id_idx.as_bytes());
    hasher.update(&[0]);
    hasher.update(name.as_bytes());
    hasher.finalize().to_hex().to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitState {
    Waiting,
    Ready,
    Done,
}

/// A node suspended until every correlation id has a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitInstance {
    pub uuid: String,
    pub plan_execution_id: PlanExecutionId,
    pub node_execution_id: NodeExecutionId,
    pub correlation_ids: Vec<CorrelationId>,
    pub state: WaitState,
    pub created_at: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub correlation_id: CorrelationId,
    pub data: ResponseData,
    pub received_at: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub uuid: PlanExecutionId,
    pub plan_id: String,
    pub status: Status,
    #[serde(default)]
    pub start_ts: Option<u64>,
    #[serde(default)]
    pub end_ts: Option<u64>,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    pub created_at: u64,
    pub last_updated_at: u64,
}
