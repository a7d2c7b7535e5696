use crate::status::Status;
use crate::types::{
    CorrelationId, Interrupt, InterruptState, NodeExecution, NodeExecutionOp, PlanExecution,
    ResponseData, SweepingOutputInstance, WaitInstance,
};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("duplicate key: {resource} ({id})")]
    DuplicateKey { resource: &'static str, id: String },

    #[error("sweeping output '{name}' already exists at level '{level_runtime_id_idx}'")]
    DuplicateOutput {
        name: String,
        level_runtime_id_idx: String,
    },

    #[error("sweeping output '{name}' is not visible from this level")]
    OutputNotFound { name: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait::async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Fails with `DuplicateKey` when the uuid is taken.
    async fn create_node_execution(&self, node: NodeExecution) -> StoreResult<NodeExecution>;

    async fn get_node_execution(&self, uuid: &str) -> StoreResult<NodeExecution>;

    /// Unconditional field update; status is left untouched.
    async fn update_node_execution(
        &self,
        uuid: &str,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<NodeExecution>;

    /// Compare-and-swap on `status`.
    ///
    /// Returns `Ok(None)` when the node is missing, superseded by a retry, or its
    /// current status is not in `expected`: another writer got there first and
    /// the caller must not repeat any side effects. Final target statuses also
    /// stamp `end_ts`.
    async fn update_node_status_with_ops(
        &self,
        uuid: &str,
        expected: &[Status],
        status: Status,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<Option<NodeExecution>>;

    /// Direct children, including superseded retry attempts.
    async fn find_all_children_of(&self, parent_id: &str) -> StoreResult<Vec<NodeExecution>>;

    /// Current attempts of a plan run whose status is in `statuses`.
    async fn find_by_status_in(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
    ) -> StoreResult<Vec<NodeExecution>>;

    /// Every node execution of a plan run in creation order.
    async fn fetch_node_executions(&self, plan_execution_id: &str)
    -> StoreResult<Vec<NodeExecution>>;
}

#[async_trait::async_trait]
pub trait SweepingOutputStore: Send + Sync {
    /// Unique insert on `(plan_execution_id, level_runtime_id_idx, name)`.
    async fn insert_output(&self, output: SweepingOutputInstance) -> StoreResult<()>;

    /// Outputs named `name` stored at any of the given level paths.
    async fn find_outputs(
        &self,
        plan_execution_id: &str,
        level_runtime_id_idxs: &[String],
        name: &str,
    ) -> StoreResult<Vec<SweepingOutputInstance>>;

    async fn fetch_outputs(&self, plan_execution_id: &str)
    -> StoreResult<Vec<SweepingOutputInstance>>;
}

#[async_trait::async_trait]
pub trait InterruptStore: Send + Sync {
    async fn save_interrupt(&self, interrupt: Interrupt) -> StoreResult<Interrupt>;

    async fn get_interrupt(&self, uuid: &str) -> StoreResult<Interrupt>;

    /// Compare-and-swap on `state`; `Ok(None)` when the state is not in `expected`.
    async fn update_interrupt_state(
        &self,
        uuid: &str,
        expected: &[InterruptState],
        state: InterruptState,
    ) -> StoreResult<Option<Interrupt>>;

    async fn fetch_interrupts(&self, plan_execution_id: &str) -> StoreResult<Vec<Interrupt>>;

    /// Interrupts still `REGISTERED` or `PROCESSING`.
    async fn fetch_active_interrupts(&self, plan_execution_id: &str)
    -> StoreResult<Vec<Interrupt>>;
}

#[async_trait::async_trait]
pub trait WaitStore: Send + Sync {
    /// Stores the wait. Returns it already `READY` when every correlation id has
    /// a response recorded.
    async fn register_wait(&self, wait: WaitInstance) -> StoreResult<Option<WaitInstance>>;

    /// Records the first response for `correlation_id`; later duplicates are
    /// ignored. Returns the waits that became `READY` because of this call.
    async fn record_response(
        &self,
        correlation_id: &str,
        data: ResponseData,
    ) -> StoreResult<Vec<WaitInstance>>;

    /// `READY -> DONE`. Exactly one caller gets `true` per wait.
    async fn claim_wait(&self, wait_id: &str) -> StoreResult<bool>;

    /// `DONE -> READY`, for a claimer that could not hand the responses to its
    /// node. `false` when the wait is not `DONE`.
    async fn release_wait(&self, wait_id: &str) -> StoreResult<bool>;

    async fn fetch_ready_waits(&self, plan_execution_id: &str) -> StoreResult<Vec<WaitInstance>>;

    /// Every wait a node execution registered, oldest first.
    async fn fetch_node_waits(&self, node_execution_id: &str) -> StoreResult<Vec<WaitInstance>>;

    async fn fetch_responses(
        &self,
        correlation_ids: &[CorrelationId],
    ) -> StoreResult<BTreeMap<CorrelationId, ResponseData>>;
}

#[async_trait::async_trait]
pub trait PlanExecutionStore: Send + Sync {
    async fn create_plan_execution(&self, plan: PlanExecution) -> StoreResult<PlanExecution>;

    async fn get_plan_execution(&self, uuid: &str) -> StoreResult<PlanExecution>;

    /// Compare-and-swap on the plan status; final statuses stamp `end_ts`.
    async fn update_plan_status(
        &self,
        uuid: &str,
        expected: &[Status],
        status: Status,
    ) -> StoreResult<Option<PlanExecution>>;

    async fn list_plan_executions(&self) -> StoreResult<Vec<PlanExecution>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub sweeping_outputs: usize,
    pub node_executions: usize,
    pub waits: usize,
    pub responses: usize,
    pub interrupts: usize,
    pub plan_executions: usize,
}

#[async_trait::async_trait]
pub trait MaintenanceStore: Send + Sync {
    /// Drops sweeping outputs past `valid_until` and final node executions past
    /// `expires_at`. A final plan run with no node executions left goes too,
    /// together with its waits, their responses and its processed interrupts.
    async fn purge_expired(&self, now_ms: u64) -> StoreResult<PurgeReport>;
}

/// Everything the engine needs from durable storage.
pub trait EngineStore:
    NodeExecutionStore
    + SweepingOutputStore
    + InterruptStore
    + WaitStore
    + PlanExecutionStore
    + MaintenanceStore
{
}

impl<T> EngineStore for T where
    T: NodeExecutionStore
        + SweepingOutputStore
        + InterruptStore
        + WaitStore
        + PlanExecutionStore
        + MaintenanceStore
{
}

pub type SharedEngineStore = Arc<dyn EngineStore>;
