use crate::memory::{MemoryState, MemoryStore};
use crate::status::Status;
use crate::store::{
    InterruptStore, MaintenanceStore, NodeExecutionStore, PlanExecutionStore, PurgeReport,
    StoreError, StoreResult, SweepingOutputStore, WaitStore,
};
use crate::types::{
    CorrelationId, Interrupt, InterruptState, NodeExecution, NodeExecutionOp, PlanExecution,
    ResponseData, SweepingOutputInstance, WaitInstance, WaitState,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const STATE_FILE_NAME: &str = "conductor-state.json";

/// Memory store whose whole state is rewritten to a JSON file on every
/// mutation, so a fresh process can pick a plan run back up.
#[derive(Clone, Debug)]
pub struct FsStore {
    state_file: PathBuf,
    inner: MemoryStore,
    write_lock: Arc<Mutex<()>>,
}

impl FsStore {
    pub fn new<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        fs::create_dir_all(root.as_ref())
            .map_err(|err| StoreError::Backend(format!("create fs store root failed: {err}")))?;
        let state_file = root.as_ref().join(STATE_FILE_NAME);
        let state = if state_file.exists() {
            let raw = fs::read(&state_file)
                .map_err(|err| StoreError::Backend(format!("read state file failed: {err}")))?;
            serde_json::from_slice::<MemoryState>(&raw)
                .map_err(|err| StoreError::Serialization(err.to_string()))?
        } else {
            MemoryState::default()
        };

        tracing::debug!(path = %state_file.display(), "opened file-backed store");
        Ok(Self {
            state_file,
            inner: MemoryStore::from_state(state),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Runs `mutation` on a copy of the state and swaps the copy in only after
    /// it reached disk. Writers are serialized, so the copy is never stale.
    fn commit<T>(
        &self,
        mutation: impl FnOnce(&mut MemoryState) -> StoreResult<T>,
        changed: impl FnOnce(&T) -> bool,
    ) -> StoreResult<T> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("write lock poisoned".to_string()))?;
        let mut next = self.inner.snapshot()?;
        let result = mutation(&mut next)?;
        if changed(&result) {
            self.persist(&next)?;
            self.inner.replace(next)?;
        }
        Ok(result)
    }

    fn persist(&self, state: &MemoryState) -> StoreResult<()> {
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|err| StoreError::Backend(format!("write state file failed: {err}")))?;
        fs::rename(&tmp, &self.state_file).map_err(|err| {
            tracing::warn!(path = %self.state_file.display(), error = %err, "state not persisted");
            StoreError::Backend(format!("rename state file failed: {err}"))
        })
    }
}

#[async_trait::async_trait]
impl NodeExecutionStore for FsStore {
    async fn create_node_execution(&self, node: NodeExecution) -> StoreResult<NodeExecution> {
        self.commit(|state| state.create_node_execution(node), |_| true)
    }

    async fn get_node_execution(&self, uuid: &str) -> StoreResult<NodeExecution> {
        self.inner.get_node_execution(uuid).await
    }

    async fn update_node_execution(
        &self,
        uuid: &str,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<NodeExecution> {
        self.commit(|state| state.update_node_execution(uuid, ops), |_| true)
    }

    async fn update_node_status_with_ops(
        &self,
        uuid: &str,
        expected: &[Status],
        status: Status,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<Option<NodeExecution>> {
        self.commit(
            |state| Ok(state.update_node_status_with_ops(uuid, expected, status, ops)),
            |updated| updated.is_some(),
        )
    }

    async fn find_all_children_of(&self, parent_id: &str) -> StoreResult<Vec<NodeExecution>> {
        self.inner.find_all_children_of(parent_id).await
    }

    async fn find_by_status_in(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
    ) -> StoreResult<Vec<NodeExecution>> {
        self.inner
            .find_by_status_in(plan_execution_id, statuses)
            .await
    }

    async fn fetch_node_executions(
        &self,
        plan_execution_id: &str,
    ) -> StoreResult<Vec<NodeExecution>> {
        self.inner.fetch_node_executions(plan_execution_id).await
    }
}

#[async_trait::async_trait]
impl SweepingOutputStore for FsStore {
    async fn insert_output(&self, output: SweepingOutputInstance) -> StoreResult<()> {
        self.commit(|state| state.insert_output(output), |_| true)
    }

    async fn find_outputs(
        &self,
        plan_execution_id: &str,
        level_runtime_id_idxs: &[String],
        name: &str,
    ) -> StoreResult<Vec<SweepingOutputInstance>> {
        self.inner
            .find_outputs(plan_execution_id, level_runtime_id_idxs, name)
            .await
    }

    async fn fetch_outputs(
        &self,
        plan_execution_id: &str,
    ) -> StoreResult<Vec<SweepingOutputInstance>> {
        self.inner.fetch_outputs(plan_execution_id).await
    }
}

#[async_trait::async_trait]
impl InterruptStore for FsStore {
    async fn save_interrupt(&self, interrupt: Interrupt) -> StoreResult<Interrupt> {
        self.commit(|state| state.save_interrupt(interrupt), |_| true)
    }

    async fn get_interrupt(&self, uuid: &str) -> StoreResult<Interrupt> {
        self.inner.get_interrupt(uuid).await
    }

    async fn update_interrupt_state(
        &self,
        uuid: &str,
        expected: &[InterruptState],
        new_state: InterruptState,
    ) -> StoreResult<Option<Interrupt>> {
        self.commit(
            |state| Ok(state.update_interrupt_state(uuid, expected, new_state)),
            |updated| updated.is_some(),
        )
    }

    async fn fetch_interrupts(&self, plan_execution_id: &str) -> StoreResult<Vec<Interrupt>> {
        self.inner.fetch_interrupts(plan_execution_id).await
    }

    async fn fetch_active_interrupts(
        &self,
        plan_execution_id: &str,
    ) -> StoreResult<Vec<Interrupt>> {
        self.inner.fetch_active_interrupts(plan_execution_id).await
    }
}

#[async_trait::async_trait]
impl WaitStore for FsStore {
    async fn register_wait(&self, wait: WaitInstance) -> StoreResult<Option<WaitInstance>> {
        self.commit(|state| state.register_wait(wait), |_| true)
    }

    async fn record_response(
        &self,
        correlation_id: &str,
        data: ResponseData,
    ) -> StoreResult<Vec<WaitInstance>> {
        self.commit(|state| Ok(state.record_response(correlation_id, data)), |_| true)
    }

    async fn claim_wait(&self, wait_id: &str) -> StoreResult<bool> {
        self.commit(
            |state| state.transition_wait(wait_id, WaitState::Ready, WaitState::Done),
            |claimed| *claimed,
        )
    }

    async fn release_wait(&self, wait_id: &str) -> StoreResult<bool> {
        self.commit(
            |state| state.transition_wait(wait_id, WaitState::Done, WaitState::Ready),
            |released| *released,
        )
    }

    async fn fetch_ready_waits(&self, plan_execution_id: &str) -> StoreResult<Vec<WaitInstance>> {
        self.inner.fetch_ready_waits(plan_execution_id).await
    }

    async fn fetch_node_waits(&self, node_execution_id: &str) -> StoreResult<Vec<WaitInstance>> {
        self.inner.fetch_node_waits(node_execution_id).await
    }

    async fn fetch_responses(
        &self,
        correlation_ids: &[CorrelationId],
    ) -> StoreResult<BTreeMap<CorrelationId, ResponseData>> {
        self.inner.fetch_responses(correlation_ids).await
    }
}

#[async_trait::async_trait]
impl PlanExecutionStore for FsStore {
    async fn create_plan_execution(&self, plan: PlanExecution) -> StoreResult<PlanExecution> {
        self.commit(|state| state.create_plan_execution(plan), |_| true)
    }

    async fn get_plan_execution(&self, uuid: &str) -> StoreResult<PlanExecution> {
        self.inner.get_plan_execution(uuid).await
    }

    async fn update_plan_status(
        &self,
        uuid: &str,
        expected: &[Status],
        status: Status,
    ) -> StoreResult<Option<PlanExecution>> {
        self.commit(
            |state| Ok(state.update_plan_status(uuid, expected, status)),
            |updated| updated.is_some(),
        )
    }

    async fn list_plan_executions(&self) -> StoreResult<Vec<PlanExecution>> {
        self.inner.list_plan_executions().await
    }
}

#[async_trait::async_trait]
impl MaintenanceStore for FsStore {
    async fn purge_expired(&self, now_ms: u64) -> StoreResult<PurgeReport> {
        self.commit(
            |state| Ok(state.purge_expired(now_ms)),
            |report| *report != PurgeReport::default(),
        )
    }
}
