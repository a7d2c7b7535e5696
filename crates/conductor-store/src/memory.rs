use crate::status::Status;
use crate::store::{
    InterruptStore, MaintenanceStore, NodeExecutionStore, PlanExecutionStore, PurgeReport,
    StoreError, StoreResult, SweepingOutputStore, WaitStore,
};
use crate::types::{
    CallbackResponse, CorrelationId, Interrupt, InterruptState, NodeExecution, NodeExecutionOp,
    PlanExecution, ResponseData, SweepingOutputInstance, WaitInstance, WaitState, now_ms,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemoryState {
    pub node_executions: BTreeMap<String, NodeExecution>,
    pub sweeping_outputs: BTreeMap<String, SweepingOutputInstance>,
    pub interrupts: BTreeMap<String, Interrupt>,
    pub waits: BTreeMap<String, WaitInstance>,
    pub responses: BTreeMap<CorrelationId, CallbackResponse>,
    pub plan_executions: BTreeMap<String, PlanExecution>,
}

/// Mutations as plain functions over the state, so a caller can run them on a
/// copy and only keep the result once it is durable.
impl MemoryState {
    fn all_responses_present(&self, wait: &WaitInstance) -> bool {
        wait.correlation_ids
            .iter()
            .all(|id| self.responses.contains_key(id))
    }

    pub(crate) fn create_node_execution(
        &mut self,
        node: NodeExecution,
    ) -> StoreResult<NodeExecution> {
        if node.uuid.is_empty() {
            return Err(StoreError::InvalidInput(
                "node execution uuid must not be empty".to_string(),
            ));
        }
        if self.node_executions.contains_key(&node.uuid) {
            return Err(StoreError::DuplicateKey {
                resource: "node_execution",
                id: node.uuid,
            });
        }
        self.node_executions
            .insert(node.uuid.clone(), node.clone());
        Ok(node)
    }

    pub(crate) fn update_node_execution(
        &mut self,
        uuid: &str,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<NodeExecution> {
        let node = self
            .node_executions
            .get_mut(uuid)
            .ok_or_else(|| StoreError::NotFound {
                resource: "node_execution",
                id: uuid.to_string(),
            })?;
        for op in ops {
            op.apply(node);
        }
        node.last_updated_at = now_ms();
        Ok(node.clone())
    }

    pub(crate) fn update_node_status_with_ops(
        &mut self,
        uuid: &str,
        expected: &[Status],
        status: Status,
        ops: Vec<NodeExecutionOp>,
    ) -> Option<NodeExecution> {
        let node = self.node_executions.get_mut(uuid)?;
        if node.old_retry || !expected.contains(&node.status) {
            return None;
        }
        let now = now_ms();
        node.status = status;
        for op in ops {
            op.apply(node);
        }
        if status.is_final() && node.end_ts.is_none() {
            node.end_ts = Some(now);
        }
        node.last_updated_at = now;
        Some(node.clone())
    }

    pub(crate) fn insert_output(&mut self, output: SweepingOutputInstance) -> StoreResult<()> {
        if output.name.is_empty() {
            return Err(StoreError::InvalidInput(
                "sweeping output name must not be empty".to_string(),
            ));
        }
        let key = output.unique_key();
        if self.sweeping_outputs.contains_key(&key) {
            return Err(StoreError::DuplicateOutput {
                name: output.name,
                level_runtime_id_idx: output.level_runtime_id_idx,
            });
        }
        self.sweeping_outputs.insert(key, output);
        Ok(())
    }

    pub(crate) fn save_interrupt(&mut self, interrupt: Interrupt) -> StoreResult<Interrupt> {
        if self.interrupts.contains_key(&interrupt.uuid) {
            return Err(StoreError::DuplicateKey {
                resource: "interrupt",
                id: interrupt.uuid,
            });
        }
        self.interrupts
            .insert(interrupt.uuid.clone(), interrupt.clone());
        Ok(interrupt)
    }

    pub(crate) fn update_interrupt_state(
        &mut self,
        uuid: &str,
        expected: &[InterruptState],
        new_state: InterruptState,
    ) -> Option<Interrupt> {
        let interrupt = self.interrupts.get_mut(uuid)?;
        if !expected.contains(&interrupt.state) {
            return None;
        }
        interrupt.state = new_state;
        interrupt.last_updated_at = now_ms();
        Some(interrupt.clone())
    }

    pub(crate) fn register_wait(
        &mut self,
        mut wait: WaitInstance,
    ) -> StoreResult<Option<WaitInstance>> {
        if wait.correlation_ids.is_empty() {
            return Err(StoreError::InvalidInput(
                "wait must name at least one correlation id".to_string(),
            ));
        }
        if self.waits.contains_key(&wait.uuid) {
            return Err(StoreError::DuplicateKey {
                resource: "wait",
                id: wait.uuid,
            });
        }
        let ready = self.all_responses_present(&wait);
        if ready {
            wait.state = WaitState::Ready;
        }
        self.waits.insert(wait.uuid.clone(), wait.clone());
        Ok(ready.then_some(wait))
    }

    pub(crate) fn record_response(
        &mut self,
        correlation_id: &str,
        data: ResponseData,
    ) -> Vec<WaitInstance> {
        if self.responses.contains_key(correlation_id) {
            return Vec::new();
        }
        self.responses.insert(
            correlation_id.to_string(),
            CallbackResponse {
                correlation_id: correlation_id.to_string(),
                data,
                received_at: now_ms(),
            },
        );

        let candidates: Vec<String> = self
            .waits
            .values()
            .filter(|wait| {
                wait.state == WaitState::Waiting
                    && wait.correlation_ids.iter().any(|id| id == correlation_id)
                    && self.all_responses_present(wait)
            })
            .map(|wait| wait.uuid.clone())
            .collect();

        let mut ready = Vec::with_capacity(candidates.len());
        for uuid in candidates {
            if let Some(wait) = self.waits.get_mut(&uuid) {
                wait.state = WaitState::Ready;
                ready.push(wait.clone());
            }
        }
        ready
    }

    /// Moves a wait from `from` to `to`; `false` when it is in another state.
    pub(crate) fn transition_wait(
        &mut self,
        wait_id: &str,
        from: WaitState,
        to: WaitState,
    ) -> StoreResult<bool> {
        match self.waits.get_mut(wait_id) {
            Some(wait) if wait.state == from => {
                wait.state = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                resource: "wait",
                id: wait_id.to_string(),
            }),
        }
    }

    pub(crate) fn create_plan_execution(
        &mut self,
        plan: PlanExecution,
    ) -> StoreResult<PlanExecution> {
        if self.plan_executions.contains_key(&plan.uuid) {
            return Err(StoreError::DuplicateKey {
                resource: "plan_execution",
                id: plan.uuid,
            });
        }
        self.plan_executions
            .insert(plan.uuid.clone(), plan.clone());
        Ok(plan)
    }

    pub(crate) fn update_plan_status(
        &mut self,
        uuid: &str,
        expected: &[Status],
        status: Status,
    ) -> Option<PlanExecution> {
        let plan = self.plan_executions.get_mut(uuid)?;
        if !expected.contains(&plan.status) {
            return None;
        }
        let now = now_ms();
        plan.status = status;
        if status.is_final() {
            plan.end_ts = Some(now);
        }
        plan.last_updated_at = now;
        Some(plan.clone())
    }

    /// Expired outputs and node executions go first. A finished plan run left
    /// without node executions then takes its waits, their responses and its
    /// processed interrupts along with it.
    pub(crate) fn purge_expired(&mut self, now_ms: u64) -> PurgeReport {
        let outputs_before = self.sweeping_outputs.len();
        self.sweeping_outputs
            .retain(|_, output| output.valid_until > now_ms);
        let nodes_before = self.node_executions.len();
        self.node_executions.retain(|_, node| {
            !(node.status.is_final() && node.expires_at.is_some_and(|at| at <= now_ms))
        });

        let live: BTreeSet<&str> = self
            .node_executions
            .values()
            .map(|node| node.plan_execution_id.as_str())
            .collect();
        let finished: BTreeSet<String> = self
            .plan_executions
            .values()
            .filter(|plan| plan.status.is_final() && !live.contains(plan.uuid.as_str()))
            .map(|plan| plan.uuid.clone())
            .collect();

        let mut report = PurgeReport {
            sweeping_outputs: outputs_before - self.sweeping_outputs.len(),
            node_executions: nodes_before - self.node_executions.len(),
            ..PurgeReport::default()
        };
        if finished.is_empty() {
            return report;
        }

        let stale_ids: BTreeSet<CorrelationId> = self
            .waits
            .values()
            .filter(|wait| finished.contains(&wait.plan_execution_id))
            .flat_map(|wait| wait.correlation_ids.iter().cloned())
            .collect();
        let waits_before = self.waits.len();
        self.waits
            .retain(|_, wait| !finished.contains(&wait.plan_execution_id));
        let responses_before = self.responses.len();
        self.responses.retain(|id, _| !stale_ids.contains(id));
        let interrupts_before = self.interrupts.len();
        self.interrupts.retain(|_, interrupt| {
            !(finished.contains(&interrupt.plan_execution_id) && interrupt.state.is_processed())
        });
        let plans_before = self.plan_executions.len();
        self.plan_executions
            .retain(|uuid, _| !finished.contains(uuid));

        report.waits = waits_before - self.waits.len();
        report.responses = responses_before - self.responses.len();
        report.interrupts = interrupts_before - self.interrupts.len();
        report.plan_executions = plans_before - self.plan_executions.len();
        report
    }
}

/// Single-process backend. Each trait method runs inside one critical section,
/// which is what gives the conditional updates their compare-and-swap meaning.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: MemoryState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn snapshot(&self) -> StoreResult<MemoryState> {
        Ok(self.lock()?.clone())
    }

    pub(crate) fn replace(&self, state: MemoryState) -> StoreResult<()> {
        *self.lock()? = state;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl NodeExecutionStore for MemoryStore {
    async fn create_node_execution(&self, node: NodeExecution) -> StoreResult<NodeExecution> {
        self.lock()?.create_node_execution(node)
    }

    async fn get_node_execution(&self, uuid: &str) -> StoreResult<NodeExecution> {
        let state = self.lock()?;
        state
            .node_executions
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "node_execution",
                id: uuid.to_string(),
            })
    }

    async fn update_node_execution(
        &self,
        uuid: &str,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<NodeExecution> {
        self.lock()?.update_node_execution(uuid, ops)
    }

    async fn update_node_status_with_ops(
        &self,
        uuid: &str,
        expected: &[Status],
        status: Status,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<Option<NodeExecution>> {
        Ok(self
            .lock()?
            .update_node_status_with_ops(uuid, expected, status, ops))
    }

    async fn find_all_children_of(&self, parent_id: &str) -> StoreResult<Vec<NodeExecution>> {
        let state = self.lock()?;
        let mut children: Vec<_> = state
            .node_executions
            .values()
            .filter(|node| node.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|node| node.created_at);
        Ok(children)
    }

    async fn find_by_status_in(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
    ) -> StoreResult<Vec<NodeExecution>> {
        let state = self.lock()?;
        let mut nodes: Vec<_> = state
            .node_executions
            .values()
            .filter(|node| {
                node.plan_execution_id == plan_execution_id
                    && !node.old_retry
                    && statuses.contains(&node.status)
            })
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.created_at);
        Ok(nodes)
    }

    async fn fetch_node_executions(
        &self,
        plan_execution_id: &str,
    ) -> StoreResult<Vec<NodeExecution>> {
        let state = self.lock()?;
        let mut nodes: Vec<_> = state
            .node_executions
            .values()
            .filter(|node| node.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        Ok(nodes)
    }
}

#[async_trait::async_trait]
impl SweepingOutputStore for MemoryStore {
    async fn insert_output(&self, output: SweepingOutputInstance) -> StoreResult<()> {
        self.lock()?.insert_output(output)
    }

    async fn find_outputs(
        &self,
        plan_execution_id: &str,
        level_runtime_id_idxs: &[String],
        name: &str,
    ) -> StoreResult<Vec<SweepingOutputInstance>> {
        let state = self.lock()?;
        Ok(state
            .sweeping_outputs
            .values()
            .filter(|output| {
                output.plan_execution_id == plan_execution_id
                    && output.name == name
                    && level_runtime_id_idxs.contains(&output.level_runtime_id_idx)
            })
            .cloned()
            .collect())
    }

    async fn fetch_outputs(
        &self,
        plan_execution_id: &str,
    ) -> StoreResult<Vec<SweepingOutputInstance>> {
        let state = self.lock()?;
        let mut outputs: Vec<_> = state
            .sweeping_outputs
            .values()
            .filter(|output| output.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        outputs.sort_by_key(|output| output.created_at);
        Ok(outputs)
    }
}

#[async_trait::async_trait]
impl InterruptStore for MemoryStore {
    async fn save_interrupt(&self, interrupt: Interrupt) -> StoreResult<Interrupt> {
        self.lock()?.save_interrupt(interrupt)
    }

    async fn get_interrupt(&self, uuid: &str) -> StoreResult<Interrupt> {
        let state = self.lock()?;
        state
            .interrupts
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "interrupt",
                id: uuid.to_string(),
            })
    }

    async fn update_interrupt_state(
        &self,
        uuid: &str,
        expected: &[InterruptState],
        new_state: InterruptState,
    ) -> StoreResult<Option<Interrupt>> {
        Ok(self
            .lock()?
            .update_interrupt_state(uuid, expected, new_state))
    }

    async fn fetch_interrupts(&self, plan_execution_id: &str) -> StoreResult<Vec<Interrupt>> {
        let state = self.lock()?;
        let mut interrupts: Vec<_> = state
            .interrupts
            .values()
            .filter(|interrupt| interrupt.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        interrupts.sort_by_key(|interrupt| interrupt.created_at);
        Ok(interrupts)
    }

    async fn fetch_active_interrupts(
        &self,
        plan_execution_id: &str,
    ) -> StoreResult<Vec<Interrupt>> {
        Ok(self
            .fetch_interrupts(plan_execution_id)
            .await?
            .into_iter()
            .filter(|interrupt| !interrupt.state.is_processed())
            .collect())
    }
}

#[async_trait::async_trait]
impl WaitStore for MemoryStore {
    async fn register_wait(&self, wait: WaitInstance) -> StoreResult<Option<WaitInstance>> {
        self.lock()?.register_wait(wait)
    }

    async fn record_response(
        &self,
        correlation_id: &str,
        data: ResponseData,
    ) -> StoreResult<Vec<WaitInstance>> {
        Ok(self.lock()?.record_response(correlation_id, data))
    }

    async fn claim_wait(&self, wait_id: &str) -> StoreResult<bool> {
        self.lock()?
            .transition_wait(wait_id, WaitState::Ready, WaitState::Done)
    }

    async fn release_wait(&self, wait_id: &str) -> StoreResult<bool> {
        self.lock()?
            .transition_wait(wait_id, WaitState::Done, WaitState::Ready)
    }

    async fn fetch_ready_waits(&self, plan_execution_id: &str) -> StoreResult<Vec<WaitInstance>> {
        let state = self.lock()?;
        Ok(state
            .waits
            .values()
            .filter(|wait| {
                wait.plan_execution_id == plan_execution_id && wait.state == WaitState::Ready
            })
            .cloned()
            .collect())
    }

    async fn fetch_node_waits(&self, node_execution_id: &str) -> StoreResult<Vec<WaitInstance>> {
        let state = self.lock()?;
        let mut waits: Vec<_> = state
            .waits
            .values()
            .filter(|wait| wait.node_execution_id == node_execution_id)
            .cloned()
            .collect();
        waits.sort_by_key(|wait| wait.created_at);
        Ok(waits)
    }

    async fn fetch_responses(
        &self,
        correlation_ids: &[CorrelationId],
    ) -> StoreResult<BTreeMap<CorrelationId, ResponseData>> {
        let state = self.lock()?;
        Ok(correlation_ids
            .iter()
            .filter_map(|id| {
                state
                    .responses
                    .get(id)
                    .map(|response| (id.clone(), response.data.clone()))
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl PlanExecutionStore for MemoryStore {
    async fn create_plan_execution(&self, plan: PlanExecution) -> StoreResult<PlanExecution> {
        self.lock()?.create_plan_execution(plan)
    }

    async fn get_plan_execution(&self, uuid: &str) -> StoreResult<PlanExecution> {
        let state = self.lock()?;
        state
            .plan_executions
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource: "plan_execution",
                id: uuid.to_string(),
            })
    }

    async fn update_plan_status(
        &self,
        uuid: &str,
        expected: &[Status],
        status: Status,
    ) -> StoreResult<Option<PlanExecution>> {
        Ok(self.lock()?.update_plan_status(uuid, expected, status))
    }

    async fn list_plan_executions(&self) -> StoreResult<Vec<PlanExecution>> {
        let state = self.lock()?;
        let mut plans: Vec<_> = state.plan_executions.values().cloned().collect();
        plans.sort_by_key(|plan| plan.created_at);
        Ok(plans)
    }
}

#[async_trait::async_trait]
impl MaintenanceStore for MemoryStore {
    async fn purge_expired(&self, now_ms: u64) -> StoreResult<PurgeReport> {
        Ok(self.lock()?.purge_expired(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, Level};
    use serde_json::{Value, json};

    fn node(runtime_id: &str) -> NodeExecution {
        let ambiance = Ambiance::new("plan-1", BTreeMap::new())
            .derive_child(Level::new(runtime_id, "setup", "noop"));
        NodeExecution::queued(ambiance, "step", Value::Null).expect("ambiance has a level")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_node_status_with_ops_status_mismatch_expected_none_and_unchanged() {
        let store = MemoryStore::new();
        store
            .create_node_execution(node("n1"))
            .await
            .expect("create should succeed");

        let result = store
            .update_node_status_with_ops("n1", &[Status::Running], Status::Succeeded, vec![])
            .await
            .expect("update should not error");
        assert!(result.is_none());
        let stored = store
            .get_node_execution("n1")
            .await
            .expect("node should exist");
        assert_eq!(stored.status, Status::Queued);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_node_status_with_ops_final_status_expected_end_ts_stamped() {
        let store = MemoryStore::new();
        store
            .create_node_execution(node("n1"))
            .await
            .expect("create should succeed");
        let updated = store
            .update_node_status_with_ops(
                "n1",
                Status::allowed_start_set(Status::Aborted),
                Status::Aborted,
                vec![],
            )
            .await
            .expect("update should not error")
            .expect("update should match");
        assert!(updated.end_ts.is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn update_node_status_with_ops_missing_node_expected_none() {
        let store = MemoryStore::new();
        let result = store
            .update_node_status_with_ops("missing", &[Status::Queued], Status::Running, vec![])
            .await
            .expect("update should not error");
        assert!(result.is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn record_response_before_register_expected_wait_ready_on_register() {
        let store = MemoryStore::new();
        store
            .record_response("cb-1", ResponseData::payload(json!(1)))
            .await
            .expect("record should succeed");

        let ready = store
            .register_wait(WaitInstance {
                uuid: "w1".to_string(),
                plan_execution_id: "plan-1".to_string(),
                node_execution_id: "n1".to_string(),
                correlation_ids: vec!["cb-1".to_string()],
                state: WaitState::Waiting,
                created_at: now_ms(),
            })
            .await
            .expect("register should succeed");
        assert_eq!(ready.map(|wait| wait.state), Some(WaitState::Ready));
        assert!(store.claim_wait("w1").await.expect("claim should succeed"));
        assert!(!store.claim_wait("w1").await.expect("claim should succeed"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn purge_expired_expected_only_stale_records_removed() {
        let store = MemoryStore::new();
        let mut stale = node("n1");
        stale.status = Status::Succeeded;
        stale.expires_at = Some(10);
        let mut live = node("n2");
        live.expires_at = Some(10);
        store.create_node_execution(stale).await.expect("create");
        store.create_node_execution(live).await.expect("create");
        store
            .insert_output(SweepingOutputInstance {
                uuid: "o1".to_string(),
                plan_execution_id: "plan-1".to_string(),
                level_runtime_id_idx: "n1".to_string(),
                name: "x".to_string(),
                group_name: None,
                value: json!(1),
                created_at: 0,
                valid_until: 5,
            })
            .await
            .expect("insert");

        let report = store.purge_expired(20).await.expect("purge should succeed");
        assert_eq!(
            report,
            PurgeReport {
                sweeping_outputs: 1,
                node_executions: 1,
                ..PurgeReport::default()
            }
        );
        assert!(store.get_node_execution("n2").await.is_ok());
    }

    fn wait(uuid: &str, plan_execution_id: &str, ids: &[&str]) -> WaitInstance {
        WaitInstance {
            uuid: uuid.to_string(),
            plan_execution_id: plan_execution_id.to_string(),
            node_execution_id: format!("{uuid}-node"),
            correlation_ids: ids.iter().map(|id| id.to_string()).collect(),
            state: WaitState::Waiting,
            created_at: now_ms(),
        }
    }

    fn interrupt(uuid: &str, plan_execution_id: &str, state: InterruptState) -> Interrupt {
        Interrupt {
            uuid: uuid.to_string(),
            interrupt_type: crate::types::InterruptType::AbortAll,
            plan_execution_id: plan_execution_id.to_string(),
            node_execution_id: None,
            state,
            created_at: 0,
            last_updated_at: 0,
            issued_by: None,
            metadata: BTreeMap::new(),
        }
    }

    fn plan_execution(uuid: &str, status: Status) -> PlanExecution {
        PlanExecution {
            uuid: uuid.to_string(),
            plan_id: "ops".to_string(),
            status,
            start_ts: Some(0),
            end_ts: status.is_final().then_some(1),
            setup_abstractions: BTreeMap::new(),
            created_at: 0,
            last_updated_at: 0,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn purge_expired_finished_plan_expected_waits_responses_interrupts_dropped() {
        let store = MemoryStore::new();
        store
            .create_plan_execution(plan_execution("plan-1", Status::Succeeded))
            .await
            .expect("create plan");
        store
            .create_plan_execution(plan_execution("plan-2", Status::Running))
            .await
            .expect("create plan");
        let mut done = node("n1");
        done.status = Status::Succeeded;
        done.expires_at = Some(10);
        store.create_node_execution(done).await.expect("create");

        store.register_wait(wait("w1", "plan-1", &["c1"])).await.expect("register");
        store.register_wait(wait("w2", "plan-2", &["c2"])).await.expect("register");
        store
            .record_response("c1", ResponseData::payload(json!(1)))
            .await
            .expect("record");
        store
            .record_response("c2", ResponseData::payload(json!(2)))
            .await
            .expect("record");
        store
            .save_interrupt(interrupt("i1", "plan-1", InterruptState::ProcessedSuccessfully))
            .await
            .expect("save");
        store
            .save_interrupt(interrupt("i2", "plan-2", InterruptState::ProcessedSuccessfully))
            .await
            .expect("save");

        let report = store.purge_expired(20).await.expect("purge should succeed");
        assert_eq!(
            report,
            PurgeReport {
                sweeping_outputs: 0,
                node_executions: 1,
                waits: 1,
                responses: 1,
                interrupts: 1,
                plan_executions: 1,
            }
        );
        assert!(store.get_plan_execution("plan-1").await.is_err());
        assert!(store.get_interrupt("i2").await.is_ok());
        assert_eq!(store.fetch_ready_waits("plan-2").await.expect("fetch").len(), 1);
        let kept = store
            .fetch_responses(&["c1".to_string(), "c2".to_string()])
            .await
            .expect("fetch");
        assert_eq!(kept.keys().cloned().collect::<Vec<_>>(), vec!["c2".to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn purge_expired_finished_plan_with_live_nodes_expected_kept() {
        let store = MemoryStore::new();
        store
            .create_plan_execution(plan_execution("plan-1", Status::Succeeded))
            .await
            .expect("create plan");
        let mut done = node("n1");
        done.status = Status::Succeeded;
        store.create_node_execution(done).await.expect("create");
        store.register_wait(wait("w1", "plan-1", &["c1"])).await.expect("register");

        let report = store.purge_expired(20).await.expect("purge should succeed");
        assert_eq!(report, PurgeReport::default());
        assert!(store.get_plan_execution("plan-1").await.is_ok());
        assert_eq!(store.fetch_node_waits("w1-node").await.expect("fetch").len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn release_wait_claimed_expected_ready_again() {
        let store = MemoryStore::new();
        store
            .record_response("cb-1", ResponseData::payload(json!(1)))
            .await
            .expect("record");
        store.register_wait(wait("w1", "plan-1", &["cb-1"])).await.expect("register");

        assert!(!store.release_wait("w1").await.expect("release"));
        assert!(store.claim_wait("w1").await.expect("claim"));
        assert!(store.release_wait("w1").await.expect("release"));
        assert_eq!(store.fetch_ready_waits("plan-1").await.expect("fetch").len(), 1);
        assert!(store.claim_wait("w1").await.expect("claim"));
    }
}
