#![allow(dead_code)]

use async_trait::async_trait;
use conductor_engine::{
    Advise, Adviser, AdvisingEvent, AsyncExecutable, AsyncExecutableResponse,
    ChildChainExecutable, ChildChainResponse, ChildExecutable, ChildSpec, ChildrenExecutable,
    EngineConfig, EngineError, EngineEvent, EngineEventKind, EngineEventSink, EngineResult,
    InMemoryPlanProvider, LocalTaskExecutor, Orchestrator, Plan, StepContext, StepRegistry,
    StepResponse, SyncExecutable, TaskExecutable, TaskRequest, child_specs_from_parameters,
};
use conductor_store::{
    CorrelationId, Interrupt, InterruptState, InterruptStore, MaintenanceStore, MemoryStore,
    NodeExecution, NodeExecutionOp, NodeExecutionStore, PlanExecution, PlanExecutionStore,
    PurgeReport, ResponseData, SharedEngineStore, Status, StepResponseNotifyData, StoreResult,
    SweepingOutputInstance, SweepingOutputStore, WaitInstance, WaitStore,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

/// Succeeds, echoing its `outcome` parameter and publishing `outputs`.
pub struct Noop;

#[async_trait]
impl SyncExecutable for Noop {
    async fn execute_sync(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        let mut response = StepResponse::succeeded();
        if let Some(value) = ctx.parameter("outcome") {
            response = response.outcome("value", value.clone());
        }
        if let Some(outputs) = ctx.parameter("outputs").and_then(Value::as_object) {
            let group = ctx.parameter_str("group");
            for (name, value) in outputs {
                response = match group {
                    Some(group) => response.group_output(name.clone(), value.clone(), group),
                    None => response.output(name.clone(), value.clone()),
                };
            }
        }
        for (name, value) in &ctx.inputs.resolved {
            response = response.outcome(format!("input.{name}"), value.clone());
        }
        for (name, value) in &ctx.inputs.overrides {
            response = response.outcome(format!("override.{name}"), value.clone());
        }
        Ok(response)
    }
}

/// Raises a step error.
pub struct Boom;

#[async_trait]
impl SyncExecutable for Boom {
    async fn execute_sync(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        Err(EngineError::step("boom"))
    }
}

/// Fails until it has been called `failures` times, then succeeds.
pub struct Flaky {
    pub failures: usize,
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl SyncExecutable for Flaky {
    async fn execute_sync(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Ok(StepResponse::failed(format!("attempt {call} failed")))
        } else {
            Ok(StepResponse::succeeded().outcome("attempts", json!(call + 1)))
        }
    }
}

/// Sleeps `sleep_ms` inside the step itself.
pub struct Slow;

#[async_trait]
impl SyncExecutable for Slow {
    async fn execute_sync(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        let sleep_ms = ctx.parameter("sleep_ms").and_then(Value::as_u64).unwrap_or(50);
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        Ok(StepResponse::succeeded())
    }
}

/// Waits on one callback id per node; ids are recorded for the test to answer.
#[derive(Clone, Default)]
pub struct Remote {
    pub approval: bool,
    pub callbacks: Arc<Mutex<Vec<(String, CorrelationId)>>>,
    pub aborted: Arc<Mutex<Vec<CorrelationId>>>,
}

impl Remote {
    pub fn callback_for(&self, node_execution_id: &str) -> Option<CorrelationId> {
        self.callbacks
            .lock()
            .expect("callbacks mutex")
            .iter()
            .find(|(node, _)| node == node_execution_id)
            .map(|(_, id)| id.clone())
    }
}

#[async_trait]
impl AsyncExecutable for Remote {
    async fn execute_async(&self, ctx: &StepContext) -> EngineResult<AsyncExecutableResponse> {
        let callback_id = ctx.new_callback_id();
        self.callbacks
            .lock()
            .expect("callbacks mutex")
            .push((ctx.node_execution_id.clone(), callback_id.clone()));
        Ok(if self.approval {
            AsyncExecutableResponse::approval(vec![callback_id])
        } else {
            AsyncExecutableResponse::new(vec![callback_id])
        })
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<StepResponse> {
        let mut response = StepResponse::succeeded();
        for data in responses.values() {
            match data {
                ResponseData::Payload { value } => {
                    if value.get("approved") == Some(&Value::Bool(false)) {
                        return Ok(StepResponse::failed("rejected"));
                    }
                    response = response.outcome("payload", value.clone());
                }
                ResponseData::Error { message } => return Ok(StepResponse::failed(message.clone())),
                ResponseData::StepResponse(_) => {}
            }
        }
        Ok(response)
    }

    async fn handle_abort(
        &self,
        _ctx: &StepContext,
        callback_ids: &[CorrelationId],
    ) -> EngineResult<()> {
        self.aborted
            .lock()
            .expect("aborted mutex")
            .extend(callback_ids.iter().cloned());
        Ok(())
    }
}

/// Submits its parameters as an `echo` task.
pub struct EchoTask;

#[async_trait]
impl TaskExecutable for EchoTask {
    async fn obtain_task(&self, ctx: &StepContext) -> EngineResult<TaskRequest> {
        Ok(TaskRequest::new("echo", ctx.step_parameters.clone()))
    }
}

/// Runs the node named by its `child` parameter.
pub struct Wrap;

#[async_trait]
impl ChildExecutable for Wrap {
    async fn obtain_child(&self, ctx: &StepContext) -> EngineResult<ChildSpec> {
        ctx.parameter_str("child")
            .map(ChildSpec::new)
            .ok_or_else(|| EngineError::InvalidPlan("wrap needs a child".to_string()))
    }
}

/// Fans out to every entry of its `children` parameter.
pub struct Fork;

#[async_trait]
impl ChildrenExecutable for Fork {
    async fn obtain_children(&self, ctx: &StepContext) -> EngineResult<Vec<ChildSpec>> {
        child_specs_from_parameters(&ctx.step_parameters, "children")
    }
}

/// Runs the nodes listed in `links` one after another, counting links in the
/// pass-through value.
pub struct Chain;

impl Chain {
    fn links(ctx: &StepContext) -> Vec<String> {
        ctx.parameter("links")
            .and_then(Value::as_array)
            .map(|links| {
                links
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn link(links: &[String], index: usize) -> ChildChainResponse {
        match links.get(index) {
            Some(next) => ChildChainResponse::next(
                ChildSpec::new(next.clone()),
                json!(index + 1),
                index + 1 == links.len(),
            ),
            None => ChildChainResponse::end(json!(index)),
        }
    }
}

#[async_trait]
impl ChildChainExecutable for Chain {
    async fn execute_first_child(&self, ctx: &StepContext) -> EngineResult<ChildChainResponse> {
        Ok(Self::link(&Self::links(ctx), 0))
    }

    async fn execute_next_child(
        &self,
        ctx: &StepContext,
        pass_through: &Value,
        _previous: &StepResponseNotifyData,
    ) -> EngineResult<ChildChainResponse> {
        let index = pass_through.as_u64().unwrap_or(0) as usize;
        Ok(Self::link(&Self::links(ctx), index))
    }

    async fn finalize_execution(
        &self,
        _ctx: &StepContext,
        pass_through: &Value,
        last: Option<&StepResponseNotifyData>,
    ) -> EngineResult<StepResponse> {
        let status = last.map(|last| last.status).unwrap_or(conductor_store::Status::Succeeded);
        Ok(StepResponse {
            failure_info: last.and_then(|last| last.failure_info.clone()),
            ..StepResponse::with_status(status)
        }
        .outcome("links_run", pass_through.clone()))
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: SharedEngineStore,
    pub plans: Arc<InMemoryPlanProvider>,
    pub remote: Remote,
    pub approval: Remote,
    pub flaky_calls: Arc<AtomicUsize>,
    pub events: Arc<Mutex<Vec<EngineEvent>>>,
}

pub fn registry(
    remote: &Remote,
    approval: &Remote,
    flaky_calls: &Arc<AtomicUsize>,
) -> StepRegistry {
    StepRegistry::builder()
        .sync("noop", Noop)
        .and_then(|builder| builder.sync("boom", Boom))
        .and_then(|builder| {
            builder.sync(
                "flaky",
                Flaky {
                    failures: 2,
                    calls: Arc::clone(flaky_calls),
                },
            )
        })
        .and_then(|builder| builder.sync("slow", Slow))
        .and_then(|builder| builder.async_step("remote", remote.clone()))
        .and_then(|builder| builder.async_step("approval", approval.clone()))
        .and_then(|builder| builder.task("echo_task", EchoTask))
        .and_then(|builder| builder.child("wrap", Wrap))
        .and_then(|builder| builder.children("fork", Fork))
        .and_then(|builder| builder.child_chain("chain", Chain))
        .expect("test steps should register")
        .build()
}

pub fn task_executor() -> Arc<LocalTaskExecutor> {
    Arc::new(LocalTaskExecutor::new().with_handler("echo", |parameters: &Value| {
        match parameters.get("fail").and_then(Value::as_str) {
            Some(message) => ResponseData::error(message),
            None => ResponseData::payload(parameters.clone()),
        }
    }))
}

pub fn harness_with_store(store: SharedEngineStore) -> Harness {
    let plans = Arc::new(InMemoryPlanProvider::new());
    let remote = Remote::default();
    let approval = Remote {
        approval: true,
        ..Remote::default()
    };
    let flaky_calls = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&events);
    let sink = EngineEventSink::with_observer(Arc::new(move |event: &EngineEvent| {
        recorded.lock().expect("events mutex").push(event.clone());
    }));
    let orchestrator = Orchestrator::builder(Arc::clone(&store), plans.clone())
        .steps(registry(&remote, &approval, &flaky_calls))
        .task_executor(task_executor())
        .events(sink)
        .config(EngineConfig {
            plan_poll_interval_ms: 5,
            ..EngineConfig::default()
        })
        .build()
        .expect("orchestrator should build");
    Harness {
        orchestrator,
        store,
        plans,
        remote,
        approval,
        flaky_calls,
        events,
    }
}

pub fn harness() -> Harness {
    harness_with_store(Arc::new(MemoryStore::new()))
}

impl Harness {
    pub async fn start(&self, plan_execution_id: &str, plan: Plan) {
        self.plans
            .insert(plan_execution_id, plan)
            .expect("plan should be valid");
        self.orchestrator
            .start_plan(plan_execution_id, None, BTreeMap::new())
            .await
            .expect("plan should start");
    }

    pub async fn run(&self, plan_execution_id: &str, plan: Plan) -> conductor_store::PlanExecution {
        self.start(plan_execution_id, plan).await;
        self.orchestrator
            .wait_for_plan_completion(plan_execution_id, WAIT)
            .await
            .expect("plan should finish")
    }

    pub async fn nodes(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        self.store
            .fetch_node_executions(plan_execution_id)
            .await
            .expect("nodes should load")
    }

    pub async fn nodes_for(
        &self,
        plan_execution_id: &str,
        plan_node_id: &str,
    ) -> Vec<NodeExecution> {
        self.nodes(plan_execution_id)
            .await
            .into_iter()
            .filter(|node| node.node_id == plan_node_id)
            .collect()
    }

    pub fn events(&self) -> Vec<EngineEventKind> {
        self.events
            .lock()
            .expect("events mutex")
            .iter()
            .map(|event| event.kind.clone())
            .collect()
    }
}

/// Signals `entered`, then holds the step until `release` fires. Publishes one
/// output when it finally completes.
pub struct Gate {
    pub entered: Arc<tokio::sync::Notify>,
    pub release: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl SyncExecutable for Gate {
    async fn execute_sync(&self, _ctx: &StepContext) -> EngineResult<StepResponse> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(StepResponse::succeeded().output("artifact", json!("built")))
    }
}

/// Counts its invocations and always sends the node on to `next`.
pub struct CountingAdviser {
    pub calls: Arc<AtomicUsize>,
    pub next: String,
}

#[async_trait]
impl Adviser for CountingAdviser {
    async fn on_advise_event(&self, _event: &AdvisingEvent) -> EngineResult<Option<Advise>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Advise::NextStep {
            next_node_id: Some(self.next.clone()),
        }))
    }
}

/// Memory store that pauses a chosen node the moment one of its waits is
/// claimed, landing a pause between a resumer's read and its status update.
#[derive(Clone, Default)]
pub struct PauseOnClaim {
    pub inner: MemoryStore,
    pub target: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl NodeExecutionStore for PauseOnClaim {
    async fn create_node_execution(&self, node: NodeExecution) -> StoreResult<NodeExecution> {
        self.inner.create_node_execution(node).await
    }

    async fn get_node_execution(&self, uuid: &str) -> StoreResult<NodeExecution> {
        self.inner.get_node_execution(uuid).await
    }

    async fn update_node_execution(
        &self,
        uuid: &str,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<NodeExecution> {
        self.inner.update_node_execution(uuid, ops).await
    }

    async fn update_node_status_with_ops(
        &self,
        uuid: &str,
        expected: &[Status],
        status: Status,
        ops: Vec<NodeExecutionOp>,
    ) -> StoreResult<Option<NodeExecution>> {
        self.inner
            .update_node_status_with_ops(uuid, expected, status, ops)
            .await
    }

    async fn find_all_children_of(&self, parent_id: &str) -> StoreResult<Vec<NodeExecution>> {
        self.inner.find_all_children_of(parent_id).await
    }

    async fn find_by_status_in(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
    ) -> StoreResult<Vec<NodeExecution>> {
        self.inner.find_by_status_in(plan_execution_id, statuses).await
    }

    async fn fetch_node_executions(
        &self,
        plan_execution_id: &str,
    ) -> StoreResult<Vec<NodeExecution>> {
        self.inner.fetch_node_executions(plan_execution_id).await
    }
}

#[async_trait]
impl SweepingOutputStore for PauseOnClaim {
    async fn insert_output(&self, output: SweepingOutputInstance) -> StoreResult<()> {
        self.inner.insert_output(output).await
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

#[async_trait]
impl InterruptStore for PauseOnClaim {
    async fn save_interrupt(&self, interrupt: Interrupt) -> StoreResult<Interrupt> {
        self.inner.save_interrupt(interrupt).await
    }

    async fn get_interrupt(&self, uuid: &str) -> StoreResult<Interrupt> {
        self.inner.get_interrupt(uuid).await
    }

    async fn update_interrupt_state(
        &self,
        uuid: &str,
        expected: &[InterruptState],
        state: InterruptState,
    ) -> StoreResult<Option<Interrupt>> {
        self.inner.update_interrupt_state(uuid, expected, state).await
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

#[async_trait]
impl WaitStore for PauseOnClaim {
    async fn register_wait(&self, wait: WaitInstance) -> StoreResult<Option<WaitInstance>> {
        self.inner.register_wait(wait).await
    }

    async fn record_response(
        &self,
        correlation_id: &str,
        data: ResponseData,
    ) -> StoreResult<Vec<WaitInstance>> {
        self.inner.record_response(correlation_id, data).await
    }

    async fn claim_wait(&self, wait_id: &str) -> StoreResult<bool> {
        let target = self.target.lock().expect("target mutex").take();
        if let Some(node_execution_id) = target {
            self.inner
                .update_node_status_with_ops(
                    &node_execution_id,
                    &[Status::AsyncWaiting],
                    Status::Paused,
                    vec![],
                )
                .await?;
        }
        self.inner.claim_wait(wait_id).await
    }

    async fn release_wait(&self, wait_id: &str) -> StoreResult<bool> {
        self.inner.release_wait(wait_id).await
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

#[async_trait]
impl PlanExecutionStore for PauseOnClaim {
    async fn create_plan_execution(&self, plan: PlanExecution) -> StoreResult<PlanExecution> {
        self.inner.create_plan_execution(plan).await
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
        self.inner.update_plan_status(uuid, expected, status).await
    }

    async fn list_plan_executions(&self) -> StoreResult<Vec<PlanExecution>> {
        self.inner.list_plan_executions().await
    }
}

#[async_trait]
impl MaintenanceStore for PauseOnClaim {
    async fn purge_expired(&self, now_ms: u64) -> StoreResult<PurgeReport> {
        self.inner.purge_expired(now_ms).await
    }
}
