//! The plan executor.
//!
//! The orchestrator holds no authoritative state of its own: every decision is
//! read from the store and every transition is a conditional update. Node
//! activations and resumptions run as spawned Tokio tasks, so parallel
//! children progress independently and any instance pointed at the same store
//! can pick a plan up where another left it.

use crate::advisers::{Advise, AdviserRegistry, AdvisingEvent};
use crate::config::EngineConfig;
use crate::dispatcher::{InterruptCloser, NodeStatusUpdateDispatcher, NodeUpdateInfo};
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEventKind, EngineEventSink, NodeEvent, PlanEvent};
use crate::executables::{
    ExecuteOutcome, JoinPolicy, StrategyContext, StrategyTable, aggregate_status,
};
use crate::notifier::{CallbackSender, WaitNotifyEngine, callback_channel};
use crate::plan::{Plan, PlanNode, SharedPlanProvider};
use crate::step::{StepContext, StepInputs, StepKind, StepRegistry, StepResponse};
use crate::sweeping::SweepingOutputService;
use crate::task::{NoTaskExecutor, SharedTaskExecutor};
use conductor_store::{
    Ambiance, ExecutableResponse, InterruptEffect, InterruptState, InterruptStore, InterruptType,
    Level, NodeExecution, NodeExecutionOp, NodeExecutionStore, PlanExecution, PlanExecutionStore,
    ResponseData, SharedEngineStore, Status, WaitInstance, WaitState, WaitStore, now_ms,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub(crate) struct Inner {
    pub(crate) store: SharedEngineStore,
    pub(crate) plans: SharedPlanProvider,
    pub(crate) steps: StepRegistry,
    pub(crate) advisers: AdviserRegistry,
    pub(crate) strategies: StrategyTable,
    pub(crate) notifier: WaitNotifyEngine,
    pub(crate) sweeping: SweepingOutputService,
    pub(crate) dispatcher: NodeStatusUpdateDispatcher,
    pub(crate) events: EngineEventSink,
    pub(crate) callbacks: CallbackSender,
    pub(crate) config: EngineConfig,
    pub(crate) runtime: Handle,
    timers: Mutex<BTreeMap<String, AbortHandle>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    store: SharedEngineStore,
    plans: SharedPlanProvider,
    steps: StepRegistry,
    advisers: Option<AdviserRegistry>,
    task_executor: Option<SharedTaskExecutor>,
    events: EngineEventSink,
    config: EngineConfig,
}

impl OrchestratorBuilder {
    pub fn new(store: SharedEngineStore, plans: SharedPlanProvider) -> Self {
        Self {
            store,
            plans,
            steps: StepRegistry::default(),
            advisers: None,
            task_executor: None,
            events: EngineEventSink::default(),
            config: EngineConfig::default(),
        }
    }

    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    /// Defaults to [`AdviserRegistry::standard`].
    pub fn advisers(mut self, advisers: AdviserRegistry) -> Self {
        self.advisers = Some(advisers);
        self
    }

    pub fn task_executor(mut self, executor: SharedTaskExecutor) -> Self {
        self.task_executor = Some(executor);
        self
    }

    pub fn events(mut self, events: EngineEventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Must be called from within a Tokio runtime; the callback pump and all
    /// node work are spawned onto it.
    pub fn build(self) -> EngineResult<Orchestrator> {
        let runtime = Handle::try_current().map_err(|err| {
            EngineError::Runtime(format!("orchestrator requires a Tokio runtime: {err}"))
        })?;
        let (callbacks, mut receiver) = callback_channel();
        let advisers = self
            .advisers
            .unwrap_or_else(|| AdviserRegistry::standard(Arc::clone(&self.store)));
        let executor = self
            .task_executor
            .unwrap_or_else(|| Arc::new(NoTaskExecutor));
        let closer = InterruptCloser::new(Arc::clone(&self.store), self.events.clone());
        let inner = Arc::new(Inner {
            strategies: StrategyTable::new(
                executor,
                callbacks.clone(),
                self.config.abort_backoff.clone(),
            ),
            notifier: WaitNotifyEngine::new(Arc::clone(&self.store)),
            sweeping: SweepingOutputService::new(
                Arc::clone(&self.store),
                self.config.sweeping_output_ttl_ms,
            ),
            dispatcher: NodeStatusUpdateDispatcher::standard(closer, self.events.clone()),
            store: self.store,
            plans: self.plans,
            steps: self.steps,
            advisers,
            events: self.events,
            callbacks,
            config: self.config,
            runtime: runtime.clone(),
            timers: Mutex::new(BTreeMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        runtime.spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let orchestrator = Orchestrator { inner };
                if let Err(error) = orchestrator
                    .handle_callback(&delivery.correlation_id, delivery.data)
                    .await
                {
                    warn!(
                        correlation_id = %delivery.correlation_id,
                        error = %error,
                        "callback delivery failed"
                    );
                }
            }
        });

        Ok(Orchestrator { inner })
    }
}

/// Links a new node execution inherits from where it was spawned.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeLinks {
    pub parent_id: Option<String>,
    pub previous_id: Option<String>,
    pub notify_id: Option<String>,
    pub additional_inputs: BTreeMap<String, Value>,
    pub retry_ids: Vec<String>,
    pub interrupt_histories: Vec<InterruptEffect>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub activated: usize,
    pub rerun: usize,
    pub resumed: usize,
    pub readvised: usize,
    pub retries: usize,
    pub waits: usize,
    pub children: usize,
    pub interrupts: usize,
    pub timers: usize,
}

fn level_for(plan_node: &PlanNode, runtime_id: String) -> Level {
    let level = Level::new(runtime_id, plan_node.uuid.clone(), plan_node.step_type.clone());
    match &plan_node.group {
        Some(group) => level.with_group(group.clone()),
        None => level,
    }
}

impl Orchestrator {
    pub fn builder(store: SharedEngineStore, plans: SharedPlanProvider) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, plans)
    }

    pub fn store(&self) -> &SharedEngineStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EngineEventSink {
        &self.inner.events
    }

    /// Sender remote executors can use to answer correlation ids.
    pub fn callback_sender(&self) -> CallbackSender {
        self.inner.callbacks.clone()
    }

    /// Records the plan run and schedules `root_node_id` (the plan's start node
    /// when `None`).
    pub async fn start_plan(
        &self,
        plan_execution_id: &str,
        root_node_id: Option<&str>,
        setup_abstractions: BTreeMap<String, String>,
    ) -> EngineResult<PlanExecution> {
        let plan = self.inner.plans.plan_for(plan_execution_id).await?;
        plan.validate()?;
        let root = plan.require_node(root_node_id.unwrap_or(&plan.start_node_id))?;

        let now = now_ms();
        let plan_execution = self
            .inner
            .store
            .create_plan_execution(PlanExecution {
                uuid: plan_execution_id.to_string(),
                plan_id: plan.plan_id.clone(),
                status: Status::Running,
                start_ts: Some(now),
                end_ts: None,
                setup_abstractions: setup_abstractions.clone(),
                created_at: now,
                last_updated_at: now,
            })
            .await?;
        info!(
            plan_execution_id = %plan_execution_id,
            plan_id = %plan.plan_id,
            root_node_id = %root.uuid,
            "plan started"
        );
        self.inner
            .events
            .emit(EngineEventKind::Plan(PlanEvent::Started {
                plan_execution_id: plan_execution_id.to_string(),
                plan_id: plan.plan_id.clone(),
            }));

        let ambiance = Ambiance::new(plan_execution_id, setup_abstractions)
            .derive_child(level_for(root, uuid::Uuid::new_v4().to_string()));
        let node = self.create_node(ambiance, root, NodeLinks::default()).await?;
        self.spawn_activation(&node);
        Ok(plan_execution)
    }

    /// Records a response for `correlation_id` and resumes every node whose
    /// wait it completed. Returns how many were resumed.
    pub async fn handle_callback(
        &self,
        correlation_id: &str,
        data: ResponseData,
    ) -> EngineResult<usize> {
        let ready = self.inner.notifier.notify(correlation_id, data).await?;
        let resumed = ready.len();
        for wait in ready {
            self.spawn_resume(wait);
        }
        Ok(resumed)
    }

    /// Polls until the plan run reaches a final status.
    pub async fn wait_for_plan_completion(
        &self,
        plan_execution_id: &str,
        timeout: Duration,
    ) -> EngineResult<PlanExecution> {
        tokio::time::timeout(timeout, self.poll_plan_completion(plan_execution_id))
            .await
            .map_err(|_| {
                EngineError::Runtime(format!(
                    "plan execution '{plan_execution_id}' did not finish within {timeout:?}"
                ))
            })?
    }

    async fn poll_plan_completion(&self, plan_execution_id: &str) -> EngineResult<PlanExecution> {
        let poll = Duration::from_millis(self.inner.config.plan_poll_interval_ms.max(1));
        loop {
            let plan = self.inner.store.get_plan_execution(plan_execution_id).await?;
            if plan.status.is_final() {
                return Ok(plan);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Polls until the current attempt of plan node `node_id` is in `status`.
    pub async fn wait_for_node_status(
        &self,
        plan_execution_id: &str,
        node_id: &str,
        status: Status,
        timeout: Duration,
    ) -> EngineResult<NodeExecution> {
        tokio::time::timeout(
            timeout,
            self.poll_node_status(plan_execution_id, node_id, status),
        )
        .await
        .map_err(|_| {
            EngineError::Runtime(format!(
                "node '{node_id}' of '{plan_execution_id}' did not reach {status} within {timeout:?}"
            ))
        })?
    }

    async fn poll_node_status(
        &self,
        plan_execution_id: &str,
        node_id: &str,
        status: Status,
    ) -> EngineResult<NodeExecution> {
        let poll = Duration::from_millis(self.inner.config.plan_poll_interval_ms.max(1));
        loop {
            let found = self
                .inner
                .store
                .find_by_status_in(plan_execution_id, &[status])
                .await?
                .into_iter()
                .find(|node| node.node_id == node_id);
            if let Some(node) = found {
                return Ok(node);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Re-drives a plan run from the store alone after a process restart.
    ///
    /// Every window between two store writes is closed from what the store
    /// already holds: waits are rebuilt from the latest executable response,
    /// missing children are created, superseded attempts get their successor
    /// and final nodes nobody advised are advised again.
    pub async fn recover(&self, plan_execution_id: &str) -> EngineResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let plan_execution = self.inner.store.get_plan_execution(plan_execution_id).await?;
        if plan_execution.status.is_final() {
            return Ok(report);
        }

        for interrupt in self
            .inner
            .store
            .fetch_active_interrupts(plan_execution_id)
            .await?
        {
            if interrupt.state == InterruptState::Registered {
                self.apply_interrupt(&interrupt.uuid).await?;
                report.interrupts += 1;
            }
        }

        let plan = self.inner.plans.plan_for(plan_execution_id).await?;
        let nodes = self.inner.store.fetch_node_executions(plan_execution_id).await?;
        for node in &nodes {
            if node.old_retry {
                let superseded = nodes.iter().any(|other| other.retry_ids.contains(&node.uuid));
                if !superseded {
                    let plan_node = plan.require_node(&node.node_id)?;
                    self.launch_retry(node, plan_node, None, 0).await?;
                    report.retries += 1;
                }
                continue;
            }

            match node.status {
                Status::Queued => {
                    self.spawn_activation(node);
                    report.activated += 1;
                }
                Status::Running if node.executable_responses.is_empty() => {
                    // The step ran but its result was never committed.
                    if let Some(requeued) = self
                        .inner
                        .store
                        .update_node_status_with_ops(
                            &node.uuid,
                            &[Status::Running],
                            Status::Queued,
                            vec![],
                        )
                        .await?
                    {
                        self.spawn_activation(&requeued);
                        report.rerun += 1;
                    }
                }
                status if status.is_final() => {
                    if !self.is_settled(node, &nodes).await? {
                        self.spawn_readvise(node.clone());
                        report.readvised += 1;
                    }
                }
                Status::Running
                | Status::Paused
                | Status::AsyncWaiting
                | Status::TaskWaiting
                | Status::ApprovalWaiting => {
                    if let Some(response) = node.latest_executable_response() {
                        if self.restore_wait(node, response).await? {
                            report.waits += 1;
                        }
                        if node.status == Status::Running {
                            report.children +=
                                self.restore_children(node, response, &plan, &nodes).await?;
                        }
                    }
                }
                _ => {}
            }
            if !node.status.is_final() && node.status != Status::Queued && node.timeout_ms.is_some()
            {
                self.arm_timeout(node);
                report.timers += 1;
            }
        }

        for wait in self.inner.notifier.ready_waits(plan_execution_id).await? {
            self.spawn_resume(wait);
            report.resumed += 1;
        }
        // A node being advised again ends its own transition.
        if report.readvised == 0 {
            self.conclude_plan(plan_execution_id).await?;
        }
        info!(plan_execution_id = %plan_execution_id, ?report, "plan recovered");
        Ok(report)
    }

    /// Whether the advise of a final node left a trace: a successor, or a
    /// response recorded for whoever it notifies.
    async fn is_settled(
        &self,
        node: &NodeExecution,
        nodes: &[NodeExecution],
    ) -> EngineResult<bool> {
        if node.next_id.is_some() {
            return Ok(true);
        }
        if let Some(parent_id) = &node.parent_id {
            let parent_final = nodes
                .iter()
                .any(|other| &other.uuid == parent_id && other.status.is_final());
            if parent_final {
                return Ok(true);
            }
        }
        let successor = nodes
            .iter()
            .rev()
            .find(|other| other.previous_id.as_deref() == Some(node.uuid.as_str()));
        if let Some(successor) = successor {
            self.inner
                .store
                .update_node_execution(
                    &node.uuid,
                    vec![NodeExecutionOp::SetNextId(successor.uuid.clone())],
                )
                .await?;
            return Ok(true);
        }
        match &node.notify_id {
            Some(notify_id) => Ok(!self
                .inner
                .store
                .fetch_responses(std::slice::from_ref(notify_id))
                .await?
                .is_empty()),
            None => Ok(false),
        }
    }

    /// Makes sure the node is suspended on the ids its latest response names.
    /// A missing wait is registered again; one claimed by a resumption that
    /// never finished is handed back. Returns whether anything changed.
    async fn restore_wait(
        &self,
        node: &NodeExecution,
        response: &ExecutableResponse,
    ) -> EngineResult<bool> {
        let correlation_ids = response.correlation_ids();
        if correlation_ids.is_empty() {
            return Ok(false);
        }
        let waits = self.inner.store.fetch_node_waits(&node.uuid).await?;
        match waits
            .iter()
            .rev()
            .find(|wait| wait.correlation_ids == correlation_ids)
        {
            None => {
                debug!(node_execution_id = %node.uuid, "rebuilding missing wait");
                self.inner
                    .notifier
                    .wait_for_all(&node.plan_execution_id, &node.uuid, correlation_ids)
                    .await?;
                Ok(true)
            }
            Some(wait) if wait.state == WaitState::Done => {
                debug!(node_execution_id = %node.uuid, wait_id = %wait.uuid, "releasing wait");
                Ok(self.inner.store.release_wait(&wait.uuid).await?)
            }
            Some(_) => Ok(false),
        }
    }

    /// Creates the children a spawn response names but the store never got.
    async fn restore_children(
        &self,
        parent: &NodeExecution,
        response: &ExecutableResponse,
        plan: &Plan,
        nodes: &[NodeExecution],
    ) -> EngineResult<usize> {
        let mut created = 0;
        for child in response.spawned_children() {
            if nodes.iter().any(|node| node.uuid == child.runtime_id) {
                continue;
            }
            let plan_node = plan.require_node(&child.plan_node_id)?;
            let node = self
                .create_child(parent, plan_node, child.runtime_id, child.input_overrides)
                .await?;
            self.spawn_activation(&node);
            created += 1;
        }
        Ok(created)
    }

    pub(crate) fn spawn_activation(&self, node: &NodeExecution) {
        let this = self.clone();
        let node_execution_id = node.uuid.clone();
        let span = info_span!(
            "node",
            plan_execution_id = %node.plan_execution_id,
            node_execution_id = %node.uuid,
            node_id = %node.node_id,
            step_type = %node.step_type,
        );
        self.inner.runtime.spawn(
            async move {
                if let Err(error) = this.activate(&node_execution_id).await {
                    warn!(error = %error, "node activation failed");
                }
            }
            .instrument(span),
        );
    }

    pub(crate) fn spawn_resume(&self, wait: WaitInstance) {
        let this = self.clone();
        let span = info_span!(
            "resume",
            plan_execution_id = %wait.plan_execution_id,
            node_execution_id = %wait.node_execution_id,
            wait_id = %wait.uuid,
        );
        self.inner.runtime.spawn(
            async move {
                if let Err(error) = this.resume_wait(wait).await {
                    warn!(error = %error, "node resumption failed");
                }
            }
            .instrument(span),
        );
    }

    fn spawn_readvise(&self, node: NodeExecution) {
        let this = self.clone();
        let span = info_span!(
            "readvise",
            plan_execution_id = %node.plan_execution_id,
            node_execution_id = %node.uuid,
        );
        self.inner.runtime.spawn(
            async move {
                let result = if node.status.triggers_advisers() {
                    this.run_advisers(node).await
                } else {
                    this.end_transition(&node).await
                };
                if let Err(error) = result {
                    warn!(error = %error, "advising recovered node failed");
                }
            }
            .instrument(span),
        );
    }

    pub(crate) async fn dispatch(&self, node: &NodeExecution) {
        self.inner
            .dispatcher
            .dispatch(NodeUpdateInfo::from(node))
            .await;
    }

    pub(crate) async fn create_node(
        &self,
        ambiance: Ambiance,
        plan_node: &PlanNode,
        links: NodeLinks,
    ) -> EngineResult<NodeExecution> {
        let mut node = NodeExecution::queued(
            ambiance,
            plan_node.identifier.clone(),
            plan_node.step_parameters.clone(),
        )
        .ok_or_else(|| EngineError::Runtime("node ambiance has no level".to_string()))?;
        node.parent_id = links.parent_id;
        node.previous_id = links.previous_id;
        node.notify_id = links.notify_id;
        node.additional_inputs = links.additional_inputs;
        node.retry_ids = links.retry_ids;
        node.interrupt_histories = links.interrupt_histories;
        node.timeout_ms = plan_node.timeout_ms;
        node.expires_at = self
            .inner
            .config
            .node_execution_ttl_ms
            .map(|ttl| node.created_at.saturating_add(ttl));
        Ok(self.inner.store.create_node_execution(node).await?)
    }

    async fn create_child(
        &self,
        parent: &NodeExecution,
        plan_node: &PlanNode,
        runtime_id: String,
        input_overrides: BTreeMap<String, Value>,
    ) -> EngineResult<NodeExecution> {
        let ambiance = parent
            .ambiance
            .derive_child(level_for(plan_node, runtime_id.clone()));
        let links = NodeLinks {
            parent_id: Some(parent.uuid.clone()),
            notify_id: Some(runtime_id),
            additional_inputs: input_overrides,
            ..NodeLinks::default()
        };
        self.create_node(ambiance, plan_node, links).await
    }

    async fn active_pause_all(
        &self,
        plan_execution_id: &str,
    ) -> EngineResult<Option<conductor_store::Interrupt>> {
        Ok(self
            .inner
            .store
            .fetch_active_interrupts(plan_execution_id)
            .await?
            .into_iter()
            .find(|interrupt| {
                interrupt.interrupt_type == InterruptType::PauseAll
                    && interrupt.state == InterruptState::Processing
            }))
    }

    async fn activate(&self, node_execution_id: &str) -> EngineResult<()> {
        let node = self.inner.store.get_node_execution(node_execution_id).await?;
        if node.status != Status::Queued || node.old_retry {
            debug!(status = %node.status, "node no longer queued");
            return Ok(());
        }

        let plan_execution = self
            .inner
            .store
            .get_plan_execution(&node.plan_execution_id)
            .await?;
        if plan_execution.status.is_final() {
            if let Some(aborted) = self
                .inner
                .store
                .update_node_status_with_ops(&node.uuid, &[Status::Queued], Status::Aborted, vec![])
                .await?
            {
                debug!("plan already finished; queued node aborted");
                self.dispatch(&aborted).await;
            }
            return Ok(());
        }

        if let Some(pause) = self.active_pause_all(&node.plan_execution_id).await? {
            let effect = InterruptEffect {
                interrupt_id: pause.uuid,
                interrupt_type: InterruptType::PauseAll,
                took_effect_at: now_ms(),
            };
            if let Some(paused) = self
                .inner
                .store
                .update_node_status_with_ops(
                    &node.uuid,
                    &[Status::Queued],
                    Status::Paused,
                    vec![NodeExecutionOp::AddInterruptHistory(effect)],
                )
                .await?
            {
                self.dispatch(&paused).await;
            }
            return Ok(());
        }

        let plan = match self.inner.plans.plan_for(&node.plan_execution_id).await {
            Ok(plan) => plan,
            Err(error) => return self.handle_error(node, error).await,
        };
        let step = match self.resolve_step(&plan, &node) {
            Ok(step) => step,
            Err(error) => return self.handle_error(node, error).await,
        };

        let Some(node) = self
            .inner
            .store
            .update_node_status_with_ops(
                &node.uuid,
                Status::allowed_start_set(Status::Running),
                Status::Running,
                vec![
                    NodeExecutionOp::SetMode(step.mode()),
                    NodeExecutionOp::SetStartTs(now_ms()),
                ],
            )
            .await?
        else {
            debug!("lost race starting node");
            return Ok(());
        };
        self.dispatch(&node).await;
        self.arm_timeout(&node);

        match self.start_step(&plan, &node, &step).await {
            Ok(outcome) => self.process_outcome(node, &plan, outcome).await,
            Err(error) => self.handle_error(node, error).await,
        }
    }

    fn resolve_step(&self, plan: &Plan, node: &NodeExecution) -> EngineResult<StepKind> {
        let plan_node = plan.require_node(&node.node_id)?;
        let expected = node.mode.or(plan_node.mode);
        Ok(self.inner.steps.resolve(&node.step_type, expected)?.clone())
    }

    async fn resolve_inputs(
        &self,
        node: &NodeExecution,
        plan_node: &PlanNode,
    ) -> EngineResult<StepInputs> {
        let mut resolved = BTreeMap::new();
        for ref_object in &plan_node.ref_objects {
            let value = if ref_object.optional {
                self.inner
                    .sweeping
                    .resolve_optional(&node.ambiance, ref_object)
                    .await?
            } else {
                Some(self.inner.sweeping.resolve(&node.ambiance, ref_object).await?)
            };
            if let Some(value) = value {
                resolved.insert(ref_object.name.clone(), value);
            }
        }
        Ok(StepInputs {
            resolved,
            overrides: node.additional_inputs.clone(),
        })
    }

    pub(crate) fn step_context(&self, node: &NodeExecution, inputs: StepInputs) -> StepContext {
        StepContext {
            ambiance: node.ambiance.clone(),
            node_execution_id: node.uuid.clone(),
            step_parameters: node.step_parameters.clone(),
            inputs,
        }
    }

    async fn start_step(
        &self,
        plan: &Plan,
        node: &NodeExecution,
        step: &StepKind,
    ) -> EngineResult<ExecuteOutcome> {
        let plan_node = plan.require_node(&node.node_id)?;
        let inputs = self.resolve_inputs(node, plan_node).await?;
        let step_ctx = self.step_context(node, inputs);
        let ctx = StrategyContext {
            step,
            step_ctx: &step_ctx,
            node,
            plan_node,
        };
        self.inner
            .strategies
            .for_mode(step.mode())
            .start(&ctx)
            .await
    }

    async fn resume_step(
        &self,
        plan: &Plan,
        node: &NodeExecution,
        wait: &WaitInstance,
    ) -> EngineResult<ExecuteOutcome> {
        let plan_node = plan.require_node(&node.node_id)?;
        let step = self.resolve_step(plan, node)?;
        let inputs = self.resolve_inputs(node, plan_node).await?;
        let step_ctx = self.step_context(node, inputs);
        let responses = self.inner.notifier.responses(wait).await?;
        let ctx = StrategyContext {
            step: &step,
            step_ctx: &step_ctx,
            node,
            plan_node,
        };
        self.inner
            .strategies
            .for_mode(step.mode())
            .resume(&ctx, &responses)
            .await
    }

    async fn resume_wait(&self, wait: WaitInstance) -> EngineResult<()> {
        let node = self
            .inner
            .store
            .get_node_execution(&wait.node_execution_id)
            .await?;
        if node.status == Status::Paused {
            debug!("node paused; wait stays ready until resumed");
            return Ok(());
        }
        if !self.inner.notifier.claim(&wait).await? {
            debug!("wait already claimed");
            return Ok(());
        }
        if node.old_retry || node.status.is_final() {
            debug!(status = %node.status, "discarding responses for a finished node");
            return Ok(());
        }

        let node = if node.status == Status::Running {
            node
        } else {
            match self
                .inner
                .store
                .update_node_status_with_ops(&node.uuid, &[node.status], Status::Running, vec![])
                .await?
            {
                Some(running) => {
                    self.dispatch(&running).await;
                    running
                }
                None => {
                    // Hand the responses back for whoever moves the node next.
                    self.inner.store.release_wait(&wait.uuid).await?;
                    debug!("lost race resuming node; wait released");
                    return Ok(());
                }
            }
        };

        let plan = match self.inner.plans.plan_for(&node.plan_execution_id).await {
            Ok(plan) => plan,
            Err(error) => return self.handle_error(node, error).await,
        };
        match self.resume_step(&plan, &node, &wait).await {
            Ok(outcome) => self.process_outcome(node, &plan, outcome).await,
            Err(error) => self.handle_error(node, error).await,
        }
    }

    async fn process_outcome(
        &self,
        node: NodeExecution,
        plan: &Plan,
        outcome: ExecuteOutcome,
    ) -> EngineResult<()> {
        match outcome {
            ExecuteOutcome::Completed(response) => self.conclude(node, response).await,
            ExecuteOutcome::Waiting {
                status,
                response,
                correlation_ids,
            } => {
                let Some(waiting) = self
                    .inner
                    .store
                    .update_node_status_with_ops(
                        &node.uuid,
                        &[Status::Running],
                        status,
                        vec![NodeExecutionOp::AddExecutableResponse(response)],
                    )
                    .await?
                else {
                    debug!(status = %status, "lost race suspending node");
                    return Ok(());
                };
                self.dispatch(&waiting).await;
                if let Some(ready) = self
                    .inner
                    .notifier
                    .wait_for_all(&waiting.plan_execution_id, &waiting.uuid, correlation_ids)
                    .await?
                {
                    self.spawn_resume(ready);
                }
                Ok(())
            }
            ExecuteOutcome::Spawn { response, children } => {
                let mut planned = Vec::with_capacity(children.len());
                for launch in children {
                    match plan.require_node(&launch.plan_node_id) {
                        Ok(plan_node) => planned.push((launch, plan_node)),
                        Err(error) => return self.handle_error(node, error).await,
                    }
                }
                let Some(parent) = self
                    .inner
                    .store
                    .update_node_status_with_ops(
                        &node.uuid,
                        &[Status::Running],
                        Status::Running,
                        vec![NodeExecutionOp::AddExecutableResponse(response)],
                    )
                    .await?
                else {
                    debug!("lost race spawning children");
                    return Ok(());
                };

                let correlation_ids = planned
                    .iter()
                    .map(|(launch, _)| launch.runtime_id.clone())
                    .collect();
                let ready = self
                    .inner
                    .notifier
                    .wait_for_all(&parent.plan_execution_id, &parent.uuid, correlation_ids)
                    .await?;

                let mut created = Vec::with_capacity(planned.len());
                for (launch, plan_node) in planned {
                    created.push(
                        self.create_child(
                            &parent,
                            plan_node,
                            launch.runtime_id,
                            launch.input_overrides,
                        )
                        .await?,
                    );
                }
                debug!(children = created.len(), "children spawned");
                if let Some(ready) = ready {
                    self.spawn_resume(ready);
                }
                for child in &created {
                    self.spawn_activation(child);
                }
                Ok(())
            }
        }
    }

    /// Commits the final status, then publishes the step's outputs. Only the
    /// writer that won the status update publishes anything; an output that
    /// clashes with an existing one turns the node into a failure.
    async fn conclude(&self, node: NodeExecution, response: StepResponse) -> EngineResult<()> {
        let StepResponse {
            status,
            outcomes,
            failure_info,
            sweeping_outputs,
        } = response;
        if !status.is_final() {
            let error =
                EngineError::Runtime(format!("step concluded with non final status {status}"));
            return self.handle_error(node, error).await;
        }
        let ops = vec![
            NodeExecutionOp::SetOutcomes(outcomes),
            match failure_info {
                Some(info) => NodeExecutionOp::SetFailureInfo(info),
                None => NodeExecutionOp::ClearFailureInfo,
            },
        ];
        let Some(concluded) = self
            .inner
            .store
            .update_node_status_with_ops(&node.uuid, Status::allowed_start_set(status), status, ops)
            .await?
        else {
            debug!(status = %status, "lost race concluding node");
            return Ok(());
        };

        for output in &sweeping_outputs {
            if let Err(error) = self
                .inner
                .sweeping
                .consume(
                    &concluded.ambiance,
                    &output.name,
                    output.value.clone(),
                    output.group.as_deref(),
                )
                .await
            {
                return self.fail_concluded(concluded, error).await;
            }
        }
        self.after_final(concluded).await
    }

    /// Moves a node that already reached its final status to the failure the
    /// error calls for.
    async fn fail_concluded(&self, node: NodeExecution, error: EngineError) -> EngineResult<()> {
        let status = error.failure_status();
        warn!(
            node_execution_id = %node.uuid,
            status = %status,
            error = %error,
            "publishing outputs failed"
        );
        match self
            .inner
            .store
            .update_node_status_with_ops(
                &node.uuid,
                &[node.status],
                status,
                vec![NodeExecutionOp::SetFailureInfo(error.failure_info())],
            )
            .await?
        {
            Some(failed) => self.after_final(failed).await,
            None => {
                debug!("lost race failing concluded node");
                Ok(())
            }
        }
    }

    pub(crate) async fn handle_error(
        &self,
        node: NodeExecution,
        error: EngineError,
    ) -> EngineResult<()> {
        let status = error.failure_status();
        warn!(
            node_execution_id = %node.uuid,
            status = %status,
            error = %error,
            "step raised an error"
        );
        match self
            .inner
            .store
            .update_node_status_with_ops(
                &node.uuid,
                &Status::non_final(),
                status,
                vec![NodeExecutionOp::SetFailureInfo(error.failure_info())],
            )
            .await?
        {
            Some(failed) => self.after_final(failed).await,
            None => {
                debug!("lost race failing node");
                Ok(())
            }
        }
    }

    /// Observers, then advisers (or the end transition for aborted nodes).
    pub(crate) async fn after_final(&self, node: NodeExecution) -> EngineResult<()> {
        self.disarm_timeout(&node.uuid);
        self.dispatch(&node).await;
        if node.status.triggers_advisers() {
            self.run_advisers(node).await
        } else {
            self.end_transition(&node).await
        }
    }

    async fn run_advisers(&self, node: NodeExecution) -> EngineResult<()> {
        let plan = match self.inner.plans.plan_for(&node.plan_execution_id).await {
            Ok(plan) => plan,
            Err(error) => return self.fail_on_adviser_error(node, error).await,
        };
        let plan_node = match plan.require_node(&node.node_id) {
            Ok(plan_node) => plan_node,
            Err(error) => return self.fail_on_adviser_error(node, error).await,
        };
        for obtainment in &plan_node.advisers {
            let adviser = match self.inner.advisers.get(&obtainment.adviser_type) {
                Ok(adviser) => Arc::clone(adviser),
                Err(error) => return self.fail_on_adviser_error(node, error).await,
            };
            let event = AdvisingEvent {
                node: node.clone(),
                to_status: node.status,
                adviser_parameters: obtainment.parameters.clone(),
            };
            match adviser.on_advise_event(&event).await {
                Ok(Some(advise)) => return self.handle_advise(node, &plan, advise).await,
                Ok(None) => {}
                Err(error) => return self.fail_on_adviser_error(node, error).await,
            }
        }
        self.end_transition(&node).await
    }

    /// Adviser failures are authoring bugs: the node errors out and its branch
    /// ends, the rest of the engine keeps going.
    async fn fail_on_adviser_error(
        &self,
        node: NodeExecution,
        error: EngineError,
    ) -> EngineResult<()> {
        error!(
            plan_execution_id = %node.plan_execution_id,
            node_execution_id = %node.uuid,
            error = %error,
            "adviser failed"
        );
        let node = if node.status == Status::Errored {
            node
        } else {
            match self
                .inner
                .store
                .update_node_status_with_ops(
                    &node.uuid,
                    &[node.status],
                    Status::Errored,
                    vec![NodeExecutionOp::SetFailureInfo(error.failure_info())],
                )
                .await?
            {
                Some(errored) => {
                    self.dispatch(&errored).await;
                    errored
                }
                None => {
                    debug!("lost race erroring node");
                    return Ok(());
                }
            }
        };
        self.end_transition(&node).await
    }

    async fn handle_advise(
        &self,
        node: NodeExecution,
        plan: &Plan,
        advise: Advise,
    ) -> EngineResult<()> {
        info!(
            node_execution_id = %node.uuid,
            status = %node.status,
            advise = advise.label(),
            "node advised"
        );
        self.inner
            .events
            .emit(EngineEventKind::Node(NodeEvent::Advised {
                plan_execution_id: node.plan_execution_id.clone(),
                node_execution_id: node.uuid.clone(),
                advise: advise.label().to_string(),
            }));

        match advise {
            Advise::Retry {
                retry_node_execution_id,
                wait_interval_ms,
            } => {
                if wait_interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(wait_interval_ms)).await;
                }
                let target = self
                    .inner
                    .store
                    .get_node_execution(&retry_node_execution_id)
                    .await?;
                self.retry_node(&target, plan, None, wait_interval_ms)
                    .await
                    .map(|_| ())
            }
            Advise::NextStep {
                next_node_id: Some(next_node_id),
            } => {
                let plan_node = match plan.require_node(&next_node_id) {
                    Ok(plan_node) => plan_node,
                    Err(error) => return self.fail_on_adviser_error(node, error).await,
                };
                self.start_next(&node, plan_node).await
            }
            Advise::NextStep { next_node_id: None } => self.end_transition(&node).await,
            Advise::InterventionWait => {
                match self
                    .inner
                    .store
                    .update_node_status_with_ops(
                        &node.uuid,
                        &[node.status],
                        Status::InterventionWaiting,
                        vec![],
                    )
                    .await?
                {
                    Some(waiting) => self.dispatch(&waiting).await,
                    None => debug!("lost race entering intervention wait"),
                }
                Ok(())
            }
            Advise::EndPlan => self.end_plan(&node).await,
        }
    }

    async fn start_next(&self, node: &NodeExecution, plan_node: &PlanNode) -> EngineResult<()> {
        let ambiance = node
            .ambiance
            .with_current_level(level_for(plan_node, uuid::Uuid::new_v4().to_string()));
        let links = NodeLinks {
            parent_id: node.parent_id.clone(),
            previous_id: Some(node.uuid.clone()),
            notify_id: node.notify_id.clone(),
            ..NodeLinks::default()
        };
        let next = self.create_node(ambiance, plan_node, links).await?;
        self.inner
            .store
            .update_node_execution(&node.uuid, vec![NodeExecutionOp::SetNextId(next.uuid.clone())])
            .await?;
        self.spawn_activation(&next);
        Ok(())
    }

    /// Supersedes `node` with a fresh attempt at the same plan node. `None`
    /// when another writer moved the node first.
    pub(crate) async fn retry_node(
        &self,
        node: &NodeExecution,
        plan: &Plan,
        effect: Option<InterruptEffect>,
        wait_interval_ms: u64,
    ) -> EngineResult<Option<NodeExecution>> {
        let plan_node = plan.require_node(&node.node_id)?;
        let Some(old) = self
            .inner
            .store
            .update_node_status_with_ops(
                &node.uuid,
                &[node.status],
                node.status,
                vec![NodeExecutionOp::MarkOldRetry],
            )
            .await?
        else {
            debug!(node_execution_id = %node.uuid, "lost race retrying node");
            return Ok(None);
        };
        self.launch_retry(&old, plan_node, effect, wait_interval_ms)
            .await
            .map(Some)
    }

    /// Creates and starts the attempt that follows the superseded `old`.
    async fn launch_retry(
        &self,
        old: &NodeExecution,
        plan_node: &PlanNode,
        effect: Option<InterruptEffect>,
        wait_interval_ms: u64,
    ) -> EngineResult<NodeExecution> {
        let retry_id = uuid::Uuid::new_v4().to_string();
        let level = old
            .ambiance
            .current_level()
            .ok_or_else(|| EngineError::Runtime("node ambiance has no level".to_string()))?
            .next_attempt(retry_id);
        let mut retry_ids = old.retry_ids.clone();
        retry_ids.push(old.uuid.clone());
        let links = NodeLinks {
            parent_id: old.parent_id.clone(),
            previous_id: old.previous_id.clone(),
            notify_id: old.notify_id.clone(),
            additional_inputs: old.additional_inputs.clone(),
            retry_ids,
            interrupt_histories: effect.into_iter().collect(),
        };
        let retry = self
            .create_node(old.ambiance.with_current_level(level), plan_node, links)
            .await?;
        if let Some(previous_id) = &old.previous_id {
            self.inner
                .store
                .update_node_execution(
                    previous_id,
                    vec![NodeExecutionOp::SetNextId(retry.uuid.clone())],
                )
                .await?;
        }
        info!(
            node_execution_id = %old.uuid,
            retry_node_execution_id = %retry.uuid,
            attempt = retry.retry_count(),
            "node retrying"
        );
        self.inner
            .events
            .emit(EngineEventKind::Node(NodeEvent::Retrying {
                plan_execution_id: old.plan_execution_id.clone(),
                node_execution_id: old.uuid.clone(),
                retry_node_execution_id: retry.uuid.clone(),
                wait_interval_ms,
            }));
        self.spawn_activation(&retry);
        Ok(retry)
    }

    async fn end_plan(&self, node: &NodeExecution) -> EngineResult<()> {
        let active = self
            .inner
            .store
            .find_by_status_in(&node.plan_execution_id, &Status::non_final())
            .await?;
        for other in active.iter().filter(|other| other.uuid != node.uuid) {
            self.abort_node(other, None).await?;
        }
        self.finish_plan(&node.plan_execution_id, node.status).await?;
        Ok(())
    }

    /// Reports a settled node to whoever waits on it: its parent through the
    /// notifier, or the plan run itself for root-level nodes.
    pub(crate) async fn end_transition(&self, node: &NodeExecution) -> EngineResult<()> {
        match &node.notify_id {
            Some(notify_id) => {
                self.handle_callback(notify_id, ResponseData::StepResponse(node.to_notify_data()))
                    .await?;
                Ok(())
            }
            None => self.conclude_plan(&node.plan_execution_id).await,
        }
    }

    async fn conclude_plan(&self, plan_execution_id: &str) -> EngineResult<()> {
        let nodes = self.inner.store.fetch_node_executions(plan_execution_id).await?;
        let roots: Vec<Status> = nodes
            .iter()
            .filter(|node| node.parent_id.is_none() && !node.old_retry)
            .map(|node| node.status)
            .collect();
        if roots.is_empty() || roots.iter().any(|status| !status.is_final()) {
            return Ok(());
        }
        let status = aggregate_status(JoinPolicy::AllSuccess, &roots);
        self.finish_plan(plan_execution_id, status).await?;
        Ok(())
    }

    pub(crate) async fn finish_plan(
        &self,
        plan_execution_id: &str,
        status: Status,
    ) -> EngineResult<bool> {
        match self
            .inner
            .store
            .update_plan_status(plan_execution_id, &Status::non_final(), status)
            .await?
        {
            Some(plan) => {
                info!(plan_execution_id = %plan_execution_id, status = %status, "plan finished");
                self.inner
                    .events
                    .emit(EngineEventKind::Plan(PlanEvent::Completed {
                        plan_execution_id: plan.uuid,
                        status,
                    }));
                Ok(true)
            }
            None => {
                debug!(plan_execution_id = %plan_execution_id, "plan already finished");
                Ok(false)
            }
        }
    }

    /// Cancels outstanding work, then forces `ABORTED`. No end transition.
    pub(crate) async fn abort_node(
        &self,
        node: &NodeExecution,
        effect: Option<InterruptEffect>,
    ) -> EngineResult<Option<NodeExecution>> {
        if node.status.is_final() {
            return Ok(None);
        }
        self.abort_work(node).await;
        let ops = effect
            .into_iter()
            .map(NodeExecutionOp::AddInterruptHistory)
            .collect();
        match self
            .inner
            .store
            .update_node_status_with_ops(&node.uuid, &Status::non_final(), Status::Aborted, ops)
            .await?
        {
            Some(aborted) => {
                self.disarm_timeout(&aborted.uuid);
                self.dispatch(&aborted).await;
                Ok(Some(aborted))
            }
            None => {
                debug!(node_execution_id = %node.uuid, "lost race aborting node");
                Ok(None)
            }
        }
    }

    /// Best effort: failures are logged and never block the local transition.
    pub(crate) async fn abort_work(&self, node: &NodeExecution) {
        let Some(mode) = node.mode.filter(|mode| mode.is_leaf()) else {
            return;
        };
        if !matches!(
            node.status,
            Status::AsyncWaiting | Status::TaskWaiting | Status::ApprovalWaiting | Status::Paused
        ) {
            return;
        }
        if let Err(error) = self.try_abort_work(node).await {
            warn!(
                node_execution_id = %node.uuid,
                mode = mode.as_str(),
                error = %error,
                "abort handler failed"
            );
        }
    }

    async fn try_abort_work(&self, node: &NodeExecution) -> EngineResult<()> {
        let plan = self.inner.plans.plan_for(&node.plan_execution_id).await?;
        let plan_node = plan.require_node(&node.node_id)?;
        let step = self.resolve_step(&plan, node)?;
        let step_ctx = self.step_context(
            node,
            StepInputs {
                overrides: node.additional_inputs.clone(),
                ..StepInputs::default()
            },
        );
        let ctx = StrategyContext {
            step: &step,
            step_ctx: &step_ctx,
            node,
            plan_node,
        };
        self.inner.strategies.for_mode(step.mode()).abort(&ctx).await
    }

    /// Aborts every unfinished descendant of `node_execution_id`, leaves first.
    pub(crate) async fn abort_descendants(
        &self,
        node_execution_id: &str,
        effect: &InterruptEffect,
    ) -> EngineResult<usize> {
        let mut pending = vec![node_execution_id.to_string()];
        let mut found = Vec::new();
        while let Some(id) = pending.pop() {
            for child in self.inner.store.find_all_children_of(&id).await? {
                if child.old_retry {
                    continue;
                }
                pending.push(child.uuid.clone());
                if !child.status.is_final() {
                    found.push(child);
                }
            }
        }
        found.sort_by_key(|node| std::cmp::Reverse(node.ambiance.depth()));
        let mut aborted = 0;
        for child in &found {
            if self.abort_node(child, Some(effect.clone())).await?.is_some() {
                aborted += 1;
            }
        }
        Ok(aborted)
    }

    fn arm_timeout(&self, node: &NodeExecution) {
        let Some(timeout_ms) = node.timeout_ms else {
            return;
        };
        let deadline = node.start_ts.unwrap_or_else(now_ms).saturating_add(timeout_ms);
        let remaining = deadline.saturating_sub(now_ms());
        let weak = Arc::downgrade(&self.inner);
        let plan_execution_id = node.plan_execution_id.clone();
        let node_execution_id = node.uuid.clone();
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(remaining)).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Forget the handle without aborting: this task is the one running.
            if let Ok(mut timers) = inner.timers.lock() {
                timers.remove(&node_execution_id);
            }
            Orchestrator { inner }
                .expire(&plan_execution_id, &node_execution_id)
                .await;
        });
        let previous = match self.inner.timers.lock() {
            Ok(mut timers) => timers.insert(node.uuid.clone(), handle.abort_handle()),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn disarm_timeout(&self, node_execution_id: &str) {
        let handle = match self.inner.timers.lock() {
            Ok(mut timers) => timers.remove(node_execution_id),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn expire(&self, plan_execution_id: &str, node_execution_id: &str) {
        match self.inner.store.get_node_execution(node_execution_id).await {
            Ok(node) if node.status.is_final() || node.old_retry => return,
            Ok(_) => {}
            Err(error) => {
                warn!(
                    node_execution_id = %node_execution_id,
                    error = %error,
                    "timeout lookup failed"
                );
                return;
            }
        }
        info!(node_execution_id = %node_execution_id, "node timed out");
        let metadata = BTreeMap::from([("reason".to_string(), "timeout".to_string())]);
        if let Err(error) = self
            .register_interrupt(
                InterruptType::MarkExpired,
                plan_execution_id,
                Some(node_execution_id),
                Some("timeout"),
                metadata,
            )
            .await
        {
            warn!(
                node_execution_id = %node_execution_id,
                error = %error,
                "expiry interrupt failed"
            );
        }
    }
}
