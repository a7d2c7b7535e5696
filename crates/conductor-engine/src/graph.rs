use crate::errors::EngineResult;
use crate::orchestrator::Orchestrator;
use conductor_store::{
    ExecutionMode, FailureInfo, InterruptEffect, NodeExecution, NodeExecutionStore, Outcomes,
    PlanExecution, PlanExecutionStore, SharedEngineStore, Status, SweepingOutputInstance,
    SweepingOutputStore,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GraphVertex {
    pub uuid: String,
    pub plan_node_id: String,
    pub identifier: String,
    pub step_type: String,
    pub status: Status,
    pub mode: Option<ExecutionMode>,
    pub start_ts: Option<u64>,
    pub end_ts: Option<u64>,
    pub retry_ids: Vec<String>,
    pub old_retry: bool,
    pub parent_id: Option<String>,
    pub previous_id: Option<String>,
    pub next_id: Option<String>,
    pub outcomes: Outcomes,
    pub failure_info: Option<FailureInfo>,
    pub interrupt_histories: Vec<InterruptEffect>,
    /// Sweeping outputs published at this node's own level.
    pub outputs: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrchestrationGraph {
    pub plan_execution_id: String,
    pub plan_id: String,
    pub status: Status,
    pub start_ts: Option<u64>,
    pub end_ts: Option<u64>,
    /// Root-level vertices in execution order.
    pub root_ids: Vec<String>,
    pub vertices: BTreeMap<String, GraphVertex>,
    /// Parent id to its children, in creation order.
    pub adjacency: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GraphOptions {
    /// Superseded attempts are hidden unless set.
    pub include_old_retries: bool,
}

impl OrchestrationGraph {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn vertex(&self, uuid: &str) -> Option<&GraphVertex> {
        self.vertices.get(uuid)
    }

    pub fn vertices_for(&self, plan_node_id: &str) -> impl Iterator<Item = &GraphVertex> {
        self.vertices
            .values()
            .filter(move |vertex| vertex.plan_node_id == plan_node_id)
    }
}

pub async fn load_graph(
    store: &SharedEngineStore,
    plan_execution_id: &str,
    options: GraphOptions,
) -> EngineResult<OrchestrationGraph> {
    let plan = store.get_plan_execution(plan_execution_id).await?;
    let nodes = store.fetch_node_executions(plan_execution_id).await?;
    let outputs = store.fetch_outputs(plan_execution_id).await?;
    Ok(build_graph(&plan, nodes, &outputs, options))
}

pub fn build_graph(
    plan: &PlanExecution,
    mut nodes: Vec<NodeExecution>,
    outputs: &[SweepingOutputInstance],
    options: GraphOptions,
) -> OrchestrationGraph {
    nodes.retain(|node| options.include_old_retries || !node.old_retry);
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.uuid.cmp(&b.uuid)));

    let mut by_level: BTreeMap<&str, BTreeMap<String, Value>> = BTreeMap::new();
    for output in outputs {
        by_level
            .entry(output.level_runtime_id_idx.as_str())
            .or_default()
            .insert(output.name.clone(), output.value.clone());
    }

    let mut graph = OrchestrationGraph {
        plan_execution_id: plan.uuid.clone(),
        plan_id: plan.plan_id.clone(),
        status: plan.status,
        start_ts: plan.start_ts,
        end_ts: plan.end_ts,
        root_ids: Vec::new(),
        vertices: BTreeMap::new(),
        adjacency: BTreeMap::new(),
    };
    for node in nodes {
        match &node.parent_id {
            Some(parent_id) => graph
                .adjacency
                .entry(parent_id.clone())
                .or_default()
                .push(node.uuid.clone()),
            None => graph.root_ids.push(node.uuid.clone()),
        }
        let outputs = by_level
            .get(node.ambiance.level_runtime_id_idx().as_str())
            .cloned()
            .unwrap_or_default();
        graph.vertices.insert(
            node.uuid.clone(),
            GraphVertex {
                plan_node_id: node.node_id,
                identifier: node.identifier,
                step_type: node.step_type,
                status: node.status,
                mode: node.mode,
                start_ts: node.start_ts,
                end_ts: node.end_ts,
                retry_ids: node.retry_ids,
                old_retry: node.old_retry,
                parent_id: node.parent_id,
                previous_id: node.previous_id,
                next_id: node.next_id,
                outcomes: node.outcomes,
                failure_info: node.failure_info,
                interrupt_histories: node.interrupt_histories,
                outputs,
                uuid: node.uuid,
            },
        );
    }
    graph
}

impl Orchestrator {
    pub async fn get_graph(&self, plan_execution_id: &str) -> EngineResult<OrchestrationGraph> {
        self.get_graph_with(plan_execution_id, GraphOptions::default())
            .await
    }

    pub async fn get_graph_with(
        &self,
        plan_execution_id: &str,
        options: GraphOptions,
    ) -> EngineResult<OrchestrationGraph> {
        load_graph(&self.inner.store, plan_execution_id, options).await
    }
}
