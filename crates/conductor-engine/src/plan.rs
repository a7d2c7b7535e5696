use crate::errors::{EngineError, EngineResult};
use conductor_store::ExecutionMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub start_node_id: String,
    pub nodes: Vec<PlanNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub uuid: String,
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    pub step_type: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub step_parameters: Value,
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,
    #[serde(default)]
    pub ref_objects: Vec<RefObject>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    pub adviser_type: String,
    #[serde(default)]
    pub parameters: Value,
}

/// A sweeping output a node reads before it runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefObject {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
}

impl RefObject {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
        }
    }
}

impl PlanNode {
    pub fn new(
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            identifier: identifier.into(),
            name: None,
            step_type: step_type.into(),
            group: None,
            mode: None,
            step_parameters: Value::Null,
            advisers: Vec::new(),
            ref_objects: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn with_parameters(mut self, step_parameters: Value) -> Self {
        self.step_parameters = step_parameters;
        self
    }

    pub fn with_adviser(mut self, adviser_type: impl Into<String>, parameters: Value) -> Self {
        self.advisers.push(AdviserObtainment {
            adviser_type: adviser_type.into(),
            parameters,
        });
        self
    }

    pub fn with_ref_object(mut self, ref_object: RefObject) -> Self {
        self.ref_objects.push(ref_object);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

impl Plan {
    pub fn new(plan_id: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            start_node_id: start_node_id.into(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|node| node.uuid == node_id)
    }

    pub fn require_node(&self, node_id: &str) -> EngineResult<&PlanNode> {
        self.node(node_id).ok_or_else(|| {
            EngineError::InvalidPlan(format!(
                "plan '{}' has no node '{node_id}'",
                self.plan_id
            ))
        })
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::InvalidPlan(format!(
                "plan '{}' has no nodes",
                self.plan_id
            )));
        }
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if node.uuid.trim().is_empty() {
                return Err(EngineError::InvalidPlan(
                    "node uuid must not be empty".to_string(),
                ));
            }
            if !seen.insert(node.uuid.as_str()) {
                return Err(EngineError::InvalidPlan(format!(
                    "duplicate node uuid '{}'",
                    node.uuid
                )));
            }
            if node.step_type.trim().is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "node '{}' has no step type",
                    node.uuid
                )));
            }
            let mut refs = BTreeSet::new();
            for ref_object in &node.ref_objects {
                if !refs.insert(ref_object.name.as_str()) {
                    return Err(EngineError::InvalidPlan(format!(
                        "node '{}' references output '{}' twice",
                        node.uuid, ref_object.name
                    )));
                }
            }
        }
        self.require_node(&self.start_node_id)?;
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait PlanDefinitionProvider: Send + Sync {
    async fn plan_for(&self, plan_execution_id: &str) -> EngineResult<Arc<Plan>>;
}

pub type SharedPlanProvider = Arc<dyn PlanDefinitionProvider>;

#[derive(Default)]
pub struct InMemoryPlanProvider {
    plans: RwLock<BTreeMap<String, Arc<Plan>>>,
}

impl InMemoryPlanProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, plan_execution_id: impl Into<String>, plan: Plan) -> EngineResult<()> {
        plan.validate()?;
        self.plans
            .write()
            .map_err(|_| EngineError::Runtime("plan provider lock poisoned".to_string()))?
            .insert(plan_execution_id.into(), Arc::new(plan));
        Ok(())
    }
}

#[async_trait::async_trait]
impl PlanDefinitionProvider for InMemoryPlanProvider {
    async fn plan_for(&self, plan_execution_id: &str) -> EngineResult<Arc<Plan>> {
        self.plans
            .read()
            .map_err(|_| EngineError::Runtime("plan provider lock poisoned".to_string()))?
            .get(plan_execution_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::InvalidPlan(format!(
                    "no plan registered for execution '{plan_execution_id}'"
                ))
            })
    }
}

/// Plans stored as `<root>/plans/<plan_execution_id>.json`, readable by any
/// process that opens the same directory.
#[derive(Clone, Debug)]
pub struct FsPlanProvider {
    root: PathBuf,
}

impl FsPlanProvider {
    pub fn new<P: AsRef<Path>>(root: P) -> EngineResult<Self> {
        let root = root.as_ref().join("plans");
        fs::create_dir_all(&root)
            .map_err(|err| EngineError::Runtime(format!("create plan directory failed: {err}")))?;
        Ok(Self { root })
    }

    pub fn insert(&self, plan_execution_id: &str, plan: &Plan) -> EngineResult<()> {
        plan.validate()?;
        let raw = serde_json::to_vec_pretty(plan)
            .map_err(|err| EngineError::Runtime(format!("serialize plan failed: {err}")))?;
        fs::write(self.path_for(plan_execution_id)?, raw)
            .map_err(|err| EngineError::Runtime(format!("write plan failed: {err}")))
    }

    fn path_for(&self, plan_execution_id: &str) -> EngineResult<PathBuf> {
        let safe = !plan_execution_id.is_empty()
            && plan_execution_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !safe {
            return Err(EngineError::InvalidPlan(format!(
                "plan execution id '{plan_execution_id}' is not a valid file name"
            )));
        }
        Ok(self.root.join(format!("{plan_execution_id}.json")))
    }
}

#[async_trait::async_trait]
impl PlanDefinitionProvider for FsPlanProvider {
    async fn plan_for(&self, plan_execution_id: &str) -> EngineResult<Arc<Plan>> {
        let path = self.path_for(plan_execution_id)?;
        let raw = fs::read(&path).map_err(|err| {
            EngineError::InvalidPlan(format!(
                "no plan stored for execution '{plan_execution_id}': {err}"
            ))
        })?;
        let plan: Plan = serde_json::from_slice(&raw)
            .map_err(|err| EngineError::InvalidPlan(format!("plan document is invalid: {err}")))?;
        Ok(Arc::new(plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan() -> Plan {
        Plan::new("demo", "a")
            .with_node(PlanNode::new("a", "first", "noop"))
            .with_node(
                PlanNode::new("b", "second", "noop")
                    .with_adviser("ON_SUCCESS", json!({"next_node_id": null})),
            )
    }

    #[test]
    fn validate_missing_start_node_expected_invalid_plan() {
        let plan = Plan::new("demo", "missing").with_node(PlanNode::new("a", "a", "noop"));
        let error = plan.validate().expect_err("missing start node should fail");
        assert!(matches!(error, EngineError::InvalidPlan(_)));
    }

    #[test]
    fn validate_duplicate_node_expected_invalid_plan() {
        let plan = sample_plan().with_node(PlanNode::new("a", "again", "noop"));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn plan_document_deserialize_expected_defaults_applied() {
        let plan: Plan = serde_json::from_value(json!({
            "plan_id": "demo",
            "start_node_id": "a",
            "nodes": [{"uuid": "a", "identifier": "a", "step_type": "noop", "mode": "CHILD_CHAIN"}]
        }))
        .expect("plan should parse");
        let node = plan.node("a").expect("node a");
        assert_eq!(node.mode, Some(ExecutionMode::ChildChain));
        assert!(node.advisers.is_empty());
        assert_eq!(node.step_parameters, Value::Null);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fs_plan_provider_insert_then_read_expected_same_plan() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let provider = FsPlanProvider::new(temp.path()).expect("provider should open");
        provider
            .insert("pe-1", &sample_plan())
            .expect("plan should be stored");

        let reopened = FsPlanProvider::new(temp.path()).expect("provider should reopen");
        let plan = reopened.plan_for("pe-1").await.expect("plan should load");
        assert_eq!(*plan, sample_plan());
        assert!(reopened.plan_for("../etc").await.is_err());
    }
}
