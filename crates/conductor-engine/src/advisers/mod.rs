mod manual;
mod on_fail;
mod on_success;
mod retry;

pub use manual::ManualInterventionAdviser;
pub use on_fail::OnFailAdviser;
pub use on_success::OnSuccessAdviser;
pub use retry::{RepairAction, RetryAdviser, RetryAdviserParameters};

use crate::errors::{EngineError, EngineResult};
use conductor_store::{NodeExecution, SharedEngineStore, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const RETRY: &str = "RETRY";
pub const ON_FAIL: &str = "ON_FAIL";
pub const ON_SUCCESS: &str = "ON_SUCCESS";
pub const MANUAL_INTERVENTION: &str = "MANUAL_INTERVENTION";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Advise {
    Retry {
        retry_node_execution_id: String,
        wait_interval_ms: u64,
    },
    NextStep {
        #[serde(default)]
        next_node_id: Option<String>,
    },
    InterventionWait,
    EndPlan,
}

impl Advise {
    pub fn label(&self) -> &'static str {
        match self {
            Advise::Retry { .. } => "RETRY",
            Advise::NextStep { .. } => "NEXT_STEP",
            Advise::InterventionWait => "INTERVENTION_WAIT",
            Advise::EndPlan => "END_PLAN",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdvisingEvent {
    pub node: NodeExecution,
    pub to_status: Status,
    pub adviser_parameters: Value,
}

impl AdvisingEvent {
    pub(crate) fn parameters<T: serde::de::DeserializeOwned + Default>(
        &self,
        adviser_type: &str,
    ) -> EngineResult<T> {
        if self.adviser_parameters.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.adviser_parameters.clone()).map_err(|err| {
            EngineError::Configuration(format!("invalid {adviser_type} adviser parameters: {err}"))
        })
    }
}

#[async_trait::async_trait]
pub trait Adviser: Send + Sync {
    /// `Ok(None)` declines; the next adviser in the chain is asked.
    async fn on_advise_event(&self, event: &AdvisingEvent) -> EngineResult<Option<Advise>>;
}

/// Next-node parameters shared by the routing advisers.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub(crate) struct NextNodeParameters {
    #[serde(default)]
    pub next_node_id: Option<String>,
}

/// Immutable adviser-type lookup built once at startup.
#[derive(Clone, Default)]
pub struct AdviserRegistry {
    advisers: Arc<BTreeMap<String, Arc<dyn Adviser>>>,
}

impl AdviserRegistry {
    pub fn builder() -> AdviserRegistryBuilder {
        AdviserRegistryBuilder::default()
    }

    /// The four built-in advisers.
    pub fn standard(store: SharedEngineStore) -> Self {
        Self::standard_builder(store).build()
    }

    /// The built-ins, open for additional registrations.
    pub fn standard_builder(store: SharedEngineStore) -> AdviserRegistryBuilder {
        AdviserRegistryBuilder::default()
            .insert(RETRY, RetryAdviser::new(store))
            .insert(ON_FAIL, OnFailAdviser)
            .insert(ON_SUCCESS, OnSuccessAdviser)
            .insert(MANUAL_INTERVENTION, ManualInterventionAdviser)
    }

    pub fn get(&self, adviser_type: &str) -> EngineResult<&Arc<dyn Adviser>> {
        self.advisers.get(adviser_type).ok_or_else(|| {
            EngineError::Configuration(format!("no adviser registered for type '{adviser_type}'"))
        })
    }

    pub fn adviser_types(&self) -> impl Iterator<Item = &str> {
        self.advisers.keys().map(String::as_str)
    }
}

#[derive(Default)]
pub struct AdviserRegistryBuilder {
    advisers: BTreeMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistryBuilder {
    fn insert(mut self, adviser_type: &str, adviser: impl Adviser + 'static) -> Self {
        self.advisers
            .insert(adviser_type.to_string(), Arc::new(adviser));
        self
    }

    pub fn register(
        mut self,
        adviser_type: impl Into<String>,
        adviser: impl Adviser + 'static,
    ) -> EngineResult<Self> {
        let adviser_type = adviser_type.into();
        if self.advisers.contains_key(&adviser_type) {
            return Err(EngineError::Configuration(format!(
                "adviser type '{adviser_type}' registered twice"
            )));
        }
        self.advisers.insert(adviser_type, Arc::new(adviser));
        Ok(self)
    }

    pub fn build(self) -> AdviserRegistry {
        AdviserRegistry {
            advisers: Arc::new(self.advisers),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use conductor_store::{Ambiance, Level};

    pub fn node(runtime_id: &str, status: Status) -> NodeExecution {
        let ambiance = Ambiance::new("plan-1", BTreeMap::new())
            .derive_child(Level::new(runtime_id, "setup-a", "noop"));
        let mut node = NodeExecution::queued(ambiance, "a", Value::Null).expect("node has a level");
        node.status = status;
        node
    }

    pub fn event(node: NodeExecution, parameters: Value) -> AdvisingEvent {
        AdvisingEvent {
            to_status: node.status,
            node,
            adviser_parameters: parameters,
        }
    }
}
