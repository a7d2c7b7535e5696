use super::{Advise, Adviser, AdvisingEvent, RETRY};
use crate::errors::{EngineError, EngineResult};
use conductor_store::{NodeExecutionStore, SharedEngineStore, StoreError};
use serde::Deserialize;
use std::str::FromStr;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RetryAdviserParameters {
    #[serde(default, alias = "retryCount")]
    pub retry_count: usize,
    #[serde(default, alias = "waitIntervalList")]
    pub wait_interval_list: Vec<u64>,
    /// Kept raw so a bad value only fails once retries are spent.
    #[serde(default, alias = "repairActionCodeAfterRetry")]
    pub repair_action_code_after_retry: String,
    #[serde(default, alias = "nextNodeId")]
    pub next_node_id: Option<String>,
}

impl RetryAdviserParameters {
    /// Delay before attempt `retries_so_far + 1`, clamped to the last listed
    /// interval.
    pub fn wait_interval_ms(&self, retries_so_far: usize) -> u64 {
        match self.wait_interval_list.len() {
            0 => 0,
            len => self.wait_interval_list[retries_so_far.min(len - 1)],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairAction {
    ManualIntervention,
    EndExecution,
    Ignore,
}

impl FromStr for RepairAction {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "MANUAL_INTERVENTION" => Ok(Self::ManualIntervention),
            "END_EXECUTION" => Ok(Self::EndExecution),
            "IGNORE" => Ok(Self::Ignore),
            other => Err(EngineError::Configuration(format!(
                "unsupported repair action after retry '{other}'"
            ))),
        }
    }
}

pub struct RetryAdviser {
    store: SharedEngineStore,
}

impl RetryAdviser {
    pub fn new(store: SharedEngineStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Adviser for RetryAdviser {
    async fn on_advise_event(&self, event: &AdvisingEvent) -> EngineResult<Option<Advise>> {
        if !event.to_status.is_broken() {
            return Ok(None);
        }
        let parameters: RetryAdviserParameters = event.parameters(RETRY)?;
        let runtime_id = event
            .node
            .ambiance
            .obtain_current_runtime_id()
            .ok_or_else(|| {
                EngineError::Store(StoreError::InvalidInput(
                    "advising event has an empty ambiance".to_string(),
                ))
            })?;
        let node = self.store.get_node_execution(runtime_id).await?;
        let retries_so_far = node.retry_count();

        if retries_so_far < parameters.retry_count {
            return Ok(Some(Advise::Retry {
                retry_node_execution_id: runtime_id.to_string(),
                wait_interval_ms: parameters.wait_interval_ms(retries_so_far),
            }));
        }
        let advise = match parameters.repair_action_code_after_retry.parse()? {
            RepairAction::ManualIntervention => Advise::InterventionWait,
            RepairAction::EndExecution => Advise::EndPlan,
            RepairAction::Ignore => Advise::NextStep {
                next_node_id: parameters.next_node_id,
            },
        };
        Ok(Some(advise))
    }
}
