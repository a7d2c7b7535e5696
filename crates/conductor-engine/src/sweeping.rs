use crate::errors::{EngineError, EngineResult};
use crate::plan::RefObject;
use conductor_store::{
    Ambiance, SharedEngineStore, StoreError, SweepingOutputInstance, SweepingOutputStore, now_ms,
};
use serde_json::Value;

/// Write-once outputs scoped by level path, resolved nearest ancestor first.
#[derive(Clone)]
pub struct SweepingOutputService {
    store: SharedEngineStore,
    ttl_ms: u64,
}

impl SweepingOutputService {
    pub fn new(store: SharedEngineStore, ttl_ms: u64) -> Self {
        Self { store, ttl_ms }
    }

    /// Publishes `name` at the current level, or at the nearest level of
    /// `group_name` when one is given. Returns the stored instance id.
    pub async fn consume(
        &self,
        ambiance: &Ambiance,
        name: &str,
        value: Value,
        group_name: Option<&str>,
    ) -> EngineResult<String> {
        let scope = match group_name {
            Some(group) => ambiance.prefix_for_group(group).ok_or_else(|| {
                EngineError::Store(StoreError::InvalidInput(format!(
                    "no level of group '{group}' above this node for output '{name}'"
                )))
            })?,
            None => ambiance.clone(),
        };
        let created_at = now_ms();
        let instance = SweepingOutputInstance {
            uuid: uuid::Uuid::new_v4().to_string(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            level_runtime_id_idx: scope.level_runtime_id_idx(),
            name: name.to_string(),
            group_name: group_name.map(str::to_string),
            value,
            created_at,
            valid_until: created_at.saturating_add(self.ttl_ms),
        };
        let uuid = instance.uuid.clone();
        self.store.insert_output(instance).await?;
        Ok(uuid)
    }

    pub async fn resolve(
        &self,
        ambiance: &Ambiance,
        ref_object: &RefObject,
    ) -> EngineResult<Value> {
        self.resolve_optional(ambiance, ref_object)
            .await?
            .ok_or_else(|| {
                EngineError::Store(StoreError::OutputNotFound {
                    name: ref_object.name.clone(),
                })
            })
    }

    pub async fn resolve_optional(
        &self,
        ambiance: &Ambiance,
        ref_object: &RefObject,
    ) -> EngineResult<Option<Value>> {
        let idxs = ambiance.ancestor_runtime_id_idxs();
        let candidates = self
            .store
            .find_outputs(&ambiance.plan_execution_id, &idxs, &ref_object.name)
            .await?;
        let now = now_ms();
        // `idxs` is ordered nearest first, so the first hit shadows the rest.
        Ok(idxs.iter().find_map(|idx| {
            candidates
                .iter()
                .find(|output| &output.level_runtime_id_idx == idx && output.valid_until > now)
                .map(|output| output.value.clone())
        }))
    }
}
