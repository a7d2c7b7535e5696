use super::{Advise, Adviser, AdvisingEvent, MANUAL_INTERVENTION};
use crate::errors::EngineResult;
use conductor_store::FailureType;
use serde::Deserialize;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct ManualInterventionParameters {
    /// Empty means every failure type applies.
    #[serde(default, alias = "applicableFailureTypes")]
    applicable_failure_types: Vec<FailureType>,
}

/// Parks broken nodes in `INTERVENTION_WAITING` until an operator interrupt.
#[derive(Debug, Default)]
pub struct ManualInterventionAdviser;

#[async_trait::async_trait]
impl Adviser for ManualInterventionAdviser {
    async fn on_advise_event(&self, event: &AdvisingEvent) -> EngineResult<Option<Advise>> {
        if !event.to_status.is_broken() {
            return Ok(None);
        }
        let parameters: ManualInterventionParameters = event.parameters(MANUAL_INTERVENTION)?;
        if !parameters.applicable_failure_types.is_empty() {
            let node_types = event
                .node
                .failure_info
                .as_ref()
                .map(|info| info.failure_types.as_slice())
                .unwrap_or_default();
            let applies = node_types
                .iter()
                .any(|kind| parameters.applicable_failure_types.contains(kind));
            if !applies {
                return Ok(None);
            }
        }
        Ok(Some(Advise::InterventionWait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisers::test_support::{event, node};
    use conductor_store::{FailureInfo, Status};
    use serde_json::{Value, json};

    #[tokio::test(flavor = "current_thread")]
    async fn manual_adviser_failure_type_filter_expected_only_matching_types() {
        let mut timed_out = node("rt", Status::Expired);
        timed_out.failure_info = Some(FailureInfo::new("late", FailureType::Timeout));
        let parameters = json!({"applicable_failure_types": ["APPLICATION"]});

        let declined = ManualInterventionAdviser
            .on_advise_event(&event(timed_out.clone(), parameters.clone()))
            .await
            .expect("advise should succeed");
        assert!(declined.is_none());

        timed_out.failure_info = Some(FailureInfo::new("bug", FailureType::Application));
        let advise = ManualInterventionAdviser
            .on_advise_event(&event(timed_out, parameters))
            .await
            .expect("advise should succeed");
        assert_eq!(advise, Some(Advise::InterventionWait));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manual_adviser_no_filter_expected_any_broken_status() {
        let advise = ManualInterventionAdviser
            .on_advise_event(&event(node("rt", Status::Errored), Value::Null))
            .await
            .expect("advise should succeed");
        assert_eq!(advise, Some(Advise::InterventionWait));
    }
}
