use super::{Advise, Adviser, AdvisingEvent, NextNodeParameters, ON_FAIL};
use crate::errors::EngineResult;

/// Routes broken nodes to `next_node_id`.
#[derive(Debug, Default)]
pub struct OnFailAdviser;

#[async_trait::async_trait]
impl Adviser for OnFailAdviser {
    async fn on_advise_event(&self, event: &AdvisingEvent) -> EngineResult<Option<Advise>> {
        if !event.to_status.is_broken() {
            return Ok(None);
        }
        let parameters: NextNodeParameters = event.parameters(ON_FAIL)?;
        Ok(Some(Advise::NextStep {
            next_node_id: parameters.next_node_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisers::test_support::{event, node};
    use conductor_store::Status;
    use serde_json::json;

    #[tokio::test(flavor = "current_thread")]
    async fn on_fail_adviser_failed_expected_next_step_and_success_declined() {
        let advise = OnFailAdviser
            .on_advise_event(&event(
                node("rt", Status::Expired),
                json!({"next_node_id": "cleanup"}),
            ))
            .await
            .expect("advise should succeed");
        assert_eq!(
            advise,
            Some(Advise::NextStep {
                next_node_id: Some("cleanup".to_string())
            })
        );

        let declined = OnFailAdviser
            .on_advise_event(&event(node("rt", Status::Succeeded), json!({"next_node_id": "x"})))
            .await
            .expect("advise should succeed");
        assert!(declined.is_none());
    }
}
