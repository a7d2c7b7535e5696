use super::{Advise, Adviser, AdvisingEvent, NextNodeParameters, ON_SUCCESS};
use crate::errors::EngineResult;

#[derive(Debug, Default)]
pub struct OnSuccessAdviser;

#[async_trait::async_trait]
impl Adviser for OnSuccessAdviser {
    async fn on_advise_event(&self, event: &AdvisingEvent) -> EngineResult<Option<Advise>> {
        if !event.to_status.is_positive() {
            return Ok(None);
        }
        let parameters: NextNodeParameters = event.parameters(ON_SUCCESS)?;
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
    use serde_json::{Value, json};

    #[tokio::test(flavor = "current_thread")]
    async fn on_success_adviser_ignored_expected_next_step() {
        let advise = OnSuccessAdviser
            .on_advise_event(&event(node("rt", Status::Ignored), json!({"next_node_id": "deploy"})))
            .await
            .expect("advise should succeed");
        assert_eq!(
            advise,
            Some(Advise::NextStep {
                next_node_id: Some("deploy".to_string())
            })
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn on_success_adviser_no_parameters_expected_end_of_branch() {
        let advise = OnSuccessAdviser
            .on_advise_event(&event(node("rt", Status::Succeeded), Value::Null))
            .await
            .expect("advise should succeed");
        assert_eq!(advise, Some(Advise::NextStep { next_node_id: None }));

        let declined = OnSuccessAdviser
            .on_advise_event(&event(node("rt", Status::Failed), Value::Null))
            .await
            .expect("advise should succeed");
        assert!(declined.is_none());
    }
}
