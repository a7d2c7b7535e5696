use crate::errors::EngineResult;
use conductor_store::{
    CorrelationId, ResponseData, SharedEngineStore, WaitInstance, WaitState, WaitStore, now_ms,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq)]
pub struct CallbackDelivery {
    pub correlation_id: CorrelationId,
    pub data: ResponseData,
}

#[derive(Clone, Debug)]
pub struct CallbackSender {
    sender: mpsc::UnboundedSender<CallbackDelivery>,
}

impl CallbackSender {
    /// Returns `false` once the receiving orchestrator is gone.
    pub fn deliver(&self, correlation_id: impl Into<CorrelationId>, data: ResponseData) -> bool {
        self.sender
            .send(CallbackDelivery {
                correlation_id: correlation_id.into(),
                data,
            })
            .is_ok()
    }
}

pub type CallbackReceiver = mpsc::UnboundedReceiver<CallbackDelivery>;

pub fn callback_channel() -> (CallbackSender, CallbackReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (CallbackSender { sender }, receiver)
}

#[derive(Clone)]
pub struct WaitNotifyEngine {
    store: SharedEngineStore,
}

impl WaitNotifyEngine {
    pub fn new(store: SharedEngineStore) -> Self {
        Self { store }
    }

    /// Suspends `node_execution_id` until every id in `correlation_ids` has a
    /// response. Returns the wait right away when all of them already arrived.
    pub async fn wait_for_all(
        &self,
        plan_execution_id: &str,
        node_execution_id: &str,
        correlation_ids: Vec<CorrelationId>,
    ) -> EngineResult<Option<WaitInstance>> {
        let wait = WaitInstance {
            uuid: uuid::Uuid::new_v4().to_string(),
            plan_execution_id: plan_execution_id.to_string(),
            node_execution_id: node_execution_id.to_string(),
            correlation_ids,
            state: WaitState::Waiting,
            created_at: now_ms(),
        };
        Ok(self.store.register_wait(wait).await?)
    }

    /// Records a response; returns waits this response completed.
    pub async fn notify(
        &self,
        correlation_id: &str,
        data: ResponseData,
    ) -> EngineResult<Vec<WaitInstance>> {
        Ok(self.store.record_response(correlation_id, data).await?)
    }

    /// Single-winner hand-off of a ready wait to whoever resumes the node.
    pub async fn claim(&self, wait: &WaitInstance) -> EngineResult<bool> {
        Ok(self.store.claim_wait(&wait.uuid).await?)
    }

    pub async fn responses(
        &self,
        wait: &WaitInstance,
    ) -> EngineResult<BTreeMap<CorrelationId, ResponseData>> {
        Ok(self.store.fetch_responses(&wait.correlation_ids).await?)
    }

    pub async fn ready_waits(&self, plan_execution_id: &str) -> EngineResult<Vec<WaitInstance>> {
        Ok(self.store.fetch_ready_waits(plan_execution_id).await?)
    }
}
