use crate::errors::EngineResult;
use crate::events::{EngineEventKind, EngineEventSink, InterruptEvent, NodeEvent};
use conductor_store::{
    InterruptState, InterruptStore, InterruptType, NodeExecution, SharedEngineStore, Status,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct NodeUpdateInfo {
    pub node_execution: NodeExecution,
    pub status: Status,
}

impl From<&NodeExecution> for NodeUpdateInfo {
    fn from(node: &NodeExecution) -> Self {
        Self {
            status: node.status,
            node_execution: node.clone(),
        }
    }
}

/// Moves `PROCESSING` interrupts to a processed state.
#[derive(Clone)]
pub struct InterruptCloser {
    store: SharedEngineStore,
    events: EngineEventSink,
}

impl InterruptCloser {
    pub fn new(store: SharedEngineStore, events: EngineEventSink) -> Self {
        Self { store, events }
    }

    /// `false` when the interrupt was not open.
    pub async fn close(&self, interrupt_id: &str, state: InterruptState) -> EngineResult<bool> {
        let Some(interrupt) = self
            .store
            .update_interrupt_state(interrupt_id, &[InterruptState::Processing], state)
            .await?
        else {
            return Ok(false);
        };
        self.events
            .emit(EngineEventKind::Interrupt(InterruptEvent::Processed {
                plan_execution_id: interrupt.plan_execution_id,
                interrupt_id: interrupt.uuid,
                interrupt_type: interrupt.interrupt_type,
                state,
            }));
        Ok(true)
    }
}

pub struct DispatchContext<'a> {
    pub interrupts: &'a InterruptCloser,
    pub events: &'a EngineEventSink,
}

#[async_trait::async_trait]
pub trait NodeStatusHandler: Send + Sync {
    async fn handle(&self, ctx: &DispatchContext<'_>, info: &NodeUpdateInfo) -> EngineResult<()>;
}

/// Emits `AwaitingInput` for nodes parked on a human.
#[derive(Debug, Default)]
pub struct AwaitingInputHandler;

#[async_trait::async_trait]
impl NodeStatusHandler for AwaitingInputHandler {
    async fn handle(&self, ctx: &DispatchContext<'_>, info: &NodeUpdateInfo) -> EngineResult<()> {
        let node = &info.node_execution;
        info!(
            plan_execution_id = %node.plan_execution_id,
            node_execution_id = %node.uuid,
            status = %info.status,
            "node awaiting input"
        );
        ctx.events.emit(EngineEventKind::Node(NodeEvent::AwaitingInput {
            plan_execution_id: node.plan_execution_id.clone(),
            node_execution_id: node.uuid.clone(),
            node_id: node.node_id.clone(),
            status: info.status,
        }));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PausedHandler;

#[async_trait::async_trait]
impl NodeStatusHandler for PausedHandler {
    async fn handle(&self, _ctx: &DispatchContext<'_>, info: &NodeUpdateInfo) -> EngineResult<()> {
        info!(
            plan_execution_id = %info.node_execution.plan_execution_id,
            node_execution_id = %info.node_execution.uuid,
            "node paused"
        );
        Ok(())
    }
}

/// A node moved back to `QUEUED` by a resume.
#[derive(Debug, Default)]
pub struct ResumeHandler;

#[async_trait::async_trait]
impl NodeStatusHandler for ResumeHandler {
    async fn handle(&self, _ctx: &DispatchContext<'_>, info: &NodeUpdateInfo) -> EngineResult<()> {
        debug!(
            node_execution_id = %info.node_execution.uuid,
            "node requeued"
        );
        Ok(())
    }
}

/// Closes the RETRY interrupts that produced this attempt.
#[derive(Debug, Default)]
pub struct TerminalHandler;

#[async_trait::async_trait]
impl NodeStatusHandler for TerminalHandler {
    async fn handle(&self, ctx: &DispatchContext<'_>, info: &NodeUpdateInfo) -> EngineResult<()> {
        for effect in &info.node_execution.interrupt_histories {
            if effect.interrupt_type != InterruptType::Retry {
                continue;
            }
            if ctx
                .interrupts
                .close(&effect.interrupt_id, InterruptState::ProcessedSuccessfully)
                .await?
            {
                debug!(
                    interrupt_id = %effect.interrupt_id,
                    node_execution_id = %info.node_execution.uuid,
                    "retry interrupt closed"
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct AbortedHandler;

#[async_trait::async_trait]
impl NodeStatusHandler for AbortedHandler {
    async fn handle(&self, ctx: &DispatchContext<'_>, info: &NodeUpdateInfo) -> EngineResult<()> {
        info!(
            plan_execution_id = %info.node_execution.plan_execution_id,
            node_execution_id = %info.node_execution.uuid,
            "node aborted"
        );
        TerminalHandler.handle(ctx, info).await
    }
}

pub struct NodeStatusUpdateDispatcher {
    handlers: BTreeMap<Status, Arc<dyn NodeStatusHandler>>,
    closer: InterruptCloser,
    events: EngineEventSink,
}

impl NodeStatusUpdateDispatcher {
    pub fn new(closer: InterruptCloser, events: EngineEventSink) -> Self {
        Self {
            handlers: BTreeMap::new(),
            closer,
            events,
        }
    }

    pub fn standard(closer: InterruptCloser, events: EngineEventSink) -> Self {
        let terminal: Arc<dyn NodeStatusHandler> = Arc::new(TerminalHandler);
        let awaiting: Arc<dyn NodeStatusHandler> = Arc::new(AwaitingInputHandler);
        let mut dispatcher = Self::new(closer, events)
            .with_handler(Status::ApprovalWaiting, Arc::clone(&awaiting))
            .with_handler(Status::InterventionWaiting, awaiting)
            .with_handler(Status::Paused, Arc::new(PausedHandler))
            .with_handler(Status::Queued, Arc::new(ResumeHandler))
            .with_handler(Status::Aborted, Arc::new(AbortedHandler));
        for status in [
            Status::Succeeded,
            Status::Failed,
            Status::Errored,
            Status::Expired,
            Status::Ignored,
        ] {
            dispatcher = dispatcher.with_handler(status, Arc::clone(&terminal));
        }
        dispatcher
    }

    pub fn with_handler(mut self, status: Status, handler: Arc<dyn NodeStatusHandler>) -> Self {
        self.handlers.insert(status, handler);
        self
    }

    pub fn closer(&self) -> &InterruptCloser {
        &self.closer
    }

    /// Handler failures are logged, never returned: a broken observer must not
    /// undo a committed transition.
    pub async fn dispatch(&self, info: NodeUpdateInfo) {
        let node = &info.node_execution;
        self.events.emit(EngineEventKind::Node(NodeEvent::StatusChanged {
            plan_execution_id: node.plan_execution_id.clone(),
            node_execution_id: node.uuid.clone(),
            node_id: node.node_id.clone(),
            status: info.status,
        }));
        let Some(handler) = self.handlers.get(&info.status) else {
            return;
        };
        let ctx = DispatchContext {
            interrupts: &self.closer,
            events: &self.events,
        };
        if let Err(error) = handler.handle(&ctx, &info).await {
            warn!(
                node_execution_id = %node.uuid,
                status = %info.status,
                error = %error,
                "node status handler failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EngineEvent, engine_event_channel};
    use conductor_store::{
        Ambiance, Interrupt, InterruptEffect, Level, MemoryStore, now_ms,
    };
    use serde_json::Value;

    fn node(status: Status) -> NodeExecution {
        let ambiance = Ambiance::new("plan-1", BTreeMap::new())
            .derive_child(Level::new("rt-1", "a", "noop"));
        let mut node = NodeExecution::queued(ambiance, "a", Value::Null).expect("node has a level");
        node.status = status;
        node
    }

    fn drain(rx: &mut crate::events::EngineEventReceiver) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dispatch_approval_waiting_expected_status_and_awaiting_input_events() {
        let (tx, mut rx) = engine_event_channel();
        let events = EngineEventSink::with_sender(tx);
        let closer = InterruptCloser::new(Arc::new(MemoryStore::new()), events.clone());
        let dispatcher = NodeStatusUpdateDispatcher::standard(closer, events);

        dispatcher
            .dispatch(NodeUpdateInfo::from(&node(Status::ApprovalWaiting)))
            .await;
        dispatcher
            .dispatch(NodeUpdateInfo::from(&node(Status::Running)))
            .await;

        let kinds: Vec<_> = drain(&mut rx).into_iter().map(|event| event.kind).collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(
            kinds[1],
            EngineEventKind::Node(NodeEvent::AwaitingInput {
                status: Status::ApprovalWaiting,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dispatch_terminal_with_retry_history_expected_interrupt_closed_once() {
        let store = Arc::new(MemoryStore::new());
        let now = now_ms();
        store
            .save_interrupt(Interrupt {
                uuid: "int-1".to_string(),
                interrupt_type: InterruptType::Retry,
                plan_execution_id: "plan-1".to_string(),
                node_execution_id: Some("rt-0".to_string()),
                state: InterruptState::Processing,
                created_at: now,
                last_updated_at: now,
                issued_by: None,
                metadata: BTreeMap::new(),
            })
            .await
            .expect("save should succeed");
        let (tx, mut rx) = engine_event_channel();
        let events = EngineEventSink::with_sender(tx);
        let closer = InterruptCloser::new(store.clone(), events.clone());
        let dispatcher = NodeStatusUpdateDispatcher::standard(closer, events);

        let mut finished = node(Status::Succeeded);
        finished.interrupt_histories.push(InterruptEffect {
            interrupt_id: "int-1".to_string(),
            interrupt_type: InterruptType::Retry,
            took_effect_at: now,
        });
        dispatcher.dispatch(NodeUpdateInfo::from(&finished)).await;
        dispatcher.dispatch(NodeUpdateInfo::from(&finished)).await;

        let interrupt = store.get_interrupt("int-1").await.expect("interrupt exists");
        assert_eq!(interrupt.state, InterruptState::ProcessedSuccessfully);
        let processed = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event.kind, EngineEventKind::Interrupt(_)))
            .count();
        assert_eq!(processed, 1);
    }
}
