use conductor_store::{InterruptState, InterruptType, Status};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: EngineEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EngineEventKind {
    Plan(PlanEvent),
    Node(NodeEvent),
    Interrupt(InterruptEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanEvent {
    Started {
        plan_execution_id: String,
        plan_id: String,
    },
    Paused {
        plan_execution_id: String,
    },
    Resumed {
        plan_execution_id: String,
    },
    Completed {
        plan_execution_id: String,
        status: Status,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    StatusChanged {
        plan_execution_id: String,
        node_execution_id: String,
        node_id: String,
        status: Status,
    },
    AwaitingInput {
        plan_execution_id: String,
        node_execution_id: String,
        node_id: String,
        status: Status,
    },
    Advised {
        plan_execution_id: String,
        node_execution_id: String,
        advise: String,
    },
    Retrying {
        plan_execution_id: String,
        node_execution_id: String,
        retry_node_execution_id: String,
        wait_interval_ms: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterruptEvent {
    Registered {
        plan_execution_id: String,
        interrupt_id: String,
        interrupt_type: InterruptType,
    },
    Processed {
        plan_execution_id: String,
        interrupt_id: String,
        interrupt_type: InterruptType,
        state: InterruptState,
    },
}

pub trait EngineEventObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EngineEventObserver for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event);
    }
}

pub type SharedEngineEventObserver = Arc<dyn EngineEventObserver>;
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Clone, Default)]
pub struct EngineEventSink {
    observer: Option<SharedEngineEventObserver>,
    sender: Option<EngineEventSender>,
    sequence: Arc<AtomicU64>,
}

impl EngineEventSink {
    pub fn with_observer(observer: SharedEngineEventObserver) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    pub fn with_sender(sender: EngineEventSender) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    pub fn observer(mut self, observer: SharedEngineEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: EngineEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, kind: EngineEventKind) {
        if !self.is_enabled() {
            return;
        }
        let event = EngineEvent {
            sequence_no: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: timestamp_now(),
            kind,
        };
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}
