use crate::errors::{EngineError, EngineResult};
use crate::notifier::CallbackSender;
use crate::step::TaskRequest;
use conductor_store::ResponseData;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;
use tracing::debug;

#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Accepts the task and returns its id. Completion is reported later by
    /// delivering a response for that id on `callbacks`.
    async fn submit(&self, request: TaskRequest, callbacks: CallbackSender) -> EngineResult<String>;

    async fn abort(&self, task_id: &str) -> EngineResult<()>;
}

pub type SharedTaskExecutor = Arc<dyn TaskExecutor>;

/// Rejects every submission. Installed when no executor is configured.
#[derive(Debug, Default)]
pub struct NoTaskExecutor;

#[async_trait::async_trait]
impl TaskExecutor for NoTaskExecutor {
    async fn submit(
        &self,
        request: TaskRequest,
        _callbacks: CallbackSender,
    ) -> EngineResult<String> {
        Err(EngineError::Configuration(format!(
            "no task executor configured for task type '{}'",
            request.task_type
        )))
    }

    async fn abort(&self, _task_id: &str) -> EngineResult<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, parameters: &Value) -> ResponseData;
}

#[async_trait::async_trait]
impl<F> TaskHandler for F
where
    F: Fn(&Value) -> ResponseData + Send + Sync,
{
    async fn run(&self, parameters: &Value) -> ResponseData {
        self(parameters)
    }
}

/// Runs task handlers on the current Tokio runtime.
#[derive(Default)]
pub struct LocalTaskExecutor {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
    running: Arc<Mutex<BTreeMap<String, AbortHandle>>>,
}

impl LocalTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        mut self,
        task_type: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Self {
        self.handlers.insert(task_type.into(), Arc::new(handler));
        self
    }

    pub fn running_tasks(&self) -> usize {
        self.running.lock().map(|running| running.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl TaskExecutor for LocalTaskExecutor {
    async fn submit(
        &self,
        request: TaskRequest,
        callbacks: CallbackSender,
    ) -> EngineResult<String> {
        let handler = self.handlers.get(&request.task_type).cloned().ok_or_else(|| {
            EngineError::Configuration(format!(
                "no task handler registered for type '{}'",
                request.task_type
            ))
        })?;
        let task_id = uuid::Uuid::new_v4().to_string();
        let running = Arc::clone(&self.running);
        let spawned_id = task_id.clone();
        // Hold the lock across the spawn so the task cannot remove its handle
        // before it was inserted.
        let mut guard = self
            .running
            .lock()
            .map_err(|_| EngineError::Runtime("task registry lock poisoned".to_string()))?;
        let handle = tokio::spawn(async move {
            let data = handler.run(&request.parameters).await;
            if let Ok(mut running) = running.lock() {
                running.remove(&spawned_id);
            }
            if !callbacks.deliver(spawned_id.clone(), data) {
                debug!(task_id = %spawned_id, "task finished after orchestrator shut down");
            }
        });
        guard.insert(task_id.clone(), handle.abort_handle());
        Ok(task_id)
    }

    async fn abort(&self, task_id: &str) -> EngineResult<()> {
        let handle = self
            .running
            .lock()
            .map_err(|_| EngineError::Runtime("task registry lock poisoned".to_string()))?
            .remove(task_id);
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }
}
