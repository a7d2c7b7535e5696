use conductor_store::{ExecutionMode, FailureInfo, FailureType, Status, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no step registered for type '{0}'")]
    UnknownStep(String),
    #[error(
        "step type '{step_type}' is registered as {actual:?} but the plan expects {expected:?}"
    )]
    ModeMismatch {
        step_type: String,
        expected: ExecutionMode,
        actual: ExecutionMode,
    },
    #[error("invalid interrupt: {0}")]
    InvalidInterrupt(String),
    #[error("step failed: {0}")]
    Step(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn step(message: impl Into<String>) -> Self {
        Self::Step(message.into())
    }

    pub fn failure_type(&self) -> FailureType {
        match self {
            EngineError::Store(
                StoreError::DuplicateOutput { .. }
                | StoreError::OutputNotFound { .. }
                | StoreError::NotFound { .. }
                | StoreError::DuplicateKey { .. },
            ) => FailureType::DataIntegrity,
            EngineError::Store(_) | EngineError::Runtime(_) => FailureType::Unknown,
            EngineError::InvalidPlan(_)
            | EngineError::Configuration(_)
            | EngineError::UnknownStep(_)
            | EngineError::ModeMismatch { .. }
            | EngineError::InvalidInterrupt(_) => FailureType::Configuration,
            EngineError::Step(_) => FailureType::Application,
        }
    }

    /// Status a node takes when this error escapes its step.
    pub fn failure_status(&self) -> Status {
        match self.failure_type() {
            FailureType::Application | FailureType::DataIntegrity | FailureType::Timeout => {
                Status::Failed
            }
            FailureType::Configuration | FailureType::Unknown => Status::Errored,
        }
    }

    pub fn failure_info(&self) -> FailureInfo {
        FailureInfo::new(self.to_string(), self.failure_type())
    }
}
