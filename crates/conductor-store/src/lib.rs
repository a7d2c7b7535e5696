pub mod ambiance;
pub mod fs;
pub mod memory;
pub mod status;
pub mod store;
pub mod types;

pub use ambiance::{Ambiance, Level, level_runtime_id_idx};
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use status::Status;
pub use store::{
    EngineStore, InterruptStore, MaintenanceStore, NodeExecutionStore, PlanExecutionStore,
    PurgeReport, SharedEngineStore, StoreError, StoreResult, SweepingOutputStore, WaitStore,
};
pub use types::{
    CallbackResponse, ChildRef, CorrelationId, ExecutableResponse, ExecutionMode, FailureInfo,
    FailureType, Interrupt, InterruptEffect, InterruptState, InterruptType, NodeExecution,
    NodeExecutionId, NodeExecutionOp, Outcomes, PlanExecution, PlanExecutionId, ResponseData,
    StepResponseNotifyData, SweepingOutputInstance, WaitInstance, WaitState, now_ms,
    sweeping_output_key,
};
