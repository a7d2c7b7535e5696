//! Plan execution engine for Conductor.
//!
//! Walks a plan graph node by node, suspending on asynchronous work and
//! resuming on callbacks, with every transition committed through the
//! conditional updates of `conductor-store`.

pub mod advisers;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod executables;
pub mod graph;
mod interrupts;
pub mod notifier;
pub mod orchestrator;
pub mod plan;
pub mod retry;
pub mod step;
pub mod sweeping;
pub mod task;

pub use advisers::{
    Advise, Adviser, AdviserRegistry, AdviserRegistryBuilder, AdvisingEvent,
    ManualInterventionAdviser, OnFailAdviser, OnSuccessAdviser, RepairAction, RetryAdviser,
    RetryAdviserParameters,
};
pub use config::EngineConfig;
pub use dispatcher::{
    DispatchContext, InterruptCloser, NodeStatusHandler, NodeStatusUpdateDispatcher,
    NodeUpdateInfo,
};
pub use errors::{EngineError, EngineResult};
pub use events::{
    EngineEvent, EngineEventKind, EngineEventObserver, EngineEventReceiver, EngineEventSender,
    EngineEventSink, InterruptEvent, NodeEvent, PlanEvent, SharedEngineEventObserver,
    engine_event_channel,
};
pub use executables::{ExecutableStrategy, ExecuteOutcome, JoinPolicy, aggregate_children};
pub use graph::{GraphOptions, GraphVertex, OrchestrationGraph, build_graph, load_graph};
pub use notifier::{CallbackDelivery, CallbackSender, WaitNotifyEngine, callback_channel};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RecoveryReport};
pub use plan::{
    AdviserObtainment, FsPlanProvider, InMemoryPlanProvider, Plan, PlanDefinitionProvider,
    PlanNode, RefObject, SharedPlanProvider,
};
pub use retry::RetryBackoffConfig;
pub use step::{
    AsyncExecutable, AsyncExecutableResponse, ChildChainExecutable, ChildChainResponse,
    ChildExecutable, ChildSpec, ChildrenExecutable, StepContext, StepInputs, StepKind,
    StepRegistry, StepRegistryBuilder, StepResponse, SweepingOutput, SyncExecutable,
    TaskExecutable, TaskRequest, child_specs_from_parameters,
};
pub use sweeping::SweepingOutputService;
pub use task::{LocalTaskExecutor, NoTaskExecutor, SharedTaskExecutor, TaskExecutor, TaskHandler};
