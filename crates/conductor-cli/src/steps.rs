use async_trait::async_trait;
use conductor_engine::{
    AsyncExecutable, AsyncExecutableResponse, ChildChainExecutable, ChildChainResponse, ChildSpec,
    ChildrenExecutable, EngineError, EngineResult, LocalTaskExecutor, SharedTaskExecutor,
    StepContext, StepRegistry, StepResponse, SyncExecutable, TaskExecutable, TaskHandler,
    TaskRequest, child_specs_from_parameters,
};
use conductor_store::{CorrelationId, ResponseData, Status, StepResponseNotifyData};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SHELL_TASK_TYPE: &str = "shell";

pub fn demo_registry() -> EngineResult<StepRegistry> {
    Ok(StepRegistry::builder()
        .sync("noop", NoopStep)?
        .task("shell-task", ShellTaskStep)?
        .children("fork", ForkStep)?
        .child_chain("chain", ChainStep)?
        .async_step("approval", ApprovalStep)?
        .build())
}

pub fn demo_task_executor() -> SharedTaskExecutor {
    Arc::new(LocalTaskExecutor::new().with_handler(SHELL_TASK_TYPE, ShellTaskHandler))
}

/// Succeeds with its `outcome` parameter and publishes the `outputs` object.
struct NoopStep;

#[async_trait]
impl SyncExecutable for NoopStep {
    async fn execute_sync(&self, ctx: &StepContext) -> EngineResult<StepResponse> {
        let mut response = StepResponse::succeeded();
        if let Some(value) = ctx.parameter("outcome") {
            response = response.outcome("value", value.clone());
        }
        if let Some(outputs) = ctx.parameter("outputs").and_then(Value::as_object) {
            let group = ctx.parameter_str("group");
            for (name, value) in outputs {
                response = match group {
                    Some(group) => response.group_output(name.clone(), value.clone(), group),
                    None => response.output(name.clone(), value.clone()),
                };
            }
        }
        for (name, value) in &ctx.inputs.resolved {
            response = response.outcome(format!("input.{name}"), value.clone());
        }
        Ok(response)
    }
}

struct ShellTaskStep;

#[async_trait]
impl TaskExecutable for ShellTaskStep {
    async fn obtain_task(&self, ctx: &StepContext) -> EngineResult<TaskRequest> {
        if ctx.parameter_str("command").is_none() {
            return Err(EngineError::InvalidPlan(format!(
                "shell-task node '{}' needs a string 'command' parameter",
                ctx.node_execution_id
            )));
        }
        Ok(TaskRequest::new(SHELL_TASK_TYPE, ctx.step_parameters.clone()))
    }
}

/// Runs `command` through `sh -c`; a non-zero exit is a task error.
pub struct ShellTaskHandler;

#[async_trait]
impl TaskHandler for ShellTaskHandler {
    async fn run(&self, parameters: &Value) -> ResponseData {
        let Some(command) = parameters.get("command").and_then(Value::as_str) else {
            return ResponseData::error("shell task requires a 'command' parameter");
        };
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => ResponseData::payload(json!({
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
            })),
            Ok(output) => ResponseData::error(format!(
                "command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            )),
            Err(err) => ResponseData::error(format!("failed to spawn command: {err}")),
        }
    }
}

struct ForkStep;

#[async_trait]
impl ChildrenExecutable for ForkStep {
    async fn obtain_children(&self, ctx: &StepContext) -> EngineResult<Vec<ChildSpec>> {
        child_specs_from_parameters(&ctx.step_parameters, "children")
    }
}

/// Runs the plan nodes listed in `links` one after another.
struct ChainStep;

impl ChainStep {
    fn link(ctx: &StepContext, index: usize) -> ChildChainResponse {
        let links: Vec<&str> = ctx
            .parameter("links")
            .and_then(Value::as_array)
            .map(|links| links.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        match links.get(index) {
            Some(next) => ChildChainResponse::next(
                ChildSpec::new(*next),
                json!(index + 1),
                index + 1 == links.len(),
            ),
            None => ChildChainResponse::end(json!(index)),
        }
    }
}

#[async_trait]
impl ChildChainExecutable for ChainStep {
    async fn execute_first_child(&self, ctx: &StepContext) -> EngineResult<ChildChainResponse> {
        Ok(Self::link(ctx, 0))
    }

    async fn execute_next_child(
        &self,
        ctx: &StepContext,
        pass_through: &Value,
        previous: &StepResponseNotifyData,
    ) -> EngineResult<ChildChainResponse> {
        // Stop at the first link that did not succeed.
        if !previous.status.is_positive() {
            return Ok(ChildChainResponse::end(pass_through.clone()));
        }
        let index = pass_through
            .as_u64()
            .and_then(|index| usize::try_from(index).ok())
            .unwrap_or_default();
        Ok(Self::link(ctx, index))
    }
}

/// Parks the node in `APPROVAL_WAITING` until someone answers its callback.
///
/// A payload of `{"approved": false}` or an error response rejects the node.
struct ApprovalStep;

#[async_trait]
impl AsyncExecutable for ApprovalStep {
    async fn execute_async(&self, ctx: &StepContext) -> EngineResult<AsyncExecutableResponse> {
        Ok(AsyncExecutableResponse::approval(vec![ctx.new_callback_id()]))
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<StepResponse> {
        for response in responses.values() {
            match response {
                ResponseData::Error { message } => return Ok(StepResponse::failed(message.clone())),
                ResponseData::Payload { value }
                    if value.get("approved").and_then(Value::as_bool) == Some(false) =>
                {
                    return Ok(StepResponse::failed("approval rejected"));
                }
                _ => {}
            }
        }
        Ok(StepResponse::with_status(Status::Succeeded).outcome("approved", json!(true)))
    }
}
