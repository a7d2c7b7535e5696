use super::{ChildLaunch, ExecutableStrategy, ExecuteOutcome, StrategyContext};
use crate::errors::{EngineError, EngineResult};
use crate::step::{StepKind, StepResponse};
use conductor_store::{
    ChildRef, CorrelationId, ExecutableResponse, ExecutionMode, FailureInfo, FailureType,
    ResponseData, Status, StepResponseNotifyData,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// How a parent settles from the final statuses of its children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinPolicy {
    #[default]
    AllSuccess,
    AnySuccess,
    IgnoreFailures,
}

impl FromStr for JoinPolicy {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ALL_SUCCESS" => Ok(Self::AllSuccess),
            "ANY_SUCCESS" => Ok(Self::AnySuccess),
            "IGNORE_FAILURES" => Ok(Self::IgnoreFailures),
            other => Err(EngineError::Configuration(format!(
                "unknown join policy '{other}'"
            ))),
        }
    }
}

// Higher wins. Anything not final at aggregation time counts as errored.
fn severity(status: Status) -> u8 {
    match status {
        Status::Aborted => 4,
        Status::Errored => 3,
        Status::Failed => 2,
        Status::Expired => 1,
        status if status.is_positive() => 0,
        _ => 3,
    }
}

fn most_severe(statuses: &[Status]) -> Status {
    statuses
        .iter()
        .copied()
        .max_by_key(|status| severity(*status))
        .map(|status| if status.is_final() { status } else { Status::Errored })
        .unwrap_or(Status::Succeeded)
}

/// Depends only on the multiset of statuses, never on arrival order.
pub fn aggregate_status(policy: JoinPolicy, statuses: &[Status]) -> Status {
    if statuses.is_empty() {
        return Status::Succeeded;
    }
    match policy {
        JoinPolicy::AllSuccess => {
            if statuses.iter().all(|status| status.is_positive()) {
                Status::Succeeded
            } else {
                most_severe(statuses)
            }
        }
        JoinPolicy::AnySuccess => {
            if statuses.iter().any(|status| status.is_positive()) {
                Status::Succeeded
            } else {
                most_severe(statuses)
            }
        }
        JoinPolicy::IgnoreFailures => {
            if statuses.contains(&Status::Aborted) {
                Status::Aborted
            } else {
                Status::Succeeded
            }
        }
    }
}

/// Outcomes are keyed by child identifier; failure messages of non-positive
/// children are joined in identifier order.
pub fn aggregate_children(
    policy: JoinPolicy,
    children: &BTreeMap<String, StepResponseNotifyData>,
) -> StepResponse {
    let statuses: Vec<Status> = children.values().map(|child| child.status).collect();
    let status = aggregate_status(policy, &statuses);

    let mut ordered: Vec<&StepResponseNotifyData> = children.values().collect();
    ordered.sort_by(|a, b| {
        a.identifier
            .cmp(&b.identifier)
            .then_with(|| a.node_execution_id.cmp(&b.node_execution_id))
    });

    let mut response = StepResponse::with_status(status);
    let mut failures = Vec::new();
    let mut failure_types = Vec::new();
    for child in ordered {
        let key = if response.outcomes.contains_key(&child.identifier) {
            format!("{}#{}", child.identifier, child.node_execution_id)
        } else {
            child.identifier.clone()
        };
        response.outcomes.insert(
            key,
            serde_json::json!({
                "status": child.status,
                "outcomes": child.outcomes,
            }),
        );
        if !child.status.is_positive() {
            let message = child
                .failure_info
                .as_ref()
                .map(|info| info.message.clone())
                .unwrap_or_else(|| child.status.to_string());
            failures.push(format!("{}: {message}", child.identifier));
            if let Some(info) = &child.failure_info {
                for kind in &info.failure_types {
                    if !failure_types.contains(kind) {
                        failure_types.push(*kind);
                    }
                }
            }
        }
    }
    if !status.is_positive() && !failures.is_empty() {
        if failure_types.is_empty() {
            failure_types.push(FailureType::Application);
        }
        response.failure_info = Some(FailureInfo {
            message: failures.join("; "),
            failure_types,
        });
    }
    response
}

pub(crate) fn child_responses(
    responses: &BTreeMap<CorrelationId, ResponseData>,
) -> EngineResult<BTreeMap<String, StepResponseNotifyData>> {
    responses
        .iter()
        .map(|(id, data)| match data.as_step_response() {
            Some(child) => Ok((id.clone(), child.clone())),
            None => Err(EngineError::Runtime(format!(
                "child '{id}' reported a non step response"
            ))),
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct ChildrenStrategy;

#[async_trait::async_trait]
impl ExecutableStrategy for ChildrenStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Children
    }

    async fn start(&self, ctx: &StrategyContext<'_>) -> EngineResult<ExecuteOutcome> {
        let StepKind::Children(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let specs = step.obtain_children(ctx.step_ctx).await?;
        if specs.is_empty() {
            return Ok(ExecuteOutcome::Completed(StepResponse::succeeded()));
        }
        let children: Vec<ChildLaunch> = specs.into_iter().map(ChildLaunch::from_spec).collect();
        let response = ExecutableResponse::Children {
            children: children
                .iter()
                .map(|child| ChildRef {
                    plan_node_id: child.plan_node_id.clone(),
                    runtime_id: child.runtime_id.clone(),
                    input_overrides: child.input_overrides.clone(),
                })
                .collect(),
        };
        Ok(ExecuteOutcome::Spawn { response, children })
    }

    async fn resume(
        &self,
        ctx: &StrategyContext<'_>,
        responses: &BTreeMap<CorrelationId, ResponseData>,
    ) -> EngineResult<ExecuteOutcome> {
        let StepKind::Children(step) = ctx.step else {
            return Err(ctx.mismatch(self.mode()));
        };
        let children = child_responses(responses)?;
        let response = step.handle_children_response(ctx.step_ctx, &children).await?;
        Ok(ExecuteOutcome::Completed(response))
    }
}
