mod support;

use conductor_engine::{EngineEventKind, NodeEvent, Plan, PlanEvent, PlanNode, RefObject};
use conductor_store::{ExecutionMode, FailureType, ResponseData, Status};
use serde_json::json;
use support::{WAIT, harness};

#[tokio::test(flavor = "current_thread")]
async fn sync_on_success_next_step_expected_linked_siblings_and_plan_succeeded() {
    let harness = harness();
    let plan = Plan::new("build", "compile")
        .with_node(
            PlanNode::new("compile", "compile", "noop")
                .with_parameters(json!({"outcome": "ok"}))
                .with_adviser("ON_SUCCESS", json!({"next_node_id": "package"})),
        )
        .with_node(PlanNode::new("package", "package", "noop"));

    let finished = harness.run("plan-1", plan).await;

    assert_eq!(finished.status, Status::Succeeded);
    assert!(finished.end_ts.is_some());
    let compile = &harness.nodes_for("plan-1", "compile").await[0];
    let package = &harness.nodes_for("plan-1", "package").await[0];
    assert_eq!(compile.status, Status::Succeeded);
    assert_eq!(compile.mode, Some(ExecutionMode::Sync));
    assert_eq!(compile.outcomes["value"], json!("ok"));
    assert_eq!(compile.next_id.as_deref(), Some(package.uuid.as_str()));
    assert_eq!(package.previous_id.as_deref(), Some(compile.uuid.as_str()));
    assert_eq!(package.ambiance.depth(), 1);

    let events = harness.events();
    assert!(matches!(events.first(), Some(EngineEventKind::Plan(PlanEvent::Started { .. }))));
    assert!(matches!(
        events.last(),
        Some(EngineEventKind::Plan(PlanEvent::Completed {
            status: Status::Succeeded,
            ..
        }))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn step_error_expected_failed_node_with_application_failure() {
    let harness = harness();
    let plan = Plan::new("build", "explode").with_node(PlanNode::new("explode", "explode", "boom"));

    let finished = harness.run("plan-1", plan).await;

    assert_eq!(finished.status, Status::Failed);
    let node = &harness.nodes_for("plan-1", "explode").await[0];
    let failure = node.failure_info.as_ref().expect("failure info recorded");
    assert_eq!(failure.failure_types, vec![FailureType::Application]);
    assert!(failure.message.contains("boom"));
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_step_type_expected_errored_with_configuration_failure() {
    let harness = harness();
    let plan = Plan::new("build", "ghost").with_node(PlanNode::new("ghost", "ghost", "missing"));

    let finished = harness.run("plan-1", plan).await;

    assert_eq!(finished.status, Status::Errored);
    let node = &harness.nodes_for("plan-1", "ghost").await[0];
    assert_eq!(
        node.failure_info.as_ref().map(|info| info.failure_types.clone()),
        Some(vec![FailureType::Configuration])
    );
}

#[tokio::test(flavor = "current_thread")]
async fn chain_group_outputs_expected_visible_to_later_links() {
    let harness = harness();
    let plan = Plan::new("release", "stage")
        .with_node(
            PlanNode::new("stage", "stage", "chain")
                .with_group("STAGE")
                .with_parameters(json!({"links": ["produce", "consume"]})),
        )
        .with_node(PlanNode::new("produce", "produce", "noop").with_parameters(json!({
            "outputs": {"artifact": "image:1"},
            "group": "STAGE",
        })))
        .with_node(
            PlanNode::new("consume", "consume", "noop")
                .with_ref_object(RefObject::required("artifact"))
                .with_ref_object(RefObject::optional("missing")),
        );

    let finished = harness.run("plan-1", plan).await;

    assert_eq!(finished.status, Status::Succeeded);
    let stage = &harness.nodes_for("plan-1", "stage").await[0];
    assert_eq!(stage.outcomes["links_run"], json!(2));
    let consume = &harness.nodes_for("plan-1", "consume").await[0];
    assert_eq!(consume.outcomes["input.artifact"], json!("image:1"));
    assert!(!consume.outcomes.contains_key("input.missing"));
    assert_eq!(consume.parent_id.as_deref(), Some(stage.uuid.as_str()));
    assert_eq!(consume.ambiance.depth(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn chain_duplicate_output_expected_link_failed_with_data_integrity() {
    let harness = harness();
    let produce = |id: &str| {
        PlanNode::new(id, id, "noop").with_parameters(json!({
            "outputs": {"artifact": id},
            "group": "STAGE",
        }))
    };
    let plan = Plan::new("release", "stage")
        .with_node(
            PlanNode::new("stage", "stage", "chain")
                .with_group("STAGE")
                .with_parameters(json!({"links": ["first", "second", "never"]})),
        )
        .with_node(produce("first"))
        .with_node(produce("second"))
        .with_node(produce("never"));

    let finished = harness.run("plan-1", plan).await;

    assert_eq!(finished.status, Status::Failed);
    let second = &harness.nodes_for("plan-1", "second").await[0];
    assert_eq!(second.status, Status::Failed);
    assert_eq!(
        second.failure_info.as_ref().map(|info| info.failure_types.clone()),
        Some(vec![FailureType::DataIntegrity])
    );
    assert!(harness.nodes_for("plan-1", "never").await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fork_children_expected_parent_aggregates_outcomes_and_overrides() {
    let harness = harness();
    let plan = Plan::new("deploy", "fanout")
        .with_node(PlanNode::new("fanout", "fanout", "fork").with_parameters(json!({
            "children": [
                "us",
                {"child_node_id": "eu", "input_overrides": {"region": "eu-west-1"}},
            ]
        })))
        .with_node(PlanNode::new("us", "us", "slow").with_parameters(json!({"sleep_ms": 20})))
        .with_node(PlanNode::new("eu", "eu", "noop"));

    let finished = harness.run("plan-1", plan).await;

    assert_eq!(finished.status, Status::Succeeded);
    let parent = &harness.nodes_for("plan-1", "fanout").await[0];
    assert_eq!(parent.mode, Some(ExecutionMode::Children));
    assert_eq!(parent.outcomes["us"]["status"], json!("SUCCEEDED"));
    assert_eq!(
        parent.outcomes["eu"]["outcomes"]["override.region"],
        json!("eu-west-1")
    );
    for child in ["us", "eu"] {
        let node = &harness.nodes_for("plan-1", child).await[0];
        assert_eq!(node.parent_id.as_deref(), Some(parent.uuid.as_str()));
        assert!(node.start_ts >= parent.start_ts);
        assert!(node.end_ts <= parent.end_ts);
    }
}

#[tokio::test(flavor = "current_thread")]
async fn fork_failed_child_expected_policy_decides_parent_status() {
    let harness = harness();
    let plan = |policy: &str| {
        Plan::new("deploy", "fanout")
            .with_node(PlanNode::new("fanout", "fanout", "fork").with_parameters(json!({
                "children": ["ok", "bad"],
                "join_policy": policy,
            })))
            .with_node(PlanNode::new("ok", "ok", "noop"))
            .with_node(PlanNode::new("bad", "bad", "boom"))
    };

    let strict = harness.run("plan-strict", plan("ALL_SUCCESS")).await;
    let lenient = harness.run("plan-lenient", plan("ANY_SUCCESS")).await;

    assert_eq!(strict.status, Status::Failed);
    assert_eq!(lenient.status, Status::Succeeded);
    let parent = &harness.nodes_for("plan-strict", "fanout").await[0];
    assert!(
        parent
            .failure_info
            .as_ref()
            .is_some_and(|info| info.message.contains("bad"))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn fork_without_children_expected_immediate_success() {
    let harness = harness();
    let plan = Plan::new("deploy", "fanout")
        .with_node(
            PlanNode::new("fanout", "fanout", "fork").with_parameters(json!({"children": []})),
        );

    let finished = harness.run("plan-1", plan).await;

    assert_eq!(finished.status, Status::Succeeded);
    assert_eq!(harness.nodes("plan-1").await.len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn wrap_child_expected_parent_mirrors_child_result() {
    let harness = harness();
    let plan = Plan::new("deploy", "outer")
        .with_node(
            PlanNode::new("outer", "outer", "wrap").with_parameters(json!({"child": "inner"})),
        )
        .with_node(PlanNode::new("inner", "inner", "noop").with_parameters(json!({"outcome": 7})));

    let finished = harness.run("plan-1", plan).await;

    assert_eq!(finished.status, Status::Succeeded);
    let outer = &harness.nodes_for("plan-1", "outer").await[0];
    assert_eq!(outer.mode, Some(ExecutionMode::Child));
    assert_eq!(outer.outcomes["value"], json!(7));
}

#[tokio::test(flavor = "current_thread")]
async fn task_step_expected_result_from_executor_callback() {
    let harness = harness();
    let plan = |parameters| {
        Plan::new("ops", "job")
            .with_node(PlanNode::new("job", "job", "echo_task").with_parameters(parameters))
    };

    let ok = harness.run("plan-ok", plan(json!({"command": "make"}))).await;
    let bad = harness.run("plan-bad", plan(json!({"fail": "exit 2"}))).await;

    assert_eq!(ok.status, Status::Succeeded);
    let job = &harness.nodes_for("plan-ok", "job").await[0];
    assert_eq!(job.mode, Some(ExecutionMode::Task));
    assert_eq!(job.outcomes["result"]["command"], json!("make"));
    assert_eq!(bad.status, Status::Failed);
}

#[tokio::test(flavor = "current_thread")]
async fn async_step_callback_expected_resumed_and_succeeded() {
    let harness = harness();
    harness
        .start(
            "plan-1",
            Plan::new("ops", "hook").with_node(PlanNode::new("hook", "hook", "remote")),
        )
        .await;

    let waiting = harness
        .orchestrator
        .wait_for_node_status("plan-1", "hook", Status::AsyncWaiting, WAIT)
        .await
        .expect("node should wait");
    let callback_id = harness
        .remote
        .callback_for(&waiting.uuid)
        .expect("callback id recorded");
    let resumed = harness
        .orchestrator
        .handle_callback(&callback_id, ResponseData::payload(json!({"build": 42})))
        .await
        .expect("callback should be accepted");
    let finished = harness
        .orchestrator
        .wait_for_plan_completion("plan-1", WAIT)
        .await
        .expect("plan should finish");

    assert_eq!(resumed, 1);
    assert_eq!(finished.status, Status::Succeeded);
    let hook = &harness.nodes_for("plan-1", "hook").await[0];
    assert_eq!(hook.outcomes["payload"]["build"], json!(42));
    let statuses: Vec<Status> = harness
        .events()
        .into_iter()
        .filter_map(|event| match event {
            EngineEventKind::Node(NodeEvent::StatusChanged { status, .. }) => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            Status::Running,
            Status::AsyncWaiting,
            Status::Running,
            Status::Succeeded
        ]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn callback_for_unknown_id_expected_recorded_without_resume() {
    let harness = harness();

    let resumed = harness
        .orchestrator
        .handle_callback("nobody-waits", ResponseData::payload(json!(1)))
        .await
        .expect("callback should be accepted");

    assert_eq!(resumed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_callbacks_delivered_concurrently_expected_single_resume() {
    let harness = harness();
    harness
        .start(
            "plan-1",
            Plan::new("ops", "hook").with_node(PlanNode::new("hook", "hook", "remote")),
        )
        .await;
    let waiting = harness
        .orchestrator
        .wait_for_node_status("plan-1", "hook", Status::AsyncWaiting, WAIT)
        .await
        .expect("node should wait");
    let callback_id = harness
        .remote
        .callback_for(&waiting.uuid)
        .expect("callback id recorded");

    let deliveries = (0..8).map(|attempt| {
        let orchestrator = harness.orchestrator.clone();
        let callback_id = callback_id.clone();
        async move {
            orchestrator
                .handle_callback(&callback_id, ResponseData::payload(json!({"attempt": attempt})))
                .await
        }
    });
    let resumed: usize = futures::future::join_all(deliveries)
        .await
        .into_iter()
        .map(|result| result.expect("callback should be accepted"))
        .sum();
    let finished = harness
        .orchestrator
        .wait_for_plan_completion("plan-1", WAIT)
        .await
        .expect("plan should finish");

    assert_eq!(resumed, 1);
    assert_eq!(finished.status, Status::Succeeded);
    let hook = &harness.nodes_for("plan-1", "hook").await[0];
    assert!(hook.outcomes["payload"]["attempt"].is_u64());
}
