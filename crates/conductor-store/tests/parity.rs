use conductor_store::{
    NodeExecutionStore, SweepingOutputStore, WaitStore,
    Ambiance, EngineStore, FsStore, Interrupt, InterruptState, InterruptType, Level, MemoryStore,
    NodeExecution, PlanExecution, ResponseData, Status, StoreError, StoreResult,
    SweepingOutputInstance, WaitInstance, WaitState, now_ms,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;

fn node(plan: &str, runtime_id: &str, parent_id: Option<&str>) -> NodeExecution {
    let ambiance = Ambiance::new(plan, BTreeMap::new())
        .derive_child(Level::new(runtime_id, format!("setup-{runtime_id}"), "noop"));
    let mut node = NodeExecution::queued(ambiance, runtime_id, Value::Null)
        .expect("ambiance should carry a level");
    node.parent_id = parent_id.map(str::to_string);
    node
}

fn output(plan: &str, idx: &str, name: &str, value: Value) -> SweepingOutputInstance {
    SweepingOutputInstance {
        uuid: format!("{idx}-{name}"),
        plan_execution_id: plan.to_string(),
        level_runtime_id_idx: idx.to_string(),
        name: name.to_string(),
        group_name: None,
        value,
        created_at: now_ms(),
        valid_until: u64::MAX,
    }
}

async fn exercise_node_lifecycle<T: EngineStore>(store: &T) -> StoreResult<()> {
    store.create_node_execution(node("p1", "root", None)).await?;
    store
        .create_node_execution(node("p1", "child-a", Some("root")))
        .await?;
    store
        .create_node_execution(node("p1", "child-b", Some("root")))
        .await?;

    let duplicate = store.create_node_execution(node("p1", "root", None)).await;
    assert!(matches!(duplicate, Err(StoreError::DuplicateKey { .. })));

    let running = store
        .update_node_status_with_ops(
            "child-a",
            Status::allowed_start_set(Status::Running),
            Status::Running,
            vec![],
        )
        .await?;
    assert_eq!(running.map(|node| node.status), Some(Status::Running));

    let children = store.find_all_children_of("root").await?;
    assert_eq!(children.len(), 2);

    let queued = store.find_by_status_in("p1", &[Status::Queued]).await?;
    let ids: Vec<_> = queued.iter().map(|node| node.uuid.as_str()).collect();
    assert!(ids.contains(&"root"));
    assert!(ids.contains(&"child-b"));
    assert!(!ids.contains(&"child-a"));

    let missing = store.get_node_execution("nope").await;
    assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    Ok(())
}

async fn exercise_write_once_outputs<T: EngineStore>(store: &T) -> StoreResult<()> {
    store.insert_output(output("p1", "r1", "x", json!(1))).await?;
    let duplicate = store.insert_output(output("p1", "r1", "x", json!(2))).await;
    assert!(matches!(duplicate, Err(StoreError::DuplicateOutput { .. })));

    store
        .insert_output(output("p1", "r1|r2", "x", json!(3)))
        .await?;
    let found = store
        .find_outputs("p1", &["r1".to_string()], "x")
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, json!(1));
    Ok(())
}

async fn exercise_interrupt_cas<T: EngineStore>(store: &T) -> StoreResult<()> {
    let now = now_ms();
    store
        .save_interrupt(Interrupt {
            uuid: "i1".to_string(),
            interrupt_type: InterruptType::AbortAll,
            plan_execution_id: "p1".to_string(),
            node_execution_id: None,
            state: InterruptState::Registered,
            created_at: now,
            last_updated_at: now,
            issued_by: Some("tester".to_string()),
            metadata: BTreeMap::new(),
        })
        .await?;

    let first = store
        .update_interrupt_state("i1", &[InterruptState::Registered], InterruptState::Processing)
        .await?;
    let second = store
        .update_interrupt_state("i1", &[InterruptState::Registered], InterruptState::Processing)
        .await?;
    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(store.fetch_active_interrupts("p1").await?.len(), 1);

    store
        .update_interrupt_state(
            "i1",
            &[InterruptState::Processing],
            InterruptState::ProcessedSuccessfully,
        )
        .await?;
    assert!(store.fetch_active_interrupts("p1").await?.is_empty());
    Ok(())
}

async fn exercise_wait_for_all<T: EngineStore>(store: &T) -> StoreResult<()> {
    let registered = store
        .register_wait(WaitInstance {
            uuid: "w1".to_string(),
            plan_execution_id: "p1".to_string(),
            node_execution_id: "root".to_string(),
            correlation_ids: vec!["a".to_string(), "b".to_string()],
            state: WaitState::Waiting,
            created_at: now_ms(),
        })
        .await?;
    assert!(registered.is_none());

    let after_a = store
        .record_response("a", ResponseData::payload(json!("a")))
        .await?;
    assert!(after_a.is_empty());
    let after_b = store
        .record_response("b", ResponseData::payload(json!("b")))
        .await?;
    assert_eq!(after_b.len(), 1);

    let redelivered = store
        .record_response("b", ResponseData::payload(json!("late")))
        .await?;
    assert!(redelivered.is_empty());

    let responses = store
        .fetch_responses(&["a".to_string(), "b".to_string()])
        .await?;
    assert_eq!(responses.get("b"), Some(&ResponseData::payload(json!("b"))));
    assert_eq!(store.fetch_ready_waits("p1").await?.len(), 1);
    assert!(store.claim_wait("w1").await?);
    assert!(store.fetch_ready_waits("p1").await?.is_empty());
    Ok(())
}

async fn exercise_plan_status<T: EngineStore>(store: &T) -> StoreResult<()> {
    let now = now_ms();
    store
        .create_plan_execution(PlanExecution {
            uuid: "p1".to_string(),
            plan_id: "demo".to_string(),
            status: Status::Running,
            start_ts: Some(now),
            end_ts: None,
            setup_abstractions: BTreeMap::new(),
            created_at: now,
            last_updated_at: now,
        })
        .await?;
    let done = store
        .update_plan_status("p1", &[Status::Running], Status::Succeeded)
        .await?
        .expect("running plan should transition");
    assert!(done.end_ts.is_some());
    let again = store
        .update_plan_status("p1", &[Status::Running], Status::Failed)
        .await?;
    assert!(again.is_none());
    Ok(())
}

async fn exercise_all<T: EngineStore>(store: &T) -> StoreResult<()> {
    exercise_node_lifecycle(store).await?;
    exercise_write_once_outputs(store).await?;
    exercise_interrupt_cas(store).await?;
    exercise_wait_for_all(store).await?;
    exercise_plan_status(store).await
}

#[tokio::test(flavor = "current_thread")]
async fn memory_store_contract_expected_all_operations_behave() {
    let store = MemoryStore::new();
    exercise_all(&store)
        .await
        .expect("memory store contract should hold");
}

#[tokio::test(flavor = "current_thread")]
async fn fs_store_contract_expected_all_operations_behave() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let store = FsStore::new(temp.path()).expect("fs store should open");
    exercise_all(&store)
        .await
        .expect("fs store contract should hold");
}

#[tokio::test(flavor = "current_thread")]
async fn fs_store_reopen_expected_same_view_as_before() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    {
        let store = FsStore::new(temp.path()).expect("fs store should open");
        exercise_all(&store)
            .await
            .expect("fs store contract should hold");
    }

    let reopened = FsStore::new(temp.path()).expect("fs store should reopen");
    let nodes = reopened
        .fetch_node_executions("p1")
        .await
        .expect("nodes should load");
    assert_eq!(nodes.len(), 3);
    let duplicate = reopened.insert_output(output("p1", "r1", "x", json!(9))).await;
    assert!(matches!(duplicate, Err(StoreError::DuplicateOutput { .. })));
    assert!(
        !reopened
            .claim_wait("w1")
            .await
            .expect("wait should be restored")
    );
}
