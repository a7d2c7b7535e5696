mod steps;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use conductor_engine::{
    EngineConfig, EngineEvent, EngineEventSink, FsPlanProvider, GraphOptions, InMemoryPlanProvider,
    OrchestrationGraph, Orchestrator, Plan, SharedPlanProvider, load_graph,
};
use conductor_store::{
    ExecutableResponse, FsStore, InterruptState, InterruptType, MaintenanceStore, MemoryStore,
    NodeExecutionStore, PlanExecutionStore, ResponseData, SharedEngineStore, Status, now_ms,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DRIVE_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Command line host for the conductor orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Resume(ResumeArgs),
    Graph(GraphArgs),
    Interrupt(InterruptArgs),
    Purge(PurgeArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    plan_execution_id: Option<String>,
    /// Persist the run under this directory so later commands can pick it up.
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    events: bool,
    #[arg(long, value_enum, default_value_t = ApprovalMode::Auto)]
    approval: ApprovalMode,
    #[arg(long, default_value_t = 60_000)]
    wait_ms: u64,
}

#[derive(clap::Args, Debug)]
struct ResumeArgs {
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    plan_execution_id: String,
    #[arg(long, action = ArgAction::SetTrue)]
    events: bool,
    #[arg(long, value_enum, default_value_t = ApprovalMode::Auto)]
    approval: ApprovalMode,
    #[arg(long, default_value_t = 60_000)]
    wait_ms: u64,
}

#[derive(clap::Args, Debug)]
struct GraphArgs {
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    plan_execution_id: String,
    /// Include attempts superseded by a retry.
    #[arg(long, action = ArgAction::SetTrue)]
    all: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct InterruptArgs {
    #[arg(long)]
    store: PathBuf,
    #[arg(long)]
    plan_execution_id: String,
    /// Interrupt type, e.g. `abort-all`, `pause`, `mark-success`.
    #[arg(long = "type")]
    interrupt_type: String,
    /// Node execution id, plan node id or identifier of the target node.
    #[arg(long)]
    node: Option<String>,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    events: bool,
    #[arg(long, default_value_t = 2_000)]
    wait_ms: u64,
}

#[derive(clap::Args, Debug)]
struct PurgeArgs {
    #[arg(long)]
    store: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ApprovalMode {
    Auto,
    Reject,
    Wait,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Resume(args) => resume_command(args).await,
        Commands::Graph(args) => graph_command(args).await,
        Commands::Interrupt(args) => interrupt_command(args).await,
        Commands::Purge(args) => purge_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let plan = load_plan(&args.plan)?;
    let plan_execution_id = args
        .plan_execution_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let orchestrator = match args.store.as_deref() {
        Some(dir) => {
            let (store, plans) = open_store(dir)?;
            plans
                .insert(&plan_execution_id, &plan)
                .map_err(|error| error.to_string())?;
            build_orchestrator(store, plans, args.events)?
        }
        None => {
            let plans = Arc::new(InMemoryPlanProvider::new());
            plans
                .insert(plan_execution_id.clone(), plan)
                .map_err(|error| error.to_string())?;
            build_orchestrator(Arc::new(MemoryStore::new()), plans, args.events)?
        }
    };

    orchestrator
        .start_plan(&plan_execution_id, None, BTreeMap::new())
        .await
        .map_err(|error| error.to_string())?;
    let status = drive(
        &orchestrator,
        &plan_execution_id,
        args.approval,
        Duration::from_millis(args.wait_ms),
    )
    .await?;

    let graph = orchestrator
        .get_graph(&plan_execution_id)
        .await
        .map_err(|error| error.to_string())?;
    print_graph_summary(&graph);
    Ok(exit_code_for_status(status))
}

async fn resume_command(args: ResumeArgs) -> Result<ExitCode, String> {
    let (store, plans) = open_store(&args.store)?;
    let orchestrator = build_orchestrator(store, plans, args.events)?;
    let report = orchestrator
        .recover(&args.plan_execution_id)
        .await
        .map_err(|error| error.to_string())?;
    println!(
        "recovered: activated={} rerun={} resumed={} readvised={} retries={} waits={} \
         children={} interrupts={} timers={}",
        report.activated,
        report.rerun,
        report.resumed,
        report.readvised,
        report.retries,
        report.waits,
        report.children,
        report.interrupts,
        report.timers
    );

    let status = drive(
        &orchestrator,
        &args.plan_execution_id,
        args.approval,
        Duration::from_millis(args.wait_ms),
    )
    .await?;
    let graph = orchestrator
        .get_graph(&args.plan_execution_id)
        .await
        .map_err(|error| error.to_string())?;
    print_graph_summary(&graph);
    Ok(exit_code_for_status(status))
}

async fn graph_command(args: GraphArgs) -> Result<ExitCode, String> {
    let store: SharedEngineStore =
        Arc::new(FsStore::new(&args.store).map_err(|error| error.to_string())?);
    let graph = load_graph(
        &store,
        &args.plan_execution_id,
        GraphOptions {
            include_old_retries: args.all,
        },
    )
    .await
    .map_err(|error| error.to_string())?;

    if args.json {
        let json = serde_json::to_string_pretty(&graph.to_json()).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        print_graph_summary(&graph);
    }
    Ok(ExitCode::SUCCESS)
}

async fn interrupt_command(args: InterruptArgs) -> Result<ExitCode, String> {
    let interrupt_type = InterruptType::parse(&args.interrupt_type)
        .ok_or_else(|| format!("unknown interrupt type '{}'", args.interrupt_type))?;
    let (store, plans) = open_store(&args.store)?;
    let orchestrator = build_orchestrator(store, plans, args.events)?;
    orchestrator
        .recover(&args.plan_execution_id)
        .await
        .map_err(|error| error.to_string())?;

    let node_execution_id = match args.node.as_deref() {
        Some(node) => Some(resolve_node(&orchestrator, &args.plan_execution_id, node).await?),
        None => None,
    };
    let mut metadata = BTreeMap::new();
    if let Some(reason) = args.reason {
        metadata.insert("reason".to_string(), reason);
    }
    let interrupt = orchestrator
        .register_interrupt(
            interrupt_type,
            &args.plan_execution_id,
            node_execution_id.as_deref(),
            Some("conductor-cli"),
            metadata,
        )
        .await
        .map_err(|error| error.to_string())?;
    println!("interrupt_id: {}", interrupt.uuid);
    println!("interrupt_state: {}", interrupt_state_label(interrupt.state));

    drive(
        &orchestrator,
        &args.plan_execution_id,
        ApprovalMode::Wait,
        Duration::from_millis(args.wait_ms),
    )
    .await?;
    let graph = orchestrator
        .get_graph(&args.plan_execution_id)
        .await
        .map_err(|error| error.to_string())?;
    print_graph_summary(&graph);

    Ok(match interrupt.state {
        InterruptState::ProcessedUnsuccessfully => ExitCode::from(2),
        _ => ExitCode::SUCCESS,
    })
}

async fn purge_command(args: PurgeArgs) -> Result<ExitCode, String> {
    let store = FsStore::new(&args.store).map_err(|error| error.to_string())?;
    let report = store
        .purge_expired(now_ms())
        .await
        .map_err(|error| error.to_string())?;
    println!("purged_sweeping_outputs: {}", report.sweeping_outputs);
    println!("purged_node_executions: {}", report.node_executions);
    println!("purged_waits: {}", report.waits);
    println!("purged_responses: {}", report.responses);
    println!("purged_interrupts: {}", report.interrupts);
    println!("purged_plan_executions: {}", report.plan_executions);
    Ok(ExitCode::SUCCESS)
}

fn load_plan(path: &Path) -> Result<Plan, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed reading plan '{}': {e}", path.display()))?;
    let plan: Plan = serde_json::from_str(&raw)
        .map_err(|e| format!("invalid plan document '{}': {e}", path.display()))?;
    plan.validate().map_err(|error| error.to_string())?;
    Ok(plan)
}

fn open_store(dir: &Path) -> Result<(SharedEngineStore, Arc<FsPlanProvider>), String> {
    let store = FsStore::new(dir).map_err(|error| error.to_string())?;
    let plans = FsPlanProvider::new(dir).map_err(|error| error.to_string())?;
    Ok((Arc::new(store), Arc::new(plans)))
}

fn build_orchestrator(
    store: SharedEngineStore,
    plans: SharedPlanProvider,
    stream_events: bool,
) -> Result<Orchestrator, String> {
    let config = EngineConfig::from_env().map_err(|error| error.to_string())?;
    let steps = steps::demo_registry().map_err(|error| error.to_string())?;
    Orchestrator::builder(store, plans)
        .steps(steps)
        .task_executor(steps::demo_task_executor())
        .events(event_sink(stream_events))
        .config(config)
        .build()
        .map_err(|error| error.to_string())
}

fn event_sink(stream_events: bool) -> EngineEventSink {
    if !stream_events {
        return EngineEventSink::default();
    }
    EngineEventSink::with_observer(Arc::new(|event: &EngineEvent| {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(_) => println!("[event seq={}] {}", event.sequence_no, event.timestamp),
        }
    }))
}

/// Polls the plan run until it settles, pauses or `wait` elapses, answering
/// approval callbacks on the way unless `approval` is [`ApprovalMode::Wait`].
async fn drive(
    orchestrator: &Orchestrator,
    plan_execution_id: &str,
    approval: ApprovalMode,
    wait: Duration,
) -> Result<Status, String> {
    let deadline = tokio::time::Instant::now() + wait;
    let mut answered = BTreeSet::new();
    loop {
        let plan = orchestrator
            .store()
            .get_plan_execution(plan_execution_id)
            .await
            .map_err(|error| error.to_string())?;
        if plan.status.is_final()
            || plan.status == Status::Paused
            || tokio::time::Instant::now() >= deadline
        {
            return Ok(plan.status);
        }
        if approval != ApprovalMode::Wait {
            answer_approvals(orchestrator, plan_execution_id, approval, &mut answered).await?;
        }
        tokio::time::sleep(DRIVE_POLL_INTERVAL).await;
    }
}

async fn answer_approvals(
    orchestrator: &Orchestrator,
    plan_execution_id: &str,
    approval: ApprovalMode,
    answered: &mut BTreeSet<String>,
) -> Result<(), String> {
    let waiting = orchestrator
        .store()
        .find_by_status_in(plan_execution_id, &[Status::ApprovalWaiting])
        .await
        .map_err(|error| error.to_string())?;
    for node in waiting {
        let Some(ExecutableResponse::Async { callback_ids, .. }) = node.latest_executable_response()
        else {
            continue;
        };
        for callback_id in callback_ids {
            if !answered.insert(callback_id.clone()) {
                continue;
            }
            let approved = approval == ApprovalMode::Auto;
            info!(node = %node.identifier, approved, "answering approval");
            orchestrator
                .handle_callback(callback_id, ResponseData::payload(json!({"approved": approved})))
                .await
                .map_err(|error| error.to_string())?;
        }
    }
    Ok(())
}

/// Accepts a node execution id, or a plan node id / identifier naming its
/// current attempt.
async fn resolve_node(
    orchestrator: &Orchestrator,
    plan_execution_id: &str,
    node: &str,
) -> Result<String, String> {
    let nodes = orchestrator
        .store()
        .fetch_node_executions(plan_execution_id)
        .await
        .map_err(|error| error.to_string())?;
    nodes
        .iter()
        .find(|candidate| candidate.uuid == node)
        .or_else(|| {
            nodes.iter().rev().find(|candidate| {
                !candidate.old_retry && (candidate.node_id == node || candidate.identifier == node)
            })
        })
        .map(|found| found.uuid.clone())
        .ok_or_else(|| format!("no node '{node}' in plan execution '{plan_execution_id}'"))
}

fn print_graph_summary(graph: &OrchestrationGraph) {
    println!("plan_execution_id: {}", graph.plan_execution_id);
    println!("plan_id: {}", graph.plan_id);
    println!("status: {}", graph.status);
    println!("nodes:");
    print_vertices(graph, &graph.root_ids, 1);
}

fn print_vertices(graph: &OrchestrationGraph, ids: &[String], depth: usize) {
    for id in ids {
        let Some(vertex) = graph.vertex(id) else {
            continue;
        };
        let mode = vertex.mode.map(|mode| mode.as_str()).unwrap_or("-");
        let mut line = format!(
            "{}{} [{}] {}",
            "  ".repeat(depth),
            vertex.identifier,
            mode,
            vertex.status
        );
        if vertex.old_retry {
            line.push_str(" (superseded)");
        }
        if let Some(failure) = vertex.failure_info.as_ref() {
            line.push_str(&format!(": {}", failure.message));
        }
        println!("{line}");
        if let Some(children) = graph.adjacency.get(id) {
            print_vertices(graph, children, depth + 1);
        }
    }
}

fn interrupt_state_label(state: InterruptState) -> &'static str {
    match state {
        InterruptState::Registered => "REGISTERED",
        InterruptState::Processing => "PROCESSING",
        InterruptState::ProcessedSuccessfully => "PROCESSED_SUCCESSFULLY",
        InterruptState::ProcessedUnsuccessfully => "PROCESSED_UNSUCCESSFULLY",
    }
}

fn exit_code_for_status(status: Status) -> ExitCode {
    match status {
        status if status.is_final() && status.is_positive() => ExitCode::SUCCESS,
        status if status.is_final() => ExitCode::from(2),
        _ => ExitCode::from(3),
    }
}
