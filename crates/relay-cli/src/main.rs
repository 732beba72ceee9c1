use clap::{ArgAction, Parser, Subcommand};
use relay_agent::{
    Bridge, BridgeConfig, BridgeEvent, ConversationEvent, ManifestRegistry, SubagentRegistry,
    SubmitOutcome, TurnSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-cli")]
#[command(about = "Drive coding-agent CLIs through the relay bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Engines(EnginesArgs),
    InspectSubagents(InspectSubagentsArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    manifests: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    engine: Option<String>,
    #[arg(long, default_value = "cli")]
    conversation: String,
    #[arg(long)]
    prompt: String,
    /// Follow-up messages submitted in order after the first turn.
    #[arg(long = "reply")]
    replies: Vec<String>,
    #[arg(long)]
    cwd: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    spec: bool,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct EnginesArgs {
    #[arg(long)]
    manifests: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct InspectSubagentsArgs {
    #[arg(long)]
    state: PathBuf,
    #[arg(long)]
    conversation: Option<String>,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RELAY_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Engines(args) => engines_command(args),
        Commands::InspectSubagents(args) => inspect_subagents_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let mut config = match args.config.as_deref() {
        Some(path) => BridgeConfig::load_from_path(path).map_err(|e| e.to_string())?,
        None => BridgeConfig::default(),
    };
    if let Some(cwd) = args.cwd {
        config.working_dir = cwd;
    }
    let manifests = ManifestRegistry::load_dir(&args.manifests).map_err(|e| e.to_string())?;
    if manifests.is_empty() {
        return Err(format!(
            "no usable engine manifests in '{}'",
            args.manifests.display()
        ));
    }

    let bridge = Bridge::new(config, manifests).map_err(|e| e.to_string())?;
    bridge
        .restore_subagents()
        .await
        .map_err(|e| e.to_string())?;
    if let Some(engine) = args.engine.as_deref() {
        bridge
            .switch_engine(&args.conversation, engine)
            .map_err(|e| e.to_string())?;
    }
    bridge.set_model_override(&args.conversation, args.model);
    if !args.no_stream_events {
        let event_json = args.event_json;
        bridge.observe(Arc::new(move |event: &ConversationEvent| {
            print_event(event, event_json)
        }));
    }

    let mut outcome = if args.spec {
        bridge.enter_spec_mode(&args.conversation, &args.prompt).await
    } else {
        bridge.submit(&args.conversation, &args.prompt).await
    }
    .map_err(|e| e.to_string())?;
    for reply in &args.replies {
        outcome = bridge
            .submit(&args.conversation, reply)
            .await
            .map_err(|e| e.to_string())?;
    }

    if let Err(error) = bridge.save_subagents().await {
        tracing::warn!(%error, "failed to save subagent registry");
    }
    Ok(report_outcome(&outcome))
}

fn engines_command(args: EnginesArgs) -> Result<ExitCode, String> {
    let manifests = ManifestRegistry::load_dir(&args.manifests).map_err(|e| e.to_string())?;
    if args.json {
        let engines: Vec<_> = manifests
            .names()
            .into_iter()
            .filter_map(|name| manifests.get(&name))
            .map(|manifest| {
                serde_json::json!({
                    "name": manifest.name,
                    "executable": manifest.executable.display().to_string(),
                    "input_mode": manifest.input_mode,
                    "dialect": manifest.dialect,
                })
            })
            .collect();
        let json = serde_json::to_string_pretty(&engines).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        for name in manifests.names() {
            if let Some(manifest) = manifests.get(&name) {
                println!("{name}: {}", manifest.executable.display());
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn inspect_subagents_command(args: InspectSubagentsArgs) -> Result<ExitCode, String> {
    let raw = std::fs::read_to_string(&args.state)
        .map_err(|e| format!("failed reading state file '{}': {e}", args.state.display()))?;
    let registry = SubagentRegistry::default();
    registry.from_json(&raw).map_err(|e| e.to_string())?;
    let runs: Vec<_> = registry
        .all()
        .into_iter()
        .filter(|run| {
            args.conversation
                .as_deref()
                .is_none_or(|conversation| run.conversation_id == conversation)
        })
        .collect();

    if args.json {
        let json = serde_json::to_string_pretty(&runs).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        println!("runs: {}", runs.len());
        for run in &runs {
            println!(
                "{} [{}] conversation={} engine={} task={}",
                run.display_name(),
                run.status,
                run.conversation_id,
                run.engine,
                run.task
            );
            if let Some(error) = run.error.as_deref() {
                println!("  error: {error}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_event(event: &ConversationEvent, event_json: bool) {
    if event_json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(_) => print_event_text(event),
        }
    } else {
        print_event_text(event);
    }
}

fn print_event_text(event: &ConversationEvent) {
    let origin = match event.subagent_run_id.as_deref() {
        Some(run_id) => format!("{}:{run_id}", event.engine),
        None => event.engine.clone(),
    };
    let detail = match &event.event {
        BridgeEvent::Started { session_id, .. } => session_id.clone(),
        BridgeEvent::ToolStart { name, .. } => name.clone(),
        BridgeEvent::ToolEnd { name, is_error, .. } => {
            if *is_error {
                format!("{name} (failed)")
            } else {
                name.clone()
            }
        }
        BridgeEvent::Thinking { .. } | BridgeEvent::Text { .. } => String::new(),
        BridgeEvent::Completed { is_error: true, .. } => "error".to_string(),
        BridgeEvent::Completed { .. } => "ok".to_string(),
        BridgeEvent::Error { message } => message.clone(),
        BridgeEvent::PlanProposed { tool_id, .. } => tool_id.clone(),
    };
    println!("[event {origin}] {} {detail}", event.event.kind());
}

fn report_outcome(outcome: &SubmitOutcome) -> ExitCode {
    match outcome {
        SubmitOutcome::Turn(summary) => {
            print_turn_summary(summary);
            if summary.is_error {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        SubmitOutcome::SpecCancelled => {
            println!("status: cancelled");
            ExitCode::SUCCESS
        }
        SubmitOutcome::Queued { position } => {
            println!("status: queued ({position})");
            ExitCode::SUCCESS
        }
    }
}

fn print_turn_summary(summary: &TurnSummary) {
    println!("conversation: {}", summary.conversation_id);
    println!("engine: {}", summary.engine);
    println!(
        "session_id: {}",
        summary.session_id.as_deref().unwrap_or("<none>")
    );
    println!(
        "status: {}",
        if summary.interrupted {
            "interrupted"
        } else if summary.is_error {
            "error"
        } else {
            "ok"
        }
    );
    if let Some(plan) = summary.plan.as_deref() {
        println!("plan: {plan}");
    }
    if let Some(cost) = summary.cost_usd {
        println!("cost_usd: {cost:.4}");
    }
    if let Some(error) = summary.error.as_deref() {
        println!("error: {error}");
    }
    println!("answer: {}", summary.answer);
}
