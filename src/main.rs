//! `triage` — CLI entry point for the cognitive routing and graph
//! orchestration core: request-facing tier-0..3 dispatch, scope graph
//! execution, router-decision analysis, and the read-only HTTP dashboard.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use triage_core::adapters::{
    AnthropicAdapter, LocalHttpAdapter, ModelAdapter, OpenAiAdapter, StubAdapter, build_http_client,
};
use triage_core::config::{GraphConfig, RouterConfig, agent_pack};
use triage_core::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use triage_core::domain::{ProviderName, RunId, ScopeType};
use triage_core::persistence::SqliteRunStore;
use triage_core::providers::{ProviderEntry, ProviderRegistry};
use triage_core::server::{DashboardState, bind, create_dashboard_router, serve};
use triage_core::time_provider::production_time_provider;
use triage_core::{GraphOrchestrator, TieredDispatcher};

#[derive(Parser)]
#[command(name = "triage", version, about = "Cognitive routing and graph orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tier-0..3 dispatch over a free-text or JSON-command request.
    #[command(name = "run-router")]
    RunRouter(RunRouterArgs),
    /// Execute the certification scope's graph.
    #[command(name = "run-cert")]
    RunCert(RunScopeArgs),
    /// Execute the topic/dossier scope's graph.
    #[command(name = "run-dossier")]
    RunDossier(RunScopeArgs),
    /// Execute the lab/test-suite scope's graph.
    #[command(name = "run-lab")]
    RunLab(RunScopeArgs),
    /// Execute the serialized-story scope's graph.
    #[command(name = "run-story")]
    RunStory(RunScopeArgs),
    /// Analyze recorded routing decisions and suggest threshold adjustments.
    #[command(name = "tune-router")]
    TuneRouter(TuneRouterArgs),
    /// Serve the read-only metrics/runs/routing dashboard.
    Dashboard(DashboardArgs),
}

#[derive(Args)]
struct RunRouterArgs {
    /// The raw request text (or a JSON `{"command": ...}` payload).
    request: String,
    /// Router config YAML; defaults to the built-in development preset.
    #[arg(long)]
    router_config: Option<PathBuf>,
}

#[derive(Args)]
struct RunScopeArgs {
    /// The scope instance id, e.g. a certification or world id.
    #[arg(long)]
    id: String,
    /// Seed source material handed to the entry node as `sources`.
    #[arg(long)]
    sources: Option<String>,
    /// Graph definition YAML (spec §3 Graph Definition).
    #[arg(long)]
    graph_config: PathBuf,
    /// Agent pack YAML mapping agent ids to deterministic/LLM behavior.
    #[arg(long)]
    agents: PathBuf,
    /// Router config YAML; defaults to the built-in development preset.
    #[arg(long)]
    router_config: Option<PathBuf>,
    /// `stub`, `local`, `local:<model>`, `cloud`, or `cloud:<model>`.
    #[arg(long, default_value = "stub")]
    model_call: String,
    /// `SQLite` database for checkpoints and routing decisions.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Args)]
struct TuneRouterArgs {
    /// `SQLite` database holding recorded routing decisions.
    #[arg(long)]
    db: PathBuf,
    /// Emit the analysis as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct DashboardArgs {
    /// Port to bind the dashboard's HTTP server on.
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// `SQLite` database to read routing decisions from, if any.
    #[arg(long)]
    db: Option<PathBuf>,
}

/// How `--model-call` selects a live or stubbed model backend.
enum ModelCallMode {
    Stub,
    Local(Option<String>),
    Cloud(Option<String>),
}

impl std::str::FromStr for ModelCallMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        if value == "stub" {
            Ok(Self::Stub)
        } else if value == "local" {
            Ok(Self::Local(None))
        } else if let Some(model) = value.strip_prefix("local:") {
            Ok(Self::Local(Some(model.to_string())))
        } else if value == "cloud" {
            Ok(Self::Cloud(None))
        } else if let Some(model) = value.strip_prefix("cloud:") {
            Ok(Self::Cloud(Some(model.to_string())))
        } else {
            anyhow::bail!("unrecognized --model-call mode {value:?}; expected stub|local|local:<model>|cloud|cloud:<model>")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("triage_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::RunRouter(args) => run_router(args).await,
        Command::RunCert(args) => run_scope(ScopeType::Certification, args).await,
        Command::RunDossier(args) => run_scope(ScopeType::Topic, args).await,
        Command::RunLab(args) => run_scope(ScopeType::Lab, args).await,
        Command::RunStory(args) => run_scope(ScopeType::Story, args).await,
        Command::TuneRouter(args) => tune_router(args).await,
        Command::Dashboard(args) => dashboard(args).await,
    }
}

async fn run_router(args: RunRouterArgs) -> Result<()> {
    let config = load_router_config(args.router_config.as_deref())?;
    let time = production_time_provider();
    let tier1 = build_tier_adapter("tier1", &ModelCallMode::Stub, &config, time.clone())?;
    let tier2 = build_tier_adapter("tier2", &ModelCallMode::Stub, &config, time.clone())?;
    let providers = build_provider_registry(&config, time)?;

    let dispatcher = TieredDispatcher::new(config, tier1, tier2, providers);
    let outcome = dispatcher
        .dispatch(&args.request)
        .await
        .context("dispatch failed")?;

    println!("{}", serde_json::to_string_pretty(&format_dispatch_outcome(&outcome))?);
    Ok(())
}

fn format_dispatch_outcome(outcome: &triage_core::DispatchOutcome) -> serde_json::Value {
    use triage_core::DispatchOutcome;
    match outcome {
        DispatchOutcome::Tier0(m) => serde_json::json!({
            "tier": 0,
            "action": m.action,
            "target": m.target,
            "args": m.args,
            "confidence": m.confidence.into_inner(),
        }),
        DispatchOutcome::Tier1(r) => serde_json::json!({
            "tier": 1,
            "recommended_tier": r.recommended_tier,
            "confidence": r.confidence,
        }),
        DispatchOutcome::Tier2(r) => serde_json::json!({
            "tier": 2,
            "quality_score": r.quality_score,
            "content": r.content,
        }),
        DispatchOutcome::Tier3(r) => serde_json::json!({
            "tier": 3,
            "provider": r.provider_name.to_string(),
            "content": r.content,
            "input_tokens": r.input_tokens.into_inner(),
            "output_tokens": r.output_tokens.into_inner(),
            "cost_cents": r.cost.into_inner().to_string(),
        }),
        DispatchOutcome::Rejected { reason } => serde_json::json!({
            "tier": "rejected",
            "reason": reason,
        }),
    }
}

async fn run_scope(scope_type: ScopeType, args: RunScopeArgs) -> Result<()> {
    let router_config = load_router_config(args.router_config.as_deref())?;
    let mode: ModelCallMode = args.model_call.parse()?;
    let time = production_time_provider();

    let tier1 = build_tier_adapter("tier1", &mode, &router_config, time.clone())?;
    let tier2 = build_tier_adapter("tier2", &mode, &router_config, time.clone())?;
    let providers = build_provider_registry(&router_config, time.clone())?;
    let router = Arc::new(triage_core::ModelRouter::new(router_config, tier1, tier2, providers));

    let graph = GraphConfig::load(&args.graph_config).context("loading graph config")?;
    let agents = agent_pack::load(&args.agents).context("loading agent pack")?;

    let store = match &args.db {
        Some(path) => Some(Arc::new(open_run_store(path).await?)),
        None => None,
    };
    let checkpoints = store
        .clone()
        .map(|s| s as Arc<dyn triage_core::orchestrator::CheckpointStore>);
    let routing_sink = store
        .clone()
        .map(|s| s as Arc<dyn triage_core::orchestrator::RoutingDecisionSink>);

    let orchestrator = GraphOrchestrator::new(graph, agents, Some(router), checkpoints, routing_sink, time);

    let mut seed: HashMap<String, serde_json::Value> = HashMap::new();
    seed.insert("id".to_string(), serde_json::json!(args.id));
    seed.insert("scope_type".to_string(), serde_json::json!(scope_type_label(scope_type)));
    if let Some(sources) = &args.sources {
        seed.insert("sources".to_string(), serde_json::json!(sources));
    }

    let run_id = RunId::generate();
    info!(%run_id, scope = scope_type_label(scope_type), id = %args.id, "starting run");
    let outcome = orchestrator.run(run_id, seed).await.context("run failed")?;

    match outcome {
        triage_core::RunOutcome::Succeeded { final_state } => {
            println!("run {run_id} succeeded");
            println!("{}", serde_json::to_string_pretty(&final_state)?);
        }
        triage_core::RunOutcome::Degraded { final_state } => {
            println!("run {run_id} degraded (budget threshold crossed)");
            println!("{}", serde_json::to_string_pretty(&final_state)?);
        }
    }
    Ok(())
}

fn scope_type_label(scope_type: ScopeType) -> &'static str {
    match scope_type {
        ScopeType::Certification => "certification",
        ScopeType::Topic => "topic",
        ScopeType::Lab => "lab",
        ScopeType::Story => "story",
    }
}

async fn tune_router(args: TuneRouterArgs) -> Result<()> {
    let store = open_run_store(&args.db).await?;
    let decisions = store.all_routing_decisions().await.context("reading routing decisions")?;

    let total = decisions.len();
    let escalated = decisions
        .iter()
        .filter(|d| d.chosen_tier.as_u8() > d.request_tier.as_u8())
        .count();
    #[allow(clippy::cast_precision_loss)]
    let escalation_rate = if total == 0 { 0.0 } else { escalated as f64 / total as f64 };
    let average_confidence = if total == 0 {
        0.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let sum: f64 = decisions.iter().map(|d| d.confidence.into_inner()).sum();
        sum / total as f64
    };

    let suggestion = if total == 0 {
        "no routing decisions recorded yet; nothing to tune".to_string()
    } else if escalation_rate > 0.6 {
        "escalation rate is high; consider raising confidence_threshold or complexity_threshold \
         so fewer nodes escalate past their preferred tier"
            .to_string()
    } else if escalation_rate < 0.05 && average_confidence > 0.9 {
        "escalation rate is very low with high average confidence; consider lowering \
         confidence_threshold to route more load to cheaper tiers"
            .to_string()
    } else {
        "escalation rate and confidence look balanced; no threshold change suggested".to_string()
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "total_decisions": total,
                "escalated": escalated,
                "escalation_rate": escalation_rate,
                "average_confidence": average_confidence,
                "suggestion": suggestion,
            }))?
        );
    } else {
        println!("total decisions analyzed: {total}");
        println!("escalation rate:          {:.1}%", escalation_rate * 100.0);
        println!("average confidence:       {average_confidence:.3}");
        println!("suggestion:               {suggestion}");
    }
    Ok(())
}

async fn dashboard(args: DashboardArgs) -> Result<()> {
    let metrics = Arc::new(triage_core::telemetry::MetricsCollector::new());
    let run_store = match &args.db {
        Some(path) => Some(Arc::new(open_run_store(path).await?)),
        None => None,
    };

    let state = DashboardState { metrics, run_store };
    let router = create_dashboard_router(state);
    let (listener, addr) = bind(args.port).await.context("binding dashboard listener")?;
    info!(%addr, "dashboard listening");
    serve(listener, router).await.context("dashboard server failed")?;
    Ok(())
}

async fn open_run_store(db_path: &std::path::Path) -> Result<SqliteRunStore> {
    let path = DatabasePath::new(db_path).context("invalid database path")?;
    let config = DatabaseConfig::new(path);
    let connection = DatabaseConnection::initialize(config).await.context("opening database")?;
    Ok(SqliteRunStore::new(connection))
}

fn load_router_config(path: Option<&std::path::Path>) -> Result<RouterConfig> {
    match path {
        Some(path) => RouterConfig::load(path).context("loading router config"),
        None => Ok(RouterConfig::development()),
    }
}

fn build_tier_adapter(
    tier_name: &str,
    mode: &ModelCallMode,
    config: &RouterConfig,
    time: triage_core::time_provider::SharedTimeProvider,
) -> Result<Arc<dyn ModelAdapter>> {
    let tier_config = if tier_name == "tier1" { &config.tier1 } else { &config.tier2 };
    let adapter: Arc<dyn ModelAdapter> = match mode {
        ModelCallMode::Stub => Arc::new(StubAdapter::new(format!("{tier_name}-stub"))),
        ModelCallMode::Local(model_override) => {
            let host = std::env::var("LOCAL_MODEL_HOST").unwrap_or_else(|_| "http://localhost:11434".to_string());
            let model = model_override.clone().unwrap_or_else(|| tier_config.model.to_string());
            Arc::new(LocalHttpAdapter::new(
                format!("{tier_name}-local"),
                host,
                model,
                tier_config.context_length,
                build_http_client()?,
                Duration::from_millis(50),
                time,
            ))
        }
        ModelCallMode::Cloud(model_override) => {
            let api_key = std::env::var("ANTHROPIC_API_KEY")
                .context("ANTHROPIC_API_KEY must be set for --model-call cloud")?;
            let model = model_override
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string());
            Arc::new(AnthropicAdapter::new(
                format!("{tier_name}-cloud"),
                "https://api.anthropic.com".to_string(),
                model,
                api_key,
                build_http_client()?,
                Duration::from_millis(200),
                time,
            ))
        }
    };
    Ok(adapter)
}

fn build_provider_registry(
    config: &RouterConfig,
    time: triage_core::time_provider::SharedTimeProvider,
) -> Result<ProviderRegistry> {
    let registry = ProviderRegistry::new(config.daily_aggregate_cap, time.clone());
    let client = build_http_client()?;

    for spec in &config.providers {
        let adapter: Arc<dyn ModelAdapter> = if spec.host.contains("anthropic.com") {
            let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
            Arc::new(AnthropicAdapter::new(
                spec.name.to_string(),
                spec.host.clone(),
                spec.model.to_string(),
                api_key,
                client.clone(),
                Duration::from_millis(200),
                time.clone(),
            ))
        } else if spec.host.contains("openai.com") {
            let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
            Arc::new(OpenAiAdapter::new(
                spec.name.to_string(),
                spec.host.clone(),
                spec.model.to_string(),
                api_key,
                client.clone(),
                Duration::from_millis(200),
                time.clone(),
            ))
        } else if spec.tags.iter().any(|t| t == "dgx") {
            Arc::new(triage_core::adapters::RemoteHighMemAdapter::new(
                spec.name.to_string(),
                spec.host.clone(),
                spec.model.to_string(),
                spec.max_context,
                client.clone(),
                Duration::from_millis(50),
                time.clone(),
            ))
        } else {
            Arc::new(LocalHttpAdapter::new(
                spec.name.to_string(),
                spec.host.clone(),
                spec.model.to_string(),
                spec.max_context,
                client.clone(),
                Duration::from_millis(50),
                time.clone(),
            ))
        };

        registry.register(ProviderEntry {
            name: spec.name.clone(),
            adapter,
            input_cost_per_1k: spec.input_cost_per_1k,
            output_cost_per_1k: spec.output_cost_per_1k,
            quality: triage_core::domain::UnitScore::clamp(f64::from(spec.quality)),
            max_context: spec.max_context,
            tags: spec.tags.iter().cloned().collect(),
            daily_cap: spec.daily_cap,
        });
    }

    Ok(registry)
}
