mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use dagforge_core::{AgentRegistry, CancellationRegistry, ConfigStore, EventBus, Repository};
use dagforge_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use dagforge_orchestrator::{Executor, Planner, Scheduler};
use dagforge_providers::ProviderRegistry;
use dagforge_tools::ToolRegistry;

use server::AppState;

#[derive(Parser, Debug)]
#[command(name = "dagforge-engine")]
#[command(about = "Headless DAG planner/executor/scheduler backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    Plan {
        goal_text: String,
        #[arg(long)]
        agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let state_dir = resolve_state_dir(None);
    let _log_guard = match init_process_logging(ProcessKind::Engine, &canonical_logs_dir_from_root(&state_dir), 14) {
        Ok((guard, info)) => {
            tracing::info!(?info, "engine logging initialized");
            Some(guard)
        }
        Err(err) => {
            tracing_subscriber::fmt().with_env_filter("info").init();
            tracing::warn!(error = %err, "falling back to console-only logging");
            None
        }
    };

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir: state_dir_flag,
        } => {
            let state_dir = resolve_state_dir(state_dir_flag);
            let (repository, planner, executor, scheduler) = build_components(&state_dir).await?;
            scheduler.restore().await;

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            info!("starting dagforge-engine on http://{addr}");

            let app = server::router(AppState {
                repository,
                planner,
                executor,
                scheduler,
            });
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
        Command::Plan { goal_text, agent } => {
            let state_dir = resolve_state_dir(None);
            let (_repository, planner, _executor, _scheduler) = build_components(&state_dir).await?;
            let dag_id = uuid::Uuid::new_v4().to_string();
            let result = planner.plan(&dag_id, &goal_text, agent.as_deref(), None).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "outcome": format!("{:?}", result.outcome),
                    "dag_id": result.dag_id,
                    "title": result.title,
                }))?
            );
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("DAGFORGE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".dagforge")
}

async fn build_components(
    state_dir: &PathBuf,
) -> anyhow::Result<(Arc<Repository>, Planner, Arc<Executor>, Scheduler)> {
    let repository = Arc::new(Repository::new(state_dir.join("storage")).await?);
    let config_store = ConfigStore::new(state_dir.join("config.json"), None).await?;
    let config = config_store.get().await;

    let events = EventBus::new();
    let providers = ProviderRegistry::new(config.clone().into());
    let agents = AgentRegistry::new(".").await?;
    let tools = ToolRegistry::new();
    let cancellations = CancellationRegistry::new();

    let executor = Arc::new(Executor::new(
        tools.clone(),
        providers.clone(),
        repository.clone(),
        events.clone(),
        cancellations,
    ));
    let scheduler = Scheduler::new(repository.clone(), executor.clone());
    let planner = Planner::new(
        providers,
        agents,
        tools,
        repository.clone(),
        events,
        scheduler.clone(),
        config.planner,
    );

    Ok((repository, planner, executor, scheduler))
}
