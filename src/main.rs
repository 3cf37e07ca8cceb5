//! ralphd - agentic build orchestrator daemon
//!
//! Runs the dashboard server and the per-project pipelines. Projects that
//! were running when the process last exited are resumed automatically.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ralphd::cli::{Cli, Command, ServeArgs, ValidateArgs};
use ralphd::config::AppConfig;
use ralphd::gate::NodeSyntaxGate;
use ralphd::llm::HttpBackend;
use ralphd::orchestrator::Orchestrator;
use ralphd::plan::Plan;
use ralphd::server;
use ralphd::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    // Local .env for developer workflows; process environment wins.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Validate(args)) => validate(args).await,
        Some(Command::Serve(args)) => serve(args).await,
        None => serve(ServeArgs::default()).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = AppConfig::from_env()?;
    tracing::info!(?config, "Loaded configuration");

    let store = Arc::new(Store::open(&args.data_file).await?);

    // CODEX_COMMAND overrides the persisted codexPath setting.
    if let Some(command) = &config.codex_command {
        let mut settings = store.settings().await;
        if settings.codex_path != *command {
            settings.codex_path = command.clone();
            store.update_settings(settings).await?;
        }
    }

    let projects_dir = match args.projects_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?.join("Projects"),
    };

    let orchestrator = Orchestrator::new(
        store,
        Arc::new(HttpBackend::new(&config.llm)),
        Arc::new(NodeSyntaxGate),
        projects_dir,
    );

    orchestrator.reinit_chat().await;
    orchestrator.resume_on_start().await;

    let shutdown = {
        let orchestrator = orchestrator.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("SIGINT received; stopping pipelines");
            orchestrator.stop_all();
        }
    };

    server::serve(orchestrator, &args.hostname, args.port, shutdown).await
}

async fn validate(args: ValidateArgs) -> Result<()> {
    let content = tokio::fs::read_to_string(&args.plan)
        .await
        .with_context(|| format!("failed to read {}", args.plan.display()))?;
    let plan: Plan = serde_json::from_str(&content).context("plan is not valid JSON")?;
    plan.verify_invariants()?;

    println!(
        "{}: {} stages, {} stories ({} passed)",
        args.plan.display(),
        plan.stages.len(),
        plan.total_stories(),
        plan.passed_stories(),
    );
    Ok(())
}
