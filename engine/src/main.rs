use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use showrunner_core::{CoreConfig, Engine};
use showrunner_server::{serve, AppState};
use showrunner_types::EventType;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "showrunner-engine")]
#[command(about = "Headless Showrunner orchestration backend")]
struct Cli {
    /// Path to a JSON config file; defaults apply when absent.
    #[arg(long, env = "SHOWRUNNER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine with the HTTP control surface.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3600)]
        port: u16,
        /// Directory for the database and logs.
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Create a project from a global-spec JSON file and print its id.
    Create {
        spec_file: PathBuf,
        #[arg(long)]
        budget_total: Option<f64>,
    },
    /// Replay a project's events to stdout for post-mortem inspection.
    Replay {
        project_id: String,
        /// Comma-separated event-type filter.
        #[arg(long)]
        types: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = state_dir.unwrap_or_else(|| PathBuf::from(".showrunner"));
            let (log_info, guard) =
                showrunner_observability::init_logging("engine", &state_dir.join("logs"), 14)?;
            showrunner_observability::hold_log_guard(guard);
            info!(logs_dir = %log_info.logs_dir, "logging initialized");

            let mut config = CoreConfig::load(cli.config.as_deref(), None).await?;
            if config.blackboard.db_path == PathBuf::from("showrunner.db") {
                config.blackboard.db_path = state_dir.join("showrunner.db");
            }

            let engine = Arc::new(Engine::new(config).await?);
            engine.start().await?;

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            serve(addr, AppState::new(engine.clone())).await?;
            engine.shutdown().await;
        }
        Command::Create {
            spec_file,
            budget_total,
        } => {
            let config = CoreConfig::load(cli.config.as_deref(), None).await?;
            let engine = Engine::new(config).await?;

            let raw = tokio::fs::read_to_string(&spec_file)
                .await
                .with_context(|| format!("read {}", spec_file.display()))?;
            let spec = serde_json::from_str(&raw).context("parse global spec")?;
            let project_id = engine.create_project(spec, budget_total).await?;
            println!("{project_id}");
        }
        Command::Replay { project_id, types } => {
            let config = CoreConfig::load(cli.config.as_deref(), None).await?;
            let engine = Engine::new(config).await?;

            let types: Option<Vec<EventType>> = match types {
                Some(raw) => Some(
                    raw.split(',')
                        .filter(|s| !s.is_empty())
                        .map(|name| {
                            EventType::parse(name.trim())
                                .with_context(|| format!("unknown event type `{name}`"))
                        })
                        .collect::<anyhow::Result<_>>()?,
                ),
                None => None,
            };

            let events = engine
                .replay_events(&project_id, types.as_deref(), None, None)
                .await?;
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }
    Ok(())
}
