use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use observability::{init_metrics, init_tracing};

mod bootstrap;
mod clan_forward;
mod config_loader;
mod target_sources;
mod war_loop;

use bootstrap::AppState;

#[derive(Parser, Debug)]
#[command(name = "war-tracker", version, about = "Clan war polling and finalization")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll current wars, register them and store final results
    War,
    /// Forward registered clans' profiles to the message bus
    Clans,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Falls back to WAR_TRACKER_CONFIG_PATH, then configs/tracker.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, env = "WAR_TRACKER_DB_PATH", default_value = "data/wars.sqlite")]
    db_path: PathBuf,
    #[arg(long, global = true, env = "WAR_TRACKER_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing("tracker_runner");
    let prometheus = init_metrics()?;

    let cfg = config_loader::load_tracker_config(cli.common.config.as_deref())
        .context("load tracker config")?;
    let store = bootstrap::open_store(&cli.common.db_path)?;

    let service = match cli.command {
        Command::War => "war",
        Command::Clans => "clans",
    };
    let listener = tokio::net::TcpListener::bind(cli.common.bind)
        .await
        .with_context(|| format!("bind {}", cli.common.bind))?;
    let http = tokio::spawn(bootstrap::serve_http(
        listener,
        AppState {
            service,
            prometheus,
        },
    ));

    match cli.command {
        Command::War => {
            let war_loop = bootstrap::build_war_loop(&cfg, store)?;
            tokio::select! {
                _ = war_loop.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(pending = war_loop.scheduler().pending(), "shutting down");
                    war_loop.scheduler().shutdown();
                }
            }
        }
        Command::Clans => {
            let runner = bootstrap::build_clan_runner(&cfg, store)?;
            tokio::select! {
                _ = runner.run() => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
            }
        }
    }

    http.abort();
    Ok(())
}
