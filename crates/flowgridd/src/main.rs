//! flowgridd, the flowgrid daemon.
//!
//! # Usage
//!
//! ```text
//! flowgridd serve --config /etc/flowgrid/flowgrid.toml
//! flowgridd deploy nightly-etl --cron "0 2 * * *" --tag etl
//! flowgridd preview --every 900 --min-runs 5
//! ```

mod commands;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flowgrid_core::{LogFormat, ResolvedSettings, Settings};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::commands::{DeployArgs, PreviewArgs};

#[derive(Parser)]
#[command(name = "flowgridd", about = "flowgrid scheduling daemon")]
struct Cli {
    /// Settings file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the enabled housekeeping services until Ctrl-C.
    Serve,
    /// Register or replace a deployment in the store.
    Deploy(DeployArgs),
    /// Print the run times a schedule would produce. Touches no store.
    Preview(PreviewArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (settings, unknown_env) = load_settings(cli.config.as_deref())?;
    init_tracing(&settings);
    for key in unknown_env {
        warn!(%key, "ignoring unknown environment override");
    }

    match cli.command {
        Command::Serve => serve::run(settings).await,
        Command::Deploy(args) => commands::deploy(&settings, args),
        Command::Preview(args) => commands::preview(&settings, args),
    }
}

fn load_settings(path: Option<&std::path::Path>) -> anyhow::Result<(ResolvedSettings, Vec<String>)> {
    let mut settings = match path {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    let unknown = settings.apply_process_env()?;
    let user_home = std::env::var_os("HOME").map(PathBuf::from);
    Ok((settings.resolve(user_home.as_deref())?, unknown))
}

fn init_tracing(settings: &ResolvedSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
