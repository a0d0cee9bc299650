use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use perch_common::observability::{init_logging, LogConfig, LogFormat};
use perch_config::{PerchConfig, PerchConfigLoader};
use tracing::info;

mod wiring;

#[derive(Parser, Debug)]
#[command(name = "perch", about = "Relay social feeds into a chat, at most once.")]
struct Cli {
    /// Path to the configuration file (TOML/YAML).
    #[arg(long, default_value = "perch.toml", env = "PERCH_CONFIG")]
    config: PathBuf,

    /// Override the log output directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Emit JSON-encoded logs instead of text.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg: PerchConfig = PerchConfigLoader::new().with_file(&cli.config).load()?;

    init_logging(LogConfig {
        log_dir: cli.log_dir,
        format: if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
        ..LogConfig::default()
    })?;

    let scheduler = wiring::build(&cfg).await?;
    info!("perch started");

    scheduler.run_until_ctrl_c().await?;
    info!("perch stopped");
    Ok(())
}
