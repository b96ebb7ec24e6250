use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rr_runner::{RunnerConfig, Runner};
use rr_storage::LocalFileStorage;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "RUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory standing in for the upstream object store in local/dev runs.
    #[arg(long, env = "RUNNER_UPSTREAM_DIR", default_value = "./upstream")]
    upstream_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rr_runner::logging::init_logging()?;

    let cli = Cli::parse();
    let config = RunnerConfig::load(cli.config.as_deref()).context("loading configuration")?;

    fs_err::create_dir_all(&cli.upstream_dir)?;
    let storage = Arc::new(LocalFileStorage::new(cli.upstream_dir));

    let runner = Runner::bootstrap(&config, storage).await?;
    tracing::info!(
        cache_hits = runner.cache.cache_hits(),
        "runnerd started, awaiting shutdown signal"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    Ok(())
}
