use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use gatherer::agent;
use gatherer::config::AgentConfig;
use gatherer::logging::setup_logger;
use gatherer::storage::{SqliteStorage, Storage};
use gatherer::{Registry, VecSink};

#[derive(Parser, Debug)]
#[command(author, version, about = "Collect metrics from configured inputs", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "gatherer.toml")]
    config: PathBuf,

    /// Run every input once and print the metrics as JSON lines
    #[arg(long)]
    once: bool,

    /// List available input types with their sample configuration
    #[arg(long)]
    list: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logger(args.verbose)?;

    let registry = Registry::builtin()?;

    if args.list {
        let empty = Default::default();
        for type_name in registry.types() {
            let collector = registry.create(type_name, &empty)?;
            println!("[[inputs]]\n  type = \"{}\"  # {}", type_name, collector.describe());
            println!("{}", collector.sample_config());
        }
        return Ok(());
    }

    let config = AgentConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut inputs = agent::build_inputs(&registry, &config)?;
    if inputs.is_empty() {
        anyhow::bail!("no inputs configured in {}", args.config.display());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
            }
            shutdown.cancel();
        });
    }

    if args.once {
        let sink = VecSink::new();
        let failures = agent::gather_once(&mut inputs, &sink, &shutdown).await;
        for metric in sink.take() {
            println!("{}", serde_json::to_string(&metric)?);
        }
        if failures > 0 {
            anyhow::bail!("{failures} input(s) failed");
        }
        return Ok(());
    }

    let storage = SqliteStorage::new(config.database_path());
    storage
        .initialize()
        .with_context(|| format!("opening database {}", storage.path().display()))?;
    tracing::info!(database = %storage.path().display(), "database ready");

    agent::run(
        inputs,
        Arc::new(storage),
        config.agent.flush_interval(),
        shutdown,
    )
    .await;

    Ok(())
}
