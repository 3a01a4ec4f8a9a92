//! pcrun - evaluate JavaScript in a supervised Node.js process
//!
//! Preloads an optional script, then evaluates each expression argument in
//! order and prints its JSON result (or `undefined`) on its own line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use pcruntime::config::DEFAULT_MAX_CONNECTIONS;
use pcruntime::runtime::NODE_COMMANDS;
use pcruntime::{Runtime, RuntimeConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "pcruntime=info,pcrun=info";

#[derive(Parser, Debug)]
#[command(name = "pcrun")]
#[command(about = "Evaluate JavaScript in a supervised Node.js process")]
struct Cli {
    /// Expressions to evaluate, in order
    #[arg(value_name = "EXPR", required = true)]
    expressions: Vec<String>,

    /// Script file loaded into the context before evaluating
    #[arg(long)]
    preload: Option<PathBuf>,

    /// Treat each argument as a statement block instead of an expression
    #[arg(long)]
    exec: bool,

    /// Runtime command candidates, tried in order
    #[arg(long = "command", value_name = "COMMAND")]
    commands: Vec<String>,

    /// Runner script to use instead of the bundled one
    #[arg(long)]
    runner: Option<PathBuf>,

    /// Maximum simultaneously open connections
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Respawns allowed per evaluation before giving up
    #[arg(long, default_value = "3")]
    max_recoveries: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "600")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(err) = run(Cli::parse()).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = RuntimeConfig {
        max_connections: cli.max_connections,
        max_recoveries: cli.max_recoveries,
        request_timeout: Duration::from_secs(cli.timeout_secs),
        ..RuntimeConfig::default()
    };

    let commands = if cli.commands.is_empty() {
        NODE_COMMANDS.iter().map(|c| c.to_string()).collect()
    } else {
        cli.commands
    };
    let mut runtime = Runtime::new("pcrun", commands).with_config(config);
    if let Some(runner) = cli.runner {
        runtime = runtime.with_runner(runner);
    }

    let preload = match &cli.preload {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => String::new(),
    };

    let context = runtime.compile(&preload).await.context("starting runtime")?;
    info!("Runtime started at {}", context.handle().endpoint().socket.display());

    let mut outcome: anyhow::Result<()> = Ok(());
    for expression in &cli.expressions {
        let result = if cli.exec {
            context.exec(expression).await
        } else {
            context.eval(expression).await
        };
        match result {
            Ok(Some(value)) => println!("{value}"),
            Ok(None) => println!("undefined"),
            Err(err) => {
                outcome = Err::<(), _>(err).with_context(|| format!("evaluating {expression:?}"));
                break;
            }
        }
    }

    context.release().await;
    outcome
}
