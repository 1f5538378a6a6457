//! Command-line entry point for the Redis Flow Bridge

use clap::{Parser, Subcommand};
use redis_flow_bridge::{
    cli::{CheckArgs, RunArgs},
    init_logger_with_config, log_debug, log_error, log_info,
    runtime::run_with_runtime,
    BridgeConfig,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "redis-flow-bridge")]
#[command(about = "Pooled Redis connections for subscriber, publisher and lookup flow nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Bridge configuration file (defaults to ./config.yml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow, reading messages from stdin and writing node events to stdout
    #[command(name = "run")]
    Run(RunArgs),

    /// Validate a flow file and print its endpoints
    #[command(name = "check")]
    Check(CheckArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load_config(cli.config.as_deref())?;
    if cli.verbose {
        config.log_level = "debug".to_string();
    } else if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    init_logger_with_config(&config.log_level, config.logging.file_dir.as_deref());
    log_debug!(
        "Store backend: {:?}, runtime: {}",
        config.store.backend,
        config.runtime.mode
    );

    let runtime_config = config.runtime.clone();
    run_with_runtime(&runtime_config, async_main(cli.command, config))
}

async fn async_main(command: Commands, config: BridgeConfig) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => {
            log_info!("Starting Redis Flow Bridge {}", env!("CARGO_PKG_VERSION"));
            if let Err(e) = args.execute(&config).await {
                log_error!("Flow error: {:#}", e);
                std::process::exit(1);
            }
        }
        Commands::Check(args) => {
            if let Err(e) = args.execute() {
                log_error!("Check failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
