//! potat-eval - sandboxed remote JavaScript evaluation service

mod cli;
mod config;
mod context;
mod error;
mod fetch;
mod logging;
mod pipeline;
mod sandbox;
mod server;
mod store;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use cli::{Cli, Commands};
use config::Settings;

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Worker(args) => cmd_worker(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn cmd_serve(cli: &Cli, args: &cli::ServeArgs) -> Result<()> {
    let mut log_config = logging::LogConfig::for_server();
    log_config.filter = cli.log_level.clone();
    logging::init(log_config.with_env_overrides());

    let settings = Settings::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime
        .block_on(server::run_server(settings))
        .context("server error")?;

    Ok(())
}

fn cmd_worker(args: &cli::WorkerArgs) -> Result<()> {
    logging::init(logging::LogConfig::for_worker().with_env_overrides());

    let settings =
        Settings::from_worker_arg(&args.settings).context("invalid worker settings blob")?;

    // Never returns.
    worker::worker_main::run_worker_main(settings)
}
