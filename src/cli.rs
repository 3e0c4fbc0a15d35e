//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// potat-eval - sandboxed remote JavaScript evaluation service
#[derive(Parser, Debug)]
#[command(name = "potat-eval", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log filter, e.g. "debug" or "potat_eval=trace"
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the evaluation service
    Serve(ServeArgs),

    /// Internal worker subprocess mode (spawned by the service)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    /// Serialized settings handed over by the parent process
    #[arg(long)]
    pub settings: String,
}
