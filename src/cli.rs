use clap::{Parser, Subcommand};

/// Brokerage order lifecycle and ledger engine
#[derive(Debug, Parser)]
#[command(name = "tally", version, about)]
pub struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config", env = "TALLY_CONFIG_DIR")]
    pub config_dir: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the engine: evaluator, schedulers and health server
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Validate the configuration and exit
    CheckConfig,
}
