mod commands;

use anyhow::Result;
use clap::Parser;

use emberlm_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Generate(args) => commands::generate::run(args).await,

        Commands::Info {
            weights,
            vocab,
            accelerator,
        } => commands::info::run(weights.as_deref(), vocab.as_deref(), accelerator).await,
    }
}
