use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use overround::app::{self, Config};

#[derive(Parser)]
#[command(name = "overround", about = "Cross-venue prediction market trading engine")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading engine (default).
    Run {
        /// Force paper mode regardless of configuration.
        #[arg(long)]
        paper: bool,
    },
    /// Validate the configuration and credentials, then exit.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Missing file falls back to defaults (paper mode); a present but
    // invalid file is fatal.
    let mut config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    config.init_logging();

    match cli.command.unwrap_or(Command::Run { paper: false }) {
        Command::Check => {
            if let Err(e) = config.validate() {
                error!(error = %e, "configuration invalid");
                return ExitCode::FAILURE;
            }
            if !config.account.paper {
                for venue in [overround::domain::Venue::Direct, overround::domain::Venue::Proxied] {
                    if let Err(e) = config.credentials(venue) {
                        error!(error = %e, "credential check failed");
                        return ExitCode::FAILURE;
                    }
                }
            }
            info!("configuration ok");
            ExitCode::SUCCESS
        }
        Command::Run { paper } => {
            if paper {
                config.account.paper = true;
            }
            info!(paper = config.account.paper, "overround starting");
            match app::run(config).await {
                Ok(()) => {
                    info!("overround stopped");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "fatal error");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
