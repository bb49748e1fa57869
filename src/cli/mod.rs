pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::AppConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP control surface
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a job in the foreground
    Run {
        /// Number of cycles (0 = until stopped or out of time)
        #[arg(short, long, default_value_t = 1)]
        cycles: u32,

        /// Maximum run duration in hours
        #[arg(long)]
        hours: Option<f64>,

        /// Seconds to pause between cycles
        #[arg(short, long)]
        pause: Option<u64>,

        /// Fill application forms without submitting or saving state
        #[arg(long)]
        dry_run: bool,

        /// Show the browser window
        #[arg(long)]
        visible: bool,

        /// Clear a running flag left behind by a crashed process
        #[arg(long)]
        reset: bool,
    },

    /// Show the persisted job status
    Status,

    /// Ask the running job to stop after its current cycle
    Stop,

    /// Show listings from the latest snapshot
    Houses {
        /// One tagged line per listing
        #[arg(short, long)]
        list: bool,
    },

    /// Show the effective configuration
    Config,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            info!("Starting control surface on port {}", config.server.port);
            commands::serve(config).await
        }
        Commands::Run {
            cycles,
            hours,
            pause,
            dry_run,
            visible,
            reset,
        } => {
            if let Some(pause) = pause {
                config.job.cycle_pause_secs = pause;
            }
            if dry_run {
                config.job.dry_run = true;
            }
            if visible {
                config.browser.headless = false;
            }
            info!("Running {} cycle(s) in the foreground", cycles);
            commands::run(config, cycles, hours, reset).await
        }
        Commands::Status => commands::status(config),
        Commands::Stop => commands::stop(config),
        Commands::Houses { list } => commands::houses(config, list),
        Commands::Config => commands::show_config(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "housebot", "--verbose", "run", "--cycles", "3", "--hours", "0.5", "--dry-run",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                cycles,
                hours,
                dry_run,
                visible,
                ..
            } => {
                assert_eq!(cycles, 3);
                assert_eq!(hours, Some(0.5));
                assert!(dry_run);
                assert!(!visible);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["housebot", "houses", "--list", "--config", "bot.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("bot.yaml")));
        assert!(matches!(cli.command, Commands::Houses { list: true }));
    }
}
