mod commands;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use warden::units::parse_duration;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Minimal service supervisor with restart policies and an update watcher")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise every service in a unit file until SIGINT/SIGTERM
    Run {
        /// Path to the compose-style unit file
        file: PathBuf,

        /// Time between update checks (overrides POLL_INTERVAL), e.g. "3600" or "1h"
        #[arg(long, value_parser = parse_interval)]
        interval: Option<Duration>,

        /// Prune old definitions after updating (same as CLEANUP=true)
        #[arg(long)]
        cleanup: bool,

        /// Also check units that are not running (same as INCLUDE_STOPPED=true)
        #[arg(long)]
        include_stopped: bool,

        /// Start stopped units after updating them (same as REVIVE_STOPPED=true)
        #[arg(long)]
        revive_stopped: bool,

        /// Do not run the update watcher
        #[arg(long)]
        no_watch: bool,
    },

    /// Parse a unit file and display its services
    Check {
        /// Path to the compose-style unit file
        file: PathBuf,
    },
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    match parse_duration(s) {
        Some(d) if !d.is_zero() => Ok(d),
        Some(_) => Err("interval must be greater than zero".to_string()),
        None => Err(format!("invalid interval: {}", s)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Command::Run {
            file,
            interval,
            cleanup,
            include_stopped,
            revive_stopped,
            no_watch,
        } => {
            let overrides = commands::WatchOverrides {
                interval,
                cleanup,
                include_stopped,
                revive_stopped,
                no_watch,
            };
            commands::run(&file, overrides).await?;
        }
        Command::Check { file } => {
            commands::check(&file).await?;
        }
    }

    Ok(())
}
