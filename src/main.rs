mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use herald::config::Config;
use herald::error::HeraldErrorTrait;

#[derive(Parser)]
#[command(
    name = "herald",
    version,
    about = "Publishes new feed items to a channel on a pacing or fixed-slot schedule",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (environment variables when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides logging.format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the publication daemon
    Run {
        /// Log publications instead of sending them
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Run a single cycle and exit
        #[arg(long, default_value = "false")]
        once: bool,
    },

    /// Show state statistics and the next eligible instant
    Status,

    /// Create a backup of the state file
    Backup,

    /// List state backups, newest first
    Backups,

    /// Restore the state file from a backup
    Restore {
        /// Backup file path
        path: PathBuf,
    },

    /// Print the next fixed publication slot
    NextSlot {
        /// Comma-separated slots, e.g. "09:00,18:30"
        #[arg(short, long)]
        schedule: Option<String>,

        /// UTC offset, e.g. "+03:00"
        #[arg(short, long)]
        utc_offset: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    // Initialize tracing/logging
    let log_format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(log_format, &config.logging.level, cli.verbose)?;

    config.validate()?;

    match cli.command {
        Commands::Run { dry_run, once } => {
            tracing::info!(dry_run = %dry_run, once = %once, "Starting run command");
            commands::run(config, commands::RunOptions { dry_run, once }).await?;
        }

        Commands::Status => commands::status(&config).map_err(report)?,

        Commands::Backup => commands::backup(&config).map_err(report)?,

        Commands::Backups => commands::backups(&config).map_err(report)?,

        Commands::Restore { path } => {
            tracing::info!(path = %path.display(), "Starting restore command");
            commands::restore(&config, &path).map_err(report)?;
        }

        Commands::NextSlot {
            schedule,
            utc_offset,
        } => commands::next_slot(&config, schedule.as_deref(), utc_offset.as_deref())
            .map_err(report)?,
    }

    Ok(())
}

/// Log a command failure with its category before it ends the process
fn report(err: herald::error::Error) -> anyhow::Error {
    tracing::error!(
        category = err.category().as_str(),
        recoverable = err.is_recoverable(),
        "{err}"
    );
    err.into()
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("herald=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("herald={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
