//! txdisk CLI
//!
//! Offline tools for txdisk instance directories. None of the commands
//! modify the instance; run them while the engine is stopped.
//!
//! # Commands
//!
//! - `inspect` - Segments and entry counts per type
//! - `dump-log` - Every log entry, as text or JSON
//! - `verify` - Framing and checksum check
//! - `pending` - What recovery would do at the next boot

mod commands;
mod error;

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// txdisk instance tools.
#[derive(Parser)]
#[command(name = "txdisk")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(global = true, short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show log segments and entry counts per type
    Inspect {
        /// Instance directory
        dir: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print every log entry
    DumpLog {
        /// Instance directory
        dir: PathBuf,

        /// Print one JSON object per line
        #[arg(long)]
        json: bool,

        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Check framing and checksums of every segment
    Verify {
        /// Instance directory
        dir: PathBuf,
    },

    /// List transactions recovery would act on
    Pending {
        /// Instance directory
        dir: PathBuf,
    },

    /// Show version information
    Version,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Inspect { dir, json } => commands::inspect::run(&dir, json),
        Commands::DumpLog { dir, json, limit } => commands::dump_log::run(&dir, json, limit),
        Commands::Verify { dir } => commands::verify::run(&dir),
        Commands::Pending { dir } => commands::pending::run(&dir),
        Commands::Version => {
            println!("txdisk CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("log format v{}", txdisk_core::log::LOG_VERSION);
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}
