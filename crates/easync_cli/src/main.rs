//! easync CLI
//!
//! Command-line tools for inspecting and repairing device state.
//!
//! # Commands
//!
//! - `devices` - List known devices
//! - `cache` - Dump the sync cache of a device
//! - `states` - List the synchronization state rows of a device
//! - `reset` - Remove synchronization state, forcing a resync
//! - `wipe` - Request a remote wipe

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use easync_state::FileBackend;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// easync device state tools.
#[derive(Parser)]
#[command(name = "easync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the state directory
    #[arg(global = true, short, long)]
    state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format
    #[arg(global = true, short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known devices
    Devices,

    /// Dump the sync cache of a device
    Cache {
        /// Device id
        device: String,
        /// User name
        user: String,
    },

    /// List the synchronization state rows of a device
    States {
        /// Device id
        device: String,
    },

    /// Remove synchronization state, forcing the device to resync
    Reset {
        /// Device id
        device: String,
        /// User name
        user: String,
        /// Only reset this collection; the sync cache is kept
        #[arg(short, long)]
        collection: Option<String>,
    },

    /// Mark a remote wipe as pending
    Wipe {
        /// Device id
        device: String,
        /// User name
        user: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let state_dir = cli.state_dir.ok_or("State directory required (--state-dir)")?;
    if !state_dir.is_dir() {
        return Err(format!("No state directory at {}", state_dir.display()).into());
    }
    let backend = FileBackend::open(&state_dir)?;

    match cli.command {
        Commands::Devices => commands::devices::run(&backend, cli.format)?,
        Commands::Cache { device, user } => {
            commands::cache::run(&backend, &device, &user, cli.format)?
        }
        Commands::States { device } => commands::states::run(&backend, &device, cli.format)?,
        Commands::Reset {
            device,
            user,
            collection,
        } => commands::reset::run(&backend, &device, &user, collection.as_deref(), cli.format)?,
        Commands::Wipe { device, user } => {
            commands::wipe::run(&backend, &device, &user, cli.format)?
        }
    }

    Ok(())
}
