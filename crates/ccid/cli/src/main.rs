use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod session;

use commands::*;
use session::ReaderSession;

#[derive(Parser)]
#[command(version, about = "Talk to SpringCard CCID readers without a PC/SC driver")]
struct Cli {
    /// Reader serial number or name fragment (first reader if not specified)
    #[arg(short, long)]
    reader: Option<String>,

    /// Configuration file (defaults to ~/.springcard/ccid.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Secure channel key in hex, overrides the configuration file
    #[arg(long)]
    key: Option<String>,

    /// Secure channel key index
    #[arg(long, default_value_t = 0, requires = "key")]
    key_index: u8,

    /// Do not power cards automatically
    #[arg(long)]
    no_auto_connect: bool,

    /// Debug level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    List,

    /// Show reader information and slot states
    Info,

    /// Print the ATR of a card, powering it if needed
    Atr {
        /// Slot index
        #[arg(default_value_t = 0)]
        slot: u8,
    },

    /// Send an APDU to a card
    Transmit {
        /// Slot index
        slot: u8,

        /// Command APDU in hex
        apdu: String,
    },

    /// Send a raw escape command to the reader
    Control {
        /// Escape command in hex
        command: String,
    },

    /// Power off a card
    PowerOff {
        /// Slot index
        slot: u8,
    },

    /// Show power source and battery level
    PowerStatus,

    /// Switch the reader off
    Shutdown,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Commands::List = cli.command {
        return list_command();
    }

    let mut config = config::load_config(cli.config.as_deref())?;
    if let Some(key) = &cli.key {
        config.session.secure_channel = Some(config::parse_key(key, cli.key_index)?);
    }
    if cli.no_auto_connect {
        config.session.auto_connect = false;
    }
    let reader = cli.reader.or(config.reader);

    let session = ReaderSession::open(reader.as_deref(), config.session)?;
    let result = match &cli.command {
        Commands::List => Ok(()),
        Commands::Info => info_command(&session),
        Commands::Atr { slot } => atr_command(&session, *slot),
        Commands::Transmit { slot, apdu } => transmit_command(&session, *slot, apdu),
        Commands::Control { command } => control_command(&session, command),
        Commands::PowerOff { slot } => power_off_command(&session, *slot),
        Commands::PowerStatus => power_status_command(&session),
        Commands::Shutdown => shutdown_command(&session),
    };

    session.close()?;
    result
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .init();
}
