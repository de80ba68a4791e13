use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Self-Imposed Website Access Gate
///
/// Maintains a blocklist exemption whitelist with expiry timers, gated
/// by a pin or a remote authorization backend.
#[derive(Parser, Debug)]
#[command(name = "sitegate")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file (platform default when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check whether a URL is currently blocked
    Check {
        /// URL to check
        url: String,
    },
    /// Unblock a URL with the pin or via remote authorization
    Unblock {
        /// URL to unblock
        url: String,

        /// Unblock duration in hours; negative means forever
        #[arg(long)]
        hours: Option<f64>,

        /// Pin to present
        #[arg(long)]
        pin: Option<String>,

        /// Ask the configured authorization backend instead of using a pin
        #[arg(long)]
        auth: bool,
    },
    /// Re-block a URL by removing its whitelist entry
    Block {
        /// URL to block again
        url: String,
    },
    /// Suspend all blocking for the given number of hours (0 reinstates)
    UnblockAll {
        /// Hours to keep everything unblocked
        hours: f64,
    },
    /// Pin management
    Pin {
        #[command(subcommand)]
        command: PinCommands,
    },
    /// Show pin, override, and whitelist state
    Status,
    /// Run in the foreground, keeping expiry timers live
    Run,
}

#[derive(Subcommand, Debug)]
pub enum PinCommands {
    /// Set or rotate the pin
    Set {
        /// New pin
        new: String,

        /// Current pin (omit on first set)
        #[arg(long)]
        old: Option<String>,
    },
    /// Check whether a pin is configured
    Status,
}
