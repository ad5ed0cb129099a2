//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Arguments for `racestream watch`.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Event to follow
    pub event_id: String,

    /// Notify on every vehicle's checkpoint crossings
    #[arg(short, long)]
    pub all: bool,

    /// Notify on this vehicle's crossings (repeatable)
    #[arg(long = "vehicle", value_name = "ID")]
    pub vehicles: Vec<String>,

    /// Treat this vehicle as selected
    #[arg(long, value_name = "ID")]
    pub select: Option<String>,

    /// Print notifications and the final summary as JSON lines
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `racestream events`.
#[derive(Debug, Args)]
pub struct EventsCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `racestream leaderboard`.
#[derive(Debug, Args)]
pub struct LeaderboardCommand {
    /// Event whose leaderboard to fetch
    pub event_id: String,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
