//! Command-line interface for the `racestream` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ConfigCommand, EventsCommand, LeaderboardCommand, WatchCommand};

use crate::logging::Verbosity;

/// racestream - Follow a race's live telemetry stream
///
/// Connects to the race cloud service, keeps the live stream up across
/// network failures, and prints checkpoint notifications as vehicles pass.
#[derive(Debug, Parser)]
#[command(name = "racestream")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Follow an event's live stream until interrupted
    Watch(WatchCommand),

    /// List events
    Events(EventsCommand),

    /// Print an event's current leaderboard
    Leaderboard(LeaderboardCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Verbosity selected by `-q` / `-v`.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}
