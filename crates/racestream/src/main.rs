//! `racestream` - CLI for following a race's live telemetry stream
//!
//! This binary provides the command-line interface for watching an event's
//! live stream and for querying the race service's REST endpoints.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use racestream::cli::{Cli, Command, ConfigCommand, EventsCommand, LeaderboardCommand, WatchCommand};
use racestream::{
    init_logging, ApiClient, ClientSnapshot, Config, ConnectionStatus, HttpTransport,
    LeaderboardEntry, Notification, StreamClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity());

    let config_path = cli.config.clone();
    let load = || Config::load_from(config_path.clone()).context("failed to load configuration");

    match cli.command {
        Command::Watch(cmd) => handle_watch(&load()?, &cmd).await,
        Command::Events(cmd) => handle_events(&load()?, &cmd).await,
        Command::Leaderboard(cmd) => handle_leaderboard(&load()?, &cmd).await,
        Command::Config(ConfigCommand::Path) => {
            println!("{}", Config::default_config_path().display());
            Ok(())
        }
        Command::Config(ConfigCommand::Validate { file }) => {
            handle_validate(file.or(cli.config));
            Ok(())
        }
        Command::Config(ConfigCommand::Show { json }) => handle_show(&load()?, json),
    }
}

async fn handle_watch(config: &Config, cmd: &WatchCommand) -> anyhow::Result<()> {
    let mut session = config.session_config();
    if cmd.all {
        session.interest.show_all = true;
    }
    if !cmd.vehicles.is_empty() {
        session.interest.watched = cmd.vehicles.iter().cloned().collect();
    }
    if cmd.select.is_some() {
        session.interest.selected.clone_from(&cmd.select);
    }

    let transport = Arc::new(HttpTransport::new(&config.server)?);
    let api = ApiClient::new(&config.server)?;
    let (handle, mut notifications) = StreamClient::start(session, transport);
    handle.subscribe(cmd.event_id.clone())?;

    // Bootstrap the leaderboard; a streamed one takes precedence.
    let seeder = handle.clone();
    let event_id = cmd.event_id.clone();
    tokio::spawn(async move {
        match api.leaderboard(&event_id).await {
            Ok(payload) => {
                let _ = seeder.seed_leaderboard(event_id, payload);
            }
            Err(err) => warn!(event_id = %event_id, error = %err, "Leaderboard bootstrap failed"),
        }
    });

    let mut status = handle.status();
    follow(&mut notifications, &mut status, shutdown_signal(), cmd.json).await?;

    let summary = handle.snapshot().await?;
    handle.shutdown().await;
    print_summary(&summary, cmd.json)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Print notifications and status transitions until `shutdown` resolves or
/// the client goes away.
async fn follow(
    notifications: &mut mpsc::Receiver<Notification>,
    status: &mut watch::Receiver<ConnectionStatus>,
    shutdown: impl Future<Output = ()>,
    json: bool,
) -> anyhow::Result<()> {
    tokio::pin!(shutdown);
    let mut last_state = None;
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            Some(notification) = notifications.recv() => {
                print_notification(&notification, json)?;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                let key = (current.state, current.metrics.is_degraded);
                if last_state != Some(key) {
                    last_state = Some(key);
                    print_status(&current, json)?;
                }
            }
        }
    }
    Ok(())
}

fn print_notification(notification: &Notification, json: bool) -> anyhow::Result<()> {
    if json {
        let line = serde_json::json!({ "type": "checkpoint", "notification": notification });
        println!("{}", serde_json::to_string(&line)?);
    } else {
        println!("[{}] {notification}", notification.reason);
    }
    Ok(())
}

fn print_status(status: &ConnectionStatus, json: bool) -> anyhow::Result<()> {
    if json {
        let line = serde_json::json!({ "type": "status", "status": status });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    let mut line = format!("-- {}", status.state);
    if let Some(retry) = status.next_retry_ms {
        line.push_str(&format!(" (retry at {})", format_ms(retry)));
    }
    if status.metrics.is_degraded {
        line.push_str(" [degraded]");
    }
    if let Some(error) = &status.metrics.last_error {
        line.push_str(&format!(": {error}"));
    }
    println!("{line}");
    Ok(())
}

fn print_summary(summary: &ClientSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        let line = serde_json::json!({ "type": "summary", "summary": summary });
        println!("{}", serde_json::to_string(&line)?);
        return Ok(());
    }

    let metrics = &summary.status.metrics;
    println!();
    println!("Session summary");
    println!("---------------");
    println!("Vehicles:        {}", summary.store.positions.len());
    println!("Hidden:          {}", summary.store.hidden_vehicles);
    println!("Crossings:       {}", summary.store.recent_crossings.len());
    println!("Reconnects:      {}", metrics.reconnect_count);
    println!("Messages/sec:    {:.1}", metrics.messages_per_second);
    if let Some(latency) = metrics.latency_ms {
        println!("Latency:         {latency} ms");
    }
    if let Some(freshness) = summary.stream_freshness {
        println!("Stream:          {freshness}");
    }
    if summary.malformed_frames > 0 {
        println!("Malformed:       {}", summary.malformed_frames);
    }
    if !summary.store.leaderboard.is_empty() {
        println!();
        print_leaderboard(&summary.store.leaderboard);
    }
    Ok(())
}

async fn handle_events(config: &Config, cmd: &EventsCommand) -> anyhow::Result<()> {
    let api = ApiClient::new(&config.server)?;
    let events = api.list_events().await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&events)?);
    } else if events.is_empty() {
        println!("No events.");
    } else {
        for event in &events {
            let status = event.status.as_deref().unwrap_or("-");
            println!("{:<24} {:<12} {}", event.id, status, event.name);
        }
    }
    Ok(())
}

async fn handle_leaderboard(config: &Config, cmd: &LeaderboardCommand) -> anyhow::Result<()> {
    let api = ApiClient::new(&config.server)?;
    let payload = api.leaderboard(&cmd.event_id).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if payload.entries.is_empty() {
        println!("No standings yet.");
    } else {
        print_leaderboard(&payload.entries);
    }
    Ok(())
}

fn print_leaderboard(entries: &[LeaderboardEntry]) {
    for entry in entries {
        let checkpoint = entry
            .last_checkpoint_name
            .clone()
            .or_else(|| entry.last_checkpoint.map(|c| format!("CP {c}")))
            .unwrap_or_default();
        println!(
            "{:>3}. #{:<5} {:<24} {:>10}  {}",
            entry.position, entry.vehicle_number, entry.team_name, entry.delta_formatted, checkpoint
        );
    }
}

fn handle_show(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("Current Configuration");
    println!("=====================");
    println!();
    println!("[Server]");
    println!("  Base URL:           {}", config.server.base_url);
    println!(
        "  Token:              {}",
        if config.server.token.is_some() { "set" } else { "not set" }
    );
    println!("  Request timeout:    {}s", config.server.request_timeout_secs);
    println!();
    println!("[Stream]");
    println!("  Batch interval:     {}ms", config.stream.batch_interval_ms);
    println!("  Backoff (ms):       {:?}", config.stream.backoff_schedule_ms);
    println!("  Degraded after:     {}", config.stream.degraded_after);
    println!("  Rate window:        {}s", config.stream.rate_window_secs);
    println!("  Recent crossings:   {}", config.stream.max_recent_crossings);
    println!();
    println!("[Notifications]");
    println!("  Show all:           {}", config.notifications.show_all);
    println!("  Watch:              {:?}", config.notifications.watch);
    println!(
        "  Selected:           {}",
        config.notifications.selected.as_deref().unwrap_or("-")
    );
    println!();
    println!("[Freshness]");
    println!("  Fresh:              <{}s", config.freshness.fresh_secs);
    println!("  Stale:              <{}s", config.freshness.stale_secs);
    Ok(())
}

fn handle_validate(file: Option<PathBuf>) {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => println!("Configuration is valid."),
        Err(e) => println!("Configuration error: {e}"),
    }
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(|| ms.to_string(), |t| t.format("%H:%M:%S").to_string())
}
