//! Connection lifecycle and reconnect backoff.
//!
//! The [`ConnectionManager`] owns the single live subscription of a client.
//! It does no I/O itself: every decision is returned as a
//! [`TransportCommand`] for the driver to execute, and every transport
//! callback is fed back in tagged with the connection generation it belongs
//! to. Callbacks for a superseded generation are ignored.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Timer;
use crate::metrics::{ConnectionMetrics, MetricsTracker};

/// Reconnect delays in milliseconds; the last entry repeats.
pub const DEFAULT_BACKOFF_SCHEDULE_MS: [u64; 6] = [1_000, 2_000, 4_000, 8_000, 15_000, 30_000];

/// Delay before reconnect attempt number `attempt` (1-based).
#[must_use]
pub fn backoff_delay(schedule: &[u64], attempt: u32) -> Duration {
    let Some(last) = schedule.len().checked_sub(1) else {
        return Duration::ZERO;
    };
    let index = usize::try_from(attempt.saturating_sub(1))
        .unwrap_or(usize::MAX)
        .min(last);
    Duration::from_millis(schedule[index])
}

/// Lifecycle of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// An open request is in flight.
    Connecting,
    /// Frames are flowing.
    Open,
    /// Torn down; possibly waiting to reconnect.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// One logical subscription to an event's live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Event being streamed.
    pub event_id: String,
    /// Identifies the physical connection attempt.
    pub generation: u64,
    /// Current lifecycle state.
    pub state: ConnectionState,
}

/// What the driver must do to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Open the stream for `event_id`; tag every callback with `generation`.
    Open {
        /// Event to stream.
        event_id: String,
        /// Generation of the new connection.
        generation: u64,
    },
    /// Drop the connection with this generation.
    Close {
        /// Generation to drop.
        generation: u64,
    },
}

/// Published on every connection state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Subscribed event, if any.
    pub event_id: Option<String>,
    /// Lifecycle state of the current connection.
    pub state: ConnectionState,
    /// True only while frames can flow.
    pub connected: bool,
    /// When the next reconnect attempt is due.
    pub next_retry_ms: Option<u64>,
    /// Health metrics.
    pub metrics: ConnectionMetrics,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            event_id: None,
            state: ConnectionState::Closed,
            connected: false,
            next_retry_ms: None,
            metrics: ConnectionMetrics::default(),
        }
    }
}

/// Keeps exactly one live connection per subscribed event and recovers it
/// with exponential backoff.
#[derive(Debug)]
pub struct ConnectionManager {
    schedule: Vec<u64>,
    connection: Option<Connection>,
    attempts: u32,
    last_error: Option<String>,
    next_generation: u64,
    reconnect: Timer,
    metrics: MetricsTracker,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_SCHEDULE_MS.to_vec(), MetricsTracker::default())
    }
}

impl ConnectionManager {
    /// Create a manager with the given backoff schedule.
    #[must_use]
    pub fn new(schedule: Vec<u64>, metrics: MetricsTracker) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            schedule,
            connection: None,
            attempts: 0,
            last_error: None,
            next_generation: 1,
            reconnect: Timer::new(),
            metrics,
            status_tx,
        }
    }

    /// Receive a status update on every state transition.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Current connection, if subscribed.
    #[must_use]
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Event currently subscribed to.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.event_id.as_str())
    }

    /// State of the current connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Closed, |c| c.state)
    }

    /// Whether frames can currently flow.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Consecutive failed attempts since the last successful open.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Most recent transport error.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Deadline of the pending reconnect, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.reconnect.deadline()
    }

    /// Whether `generation` is the live connection.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    /// Mutable access to the metrics tracker for frame accounting.
    pub fn metrics_mut(&mut self) -> &mut MetricsTracker {
        &mut self.metrics
    }

    /// Build the current status snapshot.
    #[must_use]
    pub fn status(&mut self, now_ms: u64) -> ConnectionStatus {
        let state = self.state();
        ConnectionStatus {
            event_id: self.event_id().map(ToString::to_string),
            state,
            connected: state == ConnectionState::Open,
            next_retry_ms: self.reconnect.deadline(),
            metrics: self.metrics.snapshot(now_ms),
        }
    }

    /// Publish the current status to watchers.
    pub fn publish(&mut self, now_ms: u64) {
        let status = self.status(now_ms);
        self.status_tx.send_replace(status);
    }

    /// Subscribe to `event_id`.
    ///
    /// Idempotent: if a subscription for the same event already exists
    /// (connecting, open, or waiting to reconnect) nothing happens. A
    /// subscription to a different event is torn down first.
    pub fn connect(&mut self, event_id: &str, now_ms: u64) -> Vec<TransportCommand> {
        if let Some(conn) = &self.connection {
            if conn.event_id == event_id {
                debug!(event_id, state = %conn.state, "Already subscribed, ignoring connect");
                return Vec::new();
            }
        }

        let mut commands = self.disconnect(now_ms);
        commands.push(self.open(event_id.to_string(), now_ms));
        commands
    }

    /// Cancel a pending reconnect without touching the connection. Returns
    /// whether one was pending.
    pub fn cancel_reconnect(&mut self) -> bool {
        self.reconnect.cancel()
    }

    /// Tear down the subscription: cancel the pending reconnect and close
    /// the live connection.
    pub fn disconnect(&mut self, now_ms: u64) -> Vec<TransportCommand> {
        let cancelled = self.reconnect.cancel();
        let mut commands = Vec::new();

        if let Some(conn) = self.connection.take() {
            debug!(
                event_id = %conn.event_id,
                generation = conn.generation,
                cancelled_reconnect = cancelled,
                "Disconnecting"
            );
            if conn.state != ConnectionState::Closed {
                commands.push(TransportCommand::Close {
                    generation: conn.generation,
                });
            }
            self.attempts = 0;
            self.last_error = None;
            self.metrics.reset_connection();
            self.metrics.reset_stream();
            self.publish(now_ms);
        }

        commands
    }

    /// The transport reports that `generation` is open.
    ///
    /// Returns `false` if the callback belongs to a superseded connection.
    pub fn on_open(&mut self, generation: u64, now_ms: u64) -> bool {
        let Some(conn) = self.connection.as_mut().filter(|c| c.generation == generation) else {
            debug!(generation, "Ignoring open for superseded connection");
            return false;
        };

        conn.state = ConnectionState::Open;
        info!(event_id = %conn.event_id, generation, "Stream connected");
        self.attempts = 0;
        self.last_error = None;
        self.metrics.record_open();
        self.publish(now_ms);
        true
    }

    /// The transport reports that `generation` failed or closed.
    ///
    /// The connection is closed at once and a reconnect is scheduled.
    pub fn on_failure(
        &mut self,
        generation: u64,
        error: &str,
        now_ms: u64,
    ) -> Vec<TransportCommand> {
        let Some(conn) = self
            .connection
            .as_mut()
            .filter(|c| c.generation == generation && c.state != ConnectionState::Closed)
        else {
            debug!(generation, error, "Ignoring failure for inactive connection");
            return Vec::new();
        };

        conn.state = ConnectionState::Closed;
        let event_id = conn.event_id.clone();

        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.metrics.record_failure(error, self.attempts);

        let delay = backoff_delay(&self.schedule, self.attempts);
        self.reconnect.reschedule(now_ms, delay);
        warn!(
            event_id = %event_id,
            generation,
            attempt = self.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error,
            "Stream dropped, scheduling reconnect"
        );

        self.publish(now_ms);
        vec![TransportCommand::Close { generation }]
    }

    /// Fire the reconnect timer if due.
    pub fn poll(&mut self, now_ms: u64) -> Vec<TransportCommand> {
        if !self.reconnect.poll(now_ms) {
            return Vec::new();
        }
        let Some(event_id) = self
            .connection
            .as_ref()
            .filter(|c| c.state == ConnectionState::Closed)
            .map(|c| c.event_id.clone())
        else {
            return Vec::new();
        };

        info!(event_id = %event_id, attempt = self.attempts + 1, "Reconnecting");
        vec![self.open(event_id, now_ms)]
    }

    fn open(&mut self, event_id: String, now_ms: u64) -> TransportCommand {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.connection = Some(Connection {
            event_id: event_id.clone(),
            generation,
            state: ConnectionState::Connecting,
        });
        self.metrics.reset_stream();
        self.publish(now_ms);
        TransportCommand::Open {
            event_id,
            generation,
        }
    }
}
