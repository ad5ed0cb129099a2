//! Demultiplexing of named stream frames.
//!
//! Each frame is parsed into a [`StreamEvent`] variant first; parsing is the
//! only fallible step and a failure affects that single frame only. Parsed
//! events are then applied to the store, the batcher, or the metrics.

use std::fmt;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{trace, warn};

use crate::batcher::UpdateBatcher;
use crate::metrics::MetricsTracker;
use crate::model::{
    CheckpointPayload, CrossingEvent, HeartbeatPayload, LeaderboardPayload, PermissionPayload,
    Position, SnapshotPayload,
};
use crate::store::RaceStore;

/// Errors decoding a single frame.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The frame's event name is not one we handle.
    #[error("unknown event type '{0}'")]
    UnknownEvent(String),

    /// The payload did not match the schema for its event.
    #[error("malformed '{kind}' payload: {source}")]
    Malformed {
        /// Event the payload was for.
        kind: EventKind,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// Names of the frames on the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Connection acknowledgement.
    Connected,
    /// Full position state.
    Snapshot,
    /// Single position update.
    Position,
    /// Checkpoint crossing.
    Checkpoint,
    /// Full leaderboard.
    Leaderboard,
    /// Vehicle visibility change.
    Permission,
    /// Liveness and latency heartbeat.
    Heartbeat,
}

impl EventKind {
    /// Look up a frame name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "connected" => Self::Connected,
            "snapshot" => Self::Snapshot,
            "position" => Self::Position,
            "checkpoint" => Self::Checkpoint,
            "leaderboard" => Self::Leaderboard,
            "permission" => Self::Permission,
            "heartbeat" => Self::Heartbeat,
            _ => return None,
        })
    }

    /// Wire name of the frame.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Snapshot => "snapshot",
            Self::Position => "position",
            Self::Checkpoint => "checkpoint",
            Self::Leaderboard => "leaderboard",
            Self::Permission => "permission",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Server acknowledged the subscription.
    Connected,
    /// Baseline positions after (re)connect.
    Snapshot(SnapshotPayload),
    /// One vehicle moved.
    Position(Position),
    /// A vehicle crossed a checkpoint.
    Checkpoint(CheckpointPayload),
    /// New ranking.
    Leaderboard(LeaderboardPayload),
    /// Visibility of a vehicle changed.
    Permission(PermissionPayload),
    /// Server heartbeat.
    Heartbeat(HeartbeatPayload),
}

impl StreamEvent {
    /// Decode a frame from its event name and JSON data.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::UnknownEvent`] for unrecognised names and
    /// [`PayloadError::Malformed`] when the data does not match the schema.
    pub fn parse(name: &str, data: &str) -> Result<Self, PayloadError> {
        let kind =
            EventKind::from_name(name).ok_or_else(|| PayloadError::UnknownEvent(name.to_string()))?;

        Ok(match kind {
            EventKind::Connected => Self::Connected,
            EventKind::Snapshot => Self::Snapshot(decode(kind, data)?),
            EventKind::Position => Self::Position(decode(kind, data)?),
            EventKind::Checkpoint => Self::Checkpoint(decode(kind, data)?),
            EventKind::Leaderboard => Self::Leaderboard(decode(kind, data)?),
            EventKind::Permission => Self::Permission(decode(kind, data)?),
            EventKind::Heartbeat => Self::Heartbeat(decode(kind, data)?),
        })
    }

    /// Kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Snapshot(_) => EventKind::Snapshot,
            Self::Position(_) => EventKind::Position,
            Self::Checkpoint(_) => EventKind::Checkpoint,
            Self::Leaderboard(_) => EventKind::Leaderboard,
            Self::Permission(_) => EventKind::Permission,
            Self::Heartbeat(_) => EventKind::Heartbeat,
        }
    }
}

fn decode<T: DeserializeOwned>(kind: EventKind, data: &str) -> Result<T, PayloadError> {
    serde_json::from_str(data).map_err(|source| PayloadError::Malformed { kind, source })
}

/// Everything a routed event may touch.
#[derive(Debug)]
pub struct RouteContext<'a> {
    /// Event the frame arrived for.
    pub event_id: &'a str,
    /// Local time of arrival.
    pub now_ms: u64,
    /// Live state.
    pub store: &'a mut RaceStore,
    /// Position batcher.
    pub batcher: &'a mut UpdateBatcher,
    /// Connection metrics.
    pub metrics: &'a mut MetricsTracker,
}

/// What routing a frame did.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Acknowledgement, no state change.
    Ack,
    /// Positions replaced with this many vehicles.
    Snapshot {
        /// Vehicles in the snapshot.
        vehicles: usize,
    },
    /// Position queued for the next batch.
    Position {
        /// False if the batcher discarded it.
        queued: bool,
    },
    /// Crossing recorded.
    Checkpoint(CrossingEvent),
    /// Leaderboard replaced.
    Leaderboard {
        /// Entries in the new ranking.
        entries: usize,
    },
    /// Visibility updated.
    Permission,
    /// Metrics updated.
    Heartbeat {
        /// Measured latency.
        latency_ms: u64,
    },
}

/// Frame counters kept by the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Frames applied.
    pub routed: u64,
    /// Frames dropped for a bad payload.
    pub malformed: u64,
    /// Frames dropped for an unknown name.
    pub unknown: u64,
}

/// Routes frames to the store, batcher and metrics.
#[derive(Debug, Default)]
pub struct EventRouter {
    stats: RouterStats,
}

impl EventRouter {
    /// Create a router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Decode and apply one frame. Bad frames are logged and dropped.
    pub fn route(&mut self, name: &str, data: &str, ctx: RouteContext<'_>) -> Option<Routed> {
        ctx.metrics.record_message(ctx.now_ms);

        match StreamEvent::parse(name, data) {
            Ok(event) => {
                self.stats.routed += 1;
                trace!(event = %event.kind(), event_id = ctx.event_id, "Routing frame");
                Some(Self::apply(event, ctx))
            }
            Err(PayloadError::UnknownEvent(name)) => {
                self.stats.unknown += 1;
                trace!(event = %name, "Ignoring unknown frame");
                None
            }
            Err(err) => {
                self.stats.malformed += 1;
                warn!(event_id = ctx.event_id, error = %err, "Dropping malformed frame");
                None
            }
        }
    }

    /// Apply an already decoded event.
    pub fn apply(event: StreamEvent, ctx: RouteContext<'_>) -> Routed {
        match event {
            StreamEvent::Connected => Routed::Ack,
            StreamEvent::Snapshot(payload) => {
                // The snapshot is authoritative; older queued moves must not
                // overwrite it.
                ctx.batcher.discard_pending();
                let vehicles = payload.vehicles.len();
                ctx.store.set_positions(payload.vehicles);
                Routed::Snapshot { vehicles }
            }
            StreamEvent::Position(position) => Routed::Position {
                queued: ctx.batcher.queue_update(ctx.event_id, position, ctx.now_ms),
            },
            StreamEvent::Checkpoint(payload) => {
                let crossing = payload.into_crossing(ctx.now_ms);
                ctx.store.add_crossing(crossing.clone(), ctx.now_ms);
                Routed::Checkpoint(crossing)
            }
            StreamEvent::Leaderboard(payload) => {
                let entries = payload.entries.len();
                ctx.store
                    .set_leaderboard(payload.entries, payload.ts.unwrap_or(ctx.now_ms));
                Routed::Leaderboard { entries }
            }
            StreamEvent::Permission(payload) => {
                ctx.store.set_visibility(payload.vehicle_id, payload.visible);
                Routed::Permission
            }
            StreamEvent::Heartbeat(payload) => {
                ctx.metrics.record_heartbeat(payload.ts_ms, ctx.now_ms);
                Routed::Heartbeat {
                    latency_ms: ctx.now_ms.saturating_sub(payload.ts_ms),
                }
            }
        }
    }
}
