//! Core domain types for racestream.
//!
//! These are both the in-memory records held by the store and the JSON
//! schemas of the live stream payloads. Every payload is validated by serde
//! on the way in; a frame that does not match its schema is a malformed
//! payload and is dropped by the router.

use std::fmt::{self, Write as _};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Optional extended telemetry carried alongside a position fix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Engine speed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<f64>,
    /// Selected gear (negative for reverse).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gear: Option<i8>,
    /// Throttle position, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_pct: Option<f64>,
    /// Coolant temperature in Celsius.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coolant_temp_c: Option<f64>,
    /// Oil temperature in Celsius.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oil_temp_c: Option<f64>,
    /// Driver heart rate (ANT+).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<u16>,
}

impl Telemetry {
    /// Whether no extended field is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Latest known position of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Stable vehicle identifier.
    pub vehicle_id: String,
    /// Display number painted on the vehicle.
    #[serde(default, deserialize_with = "string_or_number")]
    pub vehicle_number: String,
    /// Team name.
    #[serde(default)]
    pub team_name: String,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Ground speed in metres per second.
    #[serde(default)]
    pub speed_mps: f64,
    /// Heading in degrees from north.
    #[serde(default)]
    pub heading_deg: f64,
    /// Index of the last checkpoint passed.
    #[serde(default)]
    pub last_checkpoint: Option<u32>,
    /// Time of the fix, milliseconds since the epoch.
    #[serde(default)]
    pub last_update_ms: u64,
    /// Extended telemetry, flattened into the same JSON object.
    #[serde(flatten)]
    pub telemetry: Telemetry,
}

impl Position {
    /// Create a bare position fix.
    #[must_use]
    pub fn new(vehicle_id: impl Into<String>, lat: f64, lon: f64, last_update_ms: u64) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            vehicle_number: String::new(),
            team_name: String::new(),
            lat,
            lon,
            speed_mps: 0.0,
            heading_deg: 0.0,
            last_checkpoint: None,
            last_update_ms,
            telemetry: Telemetry::default(),
        }
    }

    /// Speed converted to km/h for display.
    #[must_use]
    pub fn speed_kph(&self) -> f64 {
        self.speed_mps * 3.6
    }
}

/// One row of the leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// Rank, starting at 1.
    pub position: u32,
    /// Stable vehicle identifier.
    pub vehicle_id: String,
    /// Display number.
    #[serde(default, deserialize_with = "string_or_number")]
    pub vehicle_number: String,
    /// Team name.
    #[serde(default)]
    pub team_name: String,
    /// Gap to the leader, pre-formatted by the server (e.g. `+1:02.3`).
    #[serde(default)]
    pub delta_formatted: String,
    /// Gap to the leader in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_ms: Option<i64>,
    /// Index of the last checkpoint passed.
    #[serde(default)]
    pub last_checkpoint: Option<u32>,
    /// Name of the last checkpoint passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_name: Option<String>,
}

/// A vehicle passing a course checkpoint. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossingEvent {
    /// Unique crossing id, used for notification deduplication.
    pub id: String,
    /// Stable vehicle identifier.
    pub vehicle_id: String,
    /// Display number.
    pub vehicle_number: String,
    /// Team name.
    pub team_name: String,
    /// Checkpoint identifier.
    pub checkpoint_id: String,
    /// Human-readable checkpoint name.
    pub checkpoint_name: Option<String>,
    /// Lap number, for looped courses.
    pub lap_number: Option<u32>,
    /// Crossing time, milliseconds since the epoch.
    pub timestamp_ms: u64,
}

impl CrossingEvent {
    /// Label used when rendering the checkpoint.
    #[must_use]
    pub fn checkpoint_label(&self) -> String {
        self.checkpoint_name
            .clone()
            .unwrap_or_else(|| format!("checkpoint {}", self.checkpoint_id))
    }
}

impl fmt::Display for CrossingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let who = if self.vehicle_number.is_empty() {
            self.vehicle_id.as_str()
        } else {
            self.vehicle_number.as_str()
        };
        write!(f, "#{who}")?;
        if !self.team_name.is_empty() {
            write!(f, " ({})", self.team_name)?;
        }
        write!(f, " crossed {}", self.checkpoint_label())?;
        if let Some(lap) = self.lap_number {
            write!(f, " on lap {lap}")?;
        }
        Ok(())
    }
}

// === Stream payloads ===

/// Payload of a `snapshot` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    /// Every vehicle currently known to the server.
    pub vehicles: Vec<Position>,
}

/// Payload of a `checkpoint` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCheckpointPayload")]
pub struct CheckpointPayload {
    /// Server-assigned crossing id, when provided.
    pub id: Option<String>,
    /// Stable vehicle identifier.
    pub vehicle_id: String,
    /// Display number.
    pub vehicle_number: String,
    /// Team name.
    pub team_name: String,
    /// Checkpoint identifier; older producers send it as `checkpoint`.
    pub checkpoint_id: String,
    /// Human-readable checkpoint name.
    pub checkpoint_name: Option<String>,
    /// Lap number.
    pub lap_number: Option<u32>,
    /// Crossing time reported by the producer.
    pub ts_ms: Option<u64>,
}

/// Wire shape of a `checkpoint` frame. Both checkpoint field names may be
/// present; `checkpoint_id` wins.
#[derive(Deserialize)]
struct RawCheckpointPayload {
    #[serde(default)]
    id: Option<String>,
    vehicle_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    vehicle_number: String,
    #[serde(default)]
    team_name: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    checkpoint_id: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    checkpoint: Option<String>,
    #[serde(default)]
    checkpoint_name: Option<String>,
    #[serde(default)]
    lap_number: Option<u32>,
    #[serde(default)]
    ts_ms: Option<u64>,
}

impl TryFrom<RawCheckpointPayload> for CheckpointPayload {
    type Error = &'static str;

    fn try_from(raw: RawCheckpointPayload) -> Result<Self, Self::Error> {
        let checkpoint_id = raw
            .checkpoint_id
            .or(raw.checkpoint)
            .ok_or("missing field `checkpoint_id`")?;
        Ok(Self {
            id: raw.id,
            vehicle_id: raw.vehicle_id,
            vehicle_number: raw.vehicle_number,
            team_name: raw.team_name,
            checkpoint_id,
            checkpoint_name: raw.checkpoint_name,
            lap_number: raw.lap_number,
            ts_ms: raw.ts_ms,
        })
    }
}

impl CheckpointPayload {
    /// Crossing id derived from the payload alone, so a redelivered
    /// crossing maps to the same id.
    #[must_use]
    pub fn derived_id(&self) -> String {
        let mut id = format!("{}-{}", self.vehicle_id, self.checkpoint_id);
        if let Some(lap) = self.lap_number {
            let _ = write!(id, "-L{lap}");
        }
        if let Some(ts) = self.ts_ms {
            let _ = write!(id, "-{ts}");
        }
        id
    }

    /// Turn the payload into a crossing record, stamping it with `now_ms`
    /// when the producer did not supply a time.
    #[must_use]
    pub fn into_crossing(self, now_ms: u64) -> CrossingEvent {
        let id = self.id.clone().unwrap_or_else(|| self.derived_id());
        CrossingEvent {
            id,
            vehicle_id: self.vehicle_id,
            vehicle_number: self.vehicle_number,
            team_name: self.team_name,
            checkpoint_id: self.checkpoint_id,
            checkpoint_name: self.checkpoint_name,
            lap_number: self.lap_number,
            timestamp_ms: self.ts_ms.unwrap_or(now_ms),
        }
    }
}

/// Payload of a `leaderboard` frame, also returned by the REST snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardPayload {
    /// Full, authoritative ranking.
    pub entries: Vec<LeaderboardEntry>,
    /// Server time of the ranking.
    #[serde(default)]
    pub ts: Option<u64>,
}

/// Payload of a `permission` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPayload {
    /// Vehicle whose visibility changed.
    pub vehicle_id: String,
    /// Whether the vehicle may be shown.
    pub visible: bool,
}

/// Payload of a `heartbeat` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Server send time, milliseconds since the epoch.
    pub ts_ms: u64,
}

// === Freshness ===

/// Age thresholds used to classify how current a piece of data is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessThresholds {
    /// Younger than this is fresh.
    pub fresh: Duration,
    /// Younger than this (but not fresh) is stale; older is very stale.
    pub stale: Duration,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            fresh: Duration::from_secs(10),
            stale: Duration::from_secs(60),
        }
    }
}

/// How current a piece of data is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Updated recently.
    Fresh,
    /// Updated a while ago.
    Stale,
    /// Not updated for a long time.
    VeryStale,
}

impl Freshness {
    /// Classify data that was last updated at `updated_ms`.
    #[must_use]
    pub fn classify(now_ms: u64, updated_ms: u64, thresholds: FreshnessThresholds) -> Self {
        let age = Duration::from_millis(now_ms.saturating_sub(updated_ms));
        if age < thresholds.fresh {
            Self::Fresh
        } else if age < thresholds.stale {
            Self::Stale
        } else {
            Self::VeryStale
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Stale => write!(f, "stale"),
            Self::VeryStale => write!(f, "very_stale"),
        }
    }
}

/// Accept a JSON string or number and keep it as text. `null` or a missing
/// value becomes the empty string.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(s)) => s,
        Some(Raw::Int(n)) => n.to_string(),
        Some(Raw::Float(n)) => n.to_string(),
        None => String::new(),
    })
}

/// Like [`string_or_number`], but `null` or an empty string is `None`.
fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(string_or_number(deserializer)?).filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_parses_minimal_fix() {
        let json = r#"{"vehicle_id":"v1","lat":32.5,"lon":-117.0}"#;
        let pos: Position = serde_json::from_str(json).unwrap();
        assert_eq!(pos.vehicle_id, "v1");
        assert_eq!(pos.lat, 32.5);
        assert_eq!(pos.vehicle_number, "");
        assert!(pos.telemetry.is_empty());
    }

    #[test]
    fn test_position_parses_numeric_vehicle_number_and_telemetry() {
        let json = r#"{
            "vehicle_id": "v7",
            "vehicle_number": 101,
            "team_name": "Dust Devils",
            "lat": 32.6, "lon": -117.1,
            "speed_mps": 25.0, "heading_deg": 90.0,
            "last_checkpoint": 3, "last_update_ms": 1700000000000,
            "rpm": 5200.0, "gear": 4, "heart_rate": 151
        }"#;
        let pos: Position = serde_json::from_str(json).unwrap();
        assert_eq!(pos.vehicle_number, "101");
        assert_eq!(pos.last_checkpoint, Some(3));
        assert_eq!(pos.telemetry.rpm, Some(5200.0));
        assert_eq!(pos.telemetry.gear, Some(4));
        assert_eq!(pos.telemetry.heart_rate, Some(151));
        assert!((pos.speed_kph() - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_requires_coordinates() {
        let json = r#"{"vehicle_id":"v1","lat":32.5}"#;
        assert!(serde_json::from_str::<Position>(json).is_err());
    }

    #[test]
    fn test_checkpoint_accepts_legacy_field_name() {
        let json = r#"{"vehicle_id":"v1","checkpoint":4}"#;
        let payload: CheckpointPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.checkpoint_id, "4");
    }

    #[test]
    fn test_checkpoint_requires_checkpoint_id() {
        let json = r#"{"vehicle_id":"v1"}"#;
        assert!(serde_json::from_str::<CheckpointPayload>(json).is_err());
    }

    #[test]
    fn test_checkpoint_into_crossing_generates_id() {
        let json = r#"{"vehicle_id":"v1","vehicle_number":"12","checkpoint_id":"cp2"}"#;
        let payload: CheckpointPayload = serde_json::from_str(json).unwrap();
        let crossing = payload.into_crossing(1_000);
        assert_eq!(crossing.id, "v1-cp2");
        assert_eq!(crossing.timestamp_ms, 1_000);
    }

    #[test]
    fn test_derived_id_ignores_arrival_time() {
        let json = r#"{"vehicle_id":"v1","checkpoint_id":"3"}"#;
        let first: CheckpointPayload = serde_json::from_str(json).unwrap();
        let again: CheckpointPayload = serde_json::from_str(json).unwrap();
        assert_eq!(first.into_crossing(1_000).id, again.into_crossing(1_005).id);
    }

    #[test]
    fn test_derived_id_includes_lap_and_time() {
        let json = r#"{"vehicle_id":"v1","checkpoint_id":"3","lap_number":2,"ts_ms":42}"#;
        let payload: CheckpointPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.derived_id(), "v1-3-L2-42");
    }

    #[test]
    fn test_checkpoint_prefers_checkpoint_id_over_legacy_name() {
        let json = r#"{"vehicle_id":"v1","checkpoint_id":"7","checkpoint":4}"#;
        let payload: CheckpointPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.checkpoint_id, "7");
    }

    #[test]
    fn test_checkpoint_into_crossing_keeps_server_id_and_time() {
        let json = r#"{"id":"c1","vehicle_id":"v1","checkpoint_id":"cp2","ts_ms":42}"#;
        let payload: CheckpointPayload = serde_json::from_str(json).unwrap();
        let crossing = payload.into_crossing(1_000);
        assert_eq!(crossing.id, "c1");
        assert_eq!(crossing.timestamp_ms, 42);
    }

    #[test]
    fn test_crossing_display() {
        let crossing = CrossingEvent {
            id: "c1".to_string(),
            vehicle_id: "v1".to_string(),
            vehicle_number: "12".to_string(),
            team_name: "Baja Bros".to_string(),
            checkpoint_id: "3".to_string(),
            checkpoint_name: Some("Mike's Sky Ranch".to_string()),
            lap_number: Some(2),
            timestamp_ms: 0,
        };
        assert_eq!(
            crossing.to_string(),
            "#12 (Baja Bros) crossed Mike's Sky Ranch on lap 2"
        );
    }

    #[test]
    fn test_leaderboard_payload_without_ts() {
        let json = r#"{"entries":[{"position":1,"vehicle_id":"v1","vehicle_number":"1","team_name":"A","delta_formatted":"LEADER","last_checkpoint":2}]}"#;
        let payload: LeaderboardPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.entries.len(), 1);
        assert!(payload.ts.is_none());
        assert_eq!(payload.entries[0].delta_formatted, "LEADER");
    }

    #[test]
    fn test_freshness_classification() {
        let t = FreshnessThresholds::default();
        assert_eq!(Freshness::classify(10_000, 5_000, t), Freshness::Fresh);
        assert_eq!(Freshness::classify(20_000, 10_000, t), Freshness::Stale);
        assert_eq!(Freshness::classify(100_000, 30_000, t), Freshness::VeryStale);
        // Future timestamps (clock skew) count as fresh.
        assert_eq!(Freshness::classify(0, 5_000, t), Freshness::Fresh);
    }

    #[test]
    fn test_freshness_display() {
        assert_eq!(Freshness::Fresh.to_string(), "fresh");
        assert_eq!(Freshness::VeryStale.to_string(), "very_stale");
    }
}
