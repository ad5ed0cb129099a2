//! Reconciled live race state.
//!
//! The store is the single source of truth for positions, leaderboard,
//! visibility and checkpoint crossings of the currently subscribed event.
//! It is a plain owned value: whoever drives the session owns it and hands
//! out snapshots, there is no global instance.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{
    CrossingEvent, Freshness, FreshnessThresholds, LeaderboardEntry, Position,
};

/// Default number of recent crossings retained.
pub const DEFAULT_MAX_RECENT_CROSSINGS: usize = 50;

/// Live state of one event.
#[derive(Debug, Clone)]
pub struct RaceStore {
    positions: HashMap<String, Position>,
    visibility: HashMap<String, bool>,
    leaderboard: Vec<LeaderboardEntry>,
    leaderboard_updated_ms: Option<u64>,
    leaderboard_streamed: bool,
    crossings: VecDeque<CrossingEvent>,
    max_crossings: usize,
    checkpoint_signal_ms: Option<u64>,
}

impl Default for RaceStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECENT_CROSSINGS)
    }
}

/// Serializable read-only copy of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Visible positions ordered by vehicle id.
    pub positions: Vec<Position>,
    /// Current ranking.
    pub leaderboard: Vec<LeaderboardEntry>,
    /// Server time of the ranking.
    pub leaderboard_updated_ms: Option<u64>,
    /// Most recent crossings, oldest first.
    pub recent_crossings: Vec<CrossingEvent>,
    /// Last time a checkpoint crossing was recorded.
    pub checkpoint_signal_ms: Option<u64>,
    /// Vehicles known but hidden by permission.
    pub hidden_vehicles: usize,
}

impl RaceStore {
    /// Create an empty store retaining up to `max_crossings` crossings.
    #[must_use]
    pub fn new(max_crossings: usize) -> Self {
        Self {
            positions: HashMap::new(),
            visibility: HashMap::new(),
            leaderboard: Vec::new(),
            leaderboard_updated_ms: None,
            leaderboard_streamed: false,
            crossings: VecDeque::new(),
            max_crossings,
            checkpoint_signal_ms: None,
        }
    }

    // === Positions ===

    /// Replace every position.
    pub fn set_positions(&mut self, positions: impl IntoIterator<Item = Position>) {
        self.positions = positions
            .into_iter()
            .map(|p| (p.vehicle_id.clone(), p))
            .collect();
        debug!(count = self.positions.len(), "Positions replaced");
    }

    /// Insert or replace one vehicle's position. Vehicles not seen before
    /// are inserted.
    pub fn update_position(&mut self, position: Position) {
        self.positions.insert(position.vehicle_id.clone(), position);
    }

    /// Upsert a batch of positions.
    pub fn apply_positions(&mut self, positions: impl IntoIterator<Item = Position>) {
        for position in positions {
            self.update_position(position);
        }
    }

    /// Remove every position.
    pub fn clear_positions(&mut self) {
        self.positions.clear();
    }

    /// Position of one vehicle.
    #[must_use]
    pub fn position(&self, vehicle_id: &str) -> Option<&Position> {
        self.positions.get(vehicle_id)
    }

    /// Number of tracked vehicles, visible or not.
    #[must_use]
    pub fn vehicle_count(&self) -> usize {
        self.positions.len()
    }

    /// Positions of vehicles that are not hidden, ordered by vehicle id.
    #[must_use]
    pub fn visible_positions(&self) -> Vec<&Position> {
        let mut visible: Vec<&Position> = self
            .positions
            .values()
            .filter(|p| self.is_visible(&p.vehicle_id))
            .collect();
        visible.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        visible
    }

    /// Freshness of every visible position.
    #[must_use]
    pub fn freshness(
        &self,
        now_ms: u64,
        thresholds: FreshnessThresholds,
    ) -> Vec<(String, Freshness)> {
        self.visible_positions()
            .into_iter()
            .map(|p| {
                (
                    p.vehicle_id.clone(),
                    Freshness::classify(now_ms, p.last_update_ms, thresholds),
                )
            })
            .collect()
    }

    // === Visibility ===

    /// Show or hide a vehicle.
    pub fn set_visibility(&mut self, vehicle_id: impl Into<String>, visible: bool) {
        self.visibility.insert(vehicle_id.into(), visible);
    }

    /// Whether a vehicle may be shown. Vehicles are visible unless a
    /// permission update explicitly hid them.
    #[must_use]
    pub fn is_visible(&self, vehicle_id: &str) -> bool {
        self.visibility.get(vehicle_id).copied().unwrap_or(true)
    }

    // === Leaderboard ===

    /// Replace the ranking with a streamed update.
    pub fn set_leaderboard(&mut self, entries: Vec<LeaderboardEntry>, updated_ms: u64) {
        self.leaderboard = entries;
        self.leaderboard_updated_ms = Some(updated_ms);
        self.leaderboard_streamed = true;
    }

    /// Install a ranking fetched out of band, unless the stream already
    /// delivered one. Returns `true` if applied.
    pub fn seed_leaderboard(&mut self, entries: Vec<LeaderboardEntry>, updated_ms: u64) -> bool {
        if self.leaderboard_streamed {
            debug!("Ignoring leaderboard bootstrap, stream is authoritative");
            return false;
        }
        self.leaderboard = entries;
        self.leaderboard_updated_ms = Some(updated_ms);
        true
    }

    /// Current ranking.
    #[must_use]
    pub fn leaderboard(&self) -> &[LeaderboardEntry] {
        &self.leaderboard
    }

    /// Time of the current ranking.
    #[must_use]
    pub fn leaderboard_updated_ms(&self) -> Option<u64> {
        self.leaderboard_updated_ms
    }

    /// Remove the ranking.
    pub fn clear_leaderboard(&mut self) {
        self.leaderboard.clear();
        self.leaderboard_updated_ms = None;
        self.leaderboard_streamed = false;
    }

    // === Crossings ===

    /// Record a crossing and raise the checkpoint signal.
    pub fn add_crossing(&mut self, crossing: CrossingEvent, now_ms: u64) {
        self.crossings.push_back(crossing);
        while self.crossings.len() > self.max_crossings {
            self.crossings.pop_front();
        }
        // Strictly increasing so two crossings in the same millisecond are
        // still observable as two signals.
        self.checkpoint_signal_ms = Some(match self.checkpoint_signal_ms {
            Some(prev) if prev >= now_ms => prev + 1,
            _ => now_ms,
        });
    }

    /// Recent crossings, oldest first.
    pub fn recent_crossings(&self) -> impl Iterator<Item = &CrossingEvent> {
        self.crossings.iter()
    }

    /// Number of retained crossings.
    #[must_use]
    pub fn crossing_count(&self) -> usize {
        self.crossings.len()
    }

    /// Time of the most recent crossing signal.
    #[must_use]
    pub fn checkpoint_signal_ms(&self) -> Option<u64> {
        self.checkpoint_signal_ms
    }

    /// Remove every crossing.
    pub fn clear_crossings(&mut self) {
        self.crossings.clear();
        self.checkpoint_signal_ms = None;
    }

    // === Event scope ===

    /// Drop all state scoped to the current event. Positions, visibility,
    /// leaderboard and crossings always go together.
    pub fn reset_event(&mut self) {
        self.clear_positions();
        self.visibility.clear();
        self.clear_leaderboard();
        self.clear_crossings();
        debug!("Store cleared for event switch");
    }

    /// Take a read-only copy.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            positions: self.visible_positions().into_iter().cloned().collect(),
            leaderboard: self.leaderboard.clone(),
            leaderboard_updated_ms: self.leaderboard_updated_ms,
            recent_crossings: self.crossings.iter().cloned().collect(),
            checkpoint_signal_ms: self.checkpoint_signal_ms,
            hidden_vehicles: self
                .positions
                .keys()
                .filter(|id| !self.is_visible(id))
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rank: u32, id: &str) -> LeaderboardEntry {
        LeaderboardEntry {
            position: rank,
            vehicle_id: id.to_string(),
            vehicle_number: rank.to_string(),
            team_name: String::new(),
            delta_formatted: String::new(),
            delta_ms: None,
            last_checkpoint: None,
            last_checkpoint_name: None,
        }
    }

    fn crossing(id: &str) -> CrossingEvent {
        CrossingEvent {
            id: id.to_string(),
            vehicle_id: "v1".to_string(),
            vehicle_number: "1".to_string(),
            team_name: String::new(),
            checkpoint_id: "1".to_string(),
            checkpoint_name: None,
            lap_number: None,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_set_positions_replaces_everything() {
        let mut store = RaceStore::default();
        store.set_positions(vec![Position::new("old", 0.0, 0.0, 0)]);
        store.set_positions(vec![
            Position::new("v1", 32.5, -117.0, 0),
            Position::new("v2", 32.6, -117.1, 0),
        ]);
        assert!(store.position("old").is_none());
        assert_eq!(store.vehicle_count(), 2);
    }

    #[test]
    fn test_update_position_upserts() {
        let mut store = RaceStore::default();
        store.set_positions(vec![Position::new("v1", 1.0, 1.0, 0)]);
        store.update_position(Position::new("v1", 2.0, 1.0, 1));
        store.update_position(Position::new("late", 3.0, 1.0, 1));
        assert_eq!(store.position("v1").unwrap().lat, 2.0);
        assert!(store.position("late").is_some());
        assert_eq!(store.vehicle_count(), 2);
    }

    #[test]
    fn test_visibility_defaults_to_visible() {
        let mut store = RaceStore::default();
        store.set_positions(vec![
            Position::new("v1", 0.0, 0.0, 0),
            Position::new("v2", 0.0, 0.0, 0),
        ]);
        assert_eq!(store.visible_positions().len(), 2);

        store.set_visibility("v2", false);
        let visible = store.visible_positions();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].vehicle_id, "v1");
        assert_eq!(store.snapshot().hidden_vehicles, 1);

        store.set_visibility("v2", true);
        assert_eq!(store.visible_positions().len(), 2);
    }

    #[test]
    fn test_visibility_survives_snapshot_replace() {
        let mut store = RaceStore::default();
        store.set_visibility("v2", false);
        store.set_positions(vec![Position::new("v2", 0.0, 0.0, 0)]);
        assert!(store.visible_positions().is_empty());
    }

    #[test]
    fn test_leaderboard_replaced_wholesale() {
        let mut store = RaceStore::default();
        store.set_leaderboard(vec![entry(1, "a"), entry(2, "b"), entry(3, "c")], 10);
        store.set_leaderboard(vec![entry(1, "b")], 20);
        assert_eq!(store.leaderboard().len(), 1);
        assert_eq!(store.leaderboard()[0].vehicle_id, "b");
        assert_eq!(store.leaderboard_updated_ms(), Some(20));
    }

    #[test]
    fn test_seed_leaderboard_only_before_stream() {
        let mut store = RaceStore::default();
        assert!(store.seed_leaderboard(vec![entry(1, "a")], 5));
        store.set_leaderboard(vec![entry(1, "b")], 10);
        assert!(!store.seed_leaderboard(vec![entry(1, "c")], 15));
        assert_eq!(store.leaderboard()[0].vehicle_id, "b");
    }

    #[test]
    fn test_crossings_are_bounded() {
        let mut store = RaceStore::new(3);
        for i in 0..5 {
            store.add_crossing(crossing(&format!("c{i}")), 100);
        }
        let ids: Vec<&str> = store.recent_crossings().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3", "c4"]);
    }

    #[test]
    fn test_checkpoint_signal_strictly_increases() {
        let mut store = RaceStore::default();
        store.add_crossing(crossing("a"), 100);
        assert_eq!(store.checkpoint_signal_ms(), Some(100));
        store.add_crossing(crossing("b"), 100);
        assert_eq!(store.checkpoint_signal_ms(), Some(101));
        store.add_crossing(crossing("c"), 500);
        assert_eq!(store.checkpoint_signal_ms(), Some(500));
    }

    #[test]
    fn test_reset_event_clears_all_scoped_state() {
        let mut store = RaceStore::default();
        store.set_positions(vec![Position::new("v1", 0.0, 0.0, 0)]);
        store.set_visibility("v1", false);
        store.set_leaderboard(vec![entry(1, "v1")], 1);
        store.add_crossing(crossing("c1"), 1);

        store.reset_event();

        assert_eq!(store.vehicle_count(), 0);
        assert!(store.leaderboard().is_empty());
        assert_eq!(store.crossing_count(), 0);
        assert!(store.checkpoint_signal_ms().is_none());
        assert!(store.is_visible("v1"));
        // A fresh event may be seeded again.
        assert!(store.seed_leaderboard(vec![entry(1, "x")], 2));
    }

    #[test]
    fn test_freshness_per_vehicle() {
        let mut store = RaceStore::default();
        store.set_positions(vec![
            Position::new("v1", 0.0, 0.0, 95_000),
            Position::new("v2", 0.0, 0.0, 50_000),
            Position::new("v3", 0.0, 0.0, 0),
        ]);
        let freshness = store.freshness(100_000, FreshnessThresholds::default());
        assert_eq!(
            freshness,
            vec![
                ("v1".to_string(), Freshness::Fresh),
                ("v2".to_string(), Freshness::Stale),
                ("v3".to_string(), Freshness::VeryStale),
            ]
        );
    }
}
