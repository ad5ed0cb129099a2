//! Coalescing of high-frequency position updates.
//!
//! Position frames can arrive many times per second per vehicle. The
//! batcher keeps only the latest update per vehicle and applies the whole
//! batch to the store once per interval.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, trace};

use crate::clock::Timer;
use crate::model::Position;
use crate::store::RaceStore;

/// Default flush interval.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Last-write-wins buffer of pending position updates.
#[derive(Debug)]
pub struct UpdateBatcher {
    interval: Duration,
    scope: Option<String>,
    pending: HashMap<String, Position>,
    timer: Timer,
}

impl Default for UpdateBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_INTERVAL)
    }
}

impl UpdateBatcher {
    /// Create a batcher flushing every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            scope: None,
            pending: HashMap::new(),
            timer: Timer::new(),
        }
    }

    /// Bind the batcher to an event. Updates queued for any other event are
    /// discarded.
    pub fn bind(&mut self, event_id: Option<String>) {
        self.scope = event_id;
    }

    /// Event the batcher accepts updates for.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Number of vehicles with a pending update.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Deadline of the scheduled flush, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.timer.deadline()
    }

    /// Queue an update for `event_id`, replacing any unflushed update for
    /// the same vehicle, and schedule a flush if none is pending.
    ///
    /// Returns `false` if the update was for an event the batcher is not
    /// bound to and was discarded.
    pub fn queue_update(&mut self, event_id: &str, position: Position, now_ms: u64) -> bool {
        if self.scope.as_deref() != Some(event_id) {
            debug!(
                event_id,
                vehicle_id = %position.vehicle_id,
                "Discarding position for inactive event"
            );
            return false;
        }

        trace!(vehicle_id = %position.vehicle_id, "Queued position update");
        self.pending.insert(position.vehicle_id.clone(), position);
        self.timer.schedule(now_ms, self.interval);
        true
    }

    /// Flush if the scheduled deadline has passed. Returns the number of
    /// updates applied.
    pub fn poll(&mut self, now_ms: u64, store: &mut RaceStore) -> usize {
        if self.timer.poll(now_ms) {
            self.flush(store)
        } else {
            0
        }
    }

    /// Apply every pending update to the store in one pass.
    pub fn flush(&mut self, store: &mut RaceStore) -> usize {
        let count = self.pending.len();
        if count > 0 {
            store.apply_positions(self.pending.drain().map(|(_, p)| p));
            trace!(count, "Flushed position batch");
        }
        count
    }

    /// Drop pending updates without applying them. Used when a snapshot
    /// supersedes them.
    pub fn discard_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        self.timer.cancel();
        count
    }

    /// Force a final flush, then cancel the scheduled one.
    pub fn teardown(&mut self, store: &mut RaceStore) -> usize {
        let flushed = self.flush(store);
        self.timer.cancel();
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(id: &str, lat: f64) -> Position {
        Position::new(id, lat, -117.0, 0)
    }

    fn bound() -> UpdateBatcher {
        let mut batcher = UpdateBatcher::default();
        batcher.bind(Some("evt-42".to_string()));
        batcher
    }

    #[test]
    fn test_last_write_wins_within_window() {
        let mut batcher = bound();
        let mut store = RaceStore::default();

        batcher.queue_update("evt-42", pos("v1", 32.51), 0);
        batcher.queue_update("evt-42", pos("v1", 32.52), 40);
        assert_eq!(batcher.pending_len(), 1);

        assert_eq!(batcher.poll(99, &mut store), 0);
        assert!(store.position("v1").is_none());

        assert_eq!(batcher.poll(100, &mut store), 1);
        assert_eq!(store.position("v1").unwrap().lat, 32.52);
        assert_eq!(batcher.pending_len(), 0);
    }

    #[test]
    fn test_single_flush_scheduled_per_window() {
        let mut batcher = bound();
        batcher.queue_update("evt-42", pos("v1", 1.0), 0);
        batcher.queue_update("evt-42", pos("v2", 2.0), 60);
        assert_eq!(batcher.next_deadline(), Some(100));
    }

    #[test]
    fn test_new_window_after_flush() {
        let mut batcher = bound();
        let mut store = RaceStore::default();
        batcher.queue_update("evt-42", pos("v1", 1.0), 0);
        batcher.poll(100, &mut store);
        assert!(batcher.next_deadline().is_none());

        batcher.queue_update("evt-42", pos("v1", 2.0), 150);
        assert_eq!(batcher.next_deadline(), Some(250));
    }

    #[test]
    fn test_updates_for_other_event_are_discarded() {
        let mut batcher = bound();
        assert!(!batcher.queue_update("evt-1", pos("v1", 1.0), 0));
        assert_eq!(batcher.pending_len(), 0);
        assert!(batcher.next_deadline().is_none());
    }

    #[test]
    fn test_teardown_forces_final_flush() {
        let mut batcher = bound();
        let mut store = RaceStore::default();
        batcher.queue_update("evt-42", pos("v1", 1.0), 0);

        assert_eq!(batcher.teardown(&mut store), 1);
        assert!(store.position("v1").is_some());
        assert!(batcher.next_deadline().is_none());
        assert_eq!(batcher.poll(1_000, &mut store), 0);
    }

    #[test]
    fn test_discard_pending() {
        let mut batcher = bound();
        batcher.queue_update("evt-42", pos("v1", 1.0), 0);
        assert_eq!(batcher.discard_pending(), 1);
        assert!(batcher.next_deadline().is_none());
    }
}
