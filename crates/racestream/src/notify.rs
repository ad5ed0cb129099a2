//! Exactly-once checkpoint notifications.
//!
//! Crossings are turned into notifications at most once each, filtered by
//! what the subscriber is interested in. The set of already processed
//! crossing ids is bounded so a multi-hour race cannot grow it without
//! limit.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::model::CrossingEvent;

/// Seen-set size that triggers a trim.
pub const DEFAULT_SEEN_LIMIT: usize = 100;

/// Seen-set size after a trim.
pub const DEFAULT_SEEN_TRIM_TO: usize = 50;

/// Which crossings the subscriber wants to hear about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    /// Notify for every vehicle.
    pub show_all: bool,
    /// Vehicles explicitly watched.
    pub watched: BTreeSet<String>,
    /// The single vehicle selected in the UI.
    pub selected: Option<String>,
}

/// Why a notification was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestReason {
    /// Show-all is on.
    ShowAll,
    /// Vehicle is on the watch list.
    Watched,
    /// Vehicle is the selected one.
    Selected,
}

impl fmt::Display for InterestReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShowAll => write!(f, "all"),
            Self::Watched => write!(f, "watched"),
            Self::Selected => write!(f, "selected"),
        }
    }
}

impl Interest {
    /// Evaluate interest in a vehicle. Show-all wins over the watch list,
    /// which wins over the selection.
    #[must_use]
    pub fn matches(&self, vehicle_id: &str) -> Option<InterestReason> {
        if self.show_all {
            Some(InterestReason::ShowAll)
        } else if self.watched.contains(vehicle_id) {
            Some(InterestReason::Watched)
        } else if self.selected.as_deref() == Some(vehicle_id) {
            Some(InterestReason::Selected)
        } else {
            None
        }
    }
}

/// A user-facing checkpoint notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The crossing being announced.
    pub crossing: CrossingEvent,
    /// Which interest rule matched.
    pub reason: InterestReason,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.crossing)
    }
}

/// Converts crossings into notifications, once per crossing id.
#[derive(Debug)]
pub struct NotificationDeduplicator {
    interest: Interest,
    seen: HashSet<String>,
    order: VecDeque<String>,
    limit: usize,
    trim_to: usize,
}

impl Default for NotificationDeduplicator {
    fn default() -> Self {
        Self::new(Interest::default(), DEFAULT_SEEN_LIMIT, DEFAULT_SEEN_TRIM_TO)
    }
}

impl NotificationDeduplicator {
    /// Create a deduplicator. When more than `limit` ids are remembered the
    /// oldest are dropped until `trim_to` remain.
    #[must_use]
    pub fn new(interest: Interest, limit: usize, trim_to: usize) -> Self {
        Self {
            interest,
            seen: HashSet::new(),
            order: VecDeque::new(),
            limit,
            trim_to: trim_to.min(limit),
        }
    }

    /// Current interest.
    #[must_use]
    pub fn interest(&self) -> &Interest {
        &self.interest
    }

    /// Number of remembered crossing ids.
    #[must_use]
    pub fn seen_len(&self) -> usize {
        self.order.len()
    }

    /// Whether a crossing id has already been processed.
    #[must_use]
    pub fn has_seen(&self, crossing_id: &str) -> bool {
        self.seen.contains(crossing_id)
    }

    /// Toggle show-all.
    pub fn set_show_all(&mut self, show_all: bool) {
        self.interest.show_all = show_all;
    }

    /// Replace the watch list. A different list forgets every processed id.
    pub fn set_watch_list<I, S>(&mut self, vehicles: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let watched: BTreeSet<String> = vehicles.into_iter().map(Into::into).collect();
        if watched != self.interest.watched {
            self.interest.watched = watched;
            self.clear_seen();
        }
    }

    /// Change the selected vehicle. A different selection forgets every
    /// processed id.
    pub fn set_selected(&mut self, vehicle_id: Option<String>) {
        if vehicle_id != self.interest.selected {
            self.interest.selected = vehicle_id;
            self.clear_seen();
        }
    }

    /// Forget every processed id.
    pub fn clear_seen(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    /// Process one crossing. Returns a notification the first time an
    /// interesting crossing is seen; uninteresting crossings are remembered
    /// too so they are not evaluated again.
    pub fn process(&mut self, crossing: &CrossingEvent) -> Option<Notification> {
        if self.seen.contains(&crossing.id) {
            trace!(crossing_id = %crossing.id, "Crossing already processed");
            return None;
        }
        self.remember(crossing.id.clone());

        let reason = self.interest.matches(&crossing.vehicle_id)?;
        debug!(crossing_id = %crossing.id, %reason, "Raising checkpoint notification");
        Some(Notification {
            crossing: crossing.clone(),
            reason,
        })
    }

    /// Process a batch of crossings in arrival order.
    pub fn process_all<'a>(
        &mut self,
        crossings: impl IntoIterator<Item = &'a CrossingEvent>,
    ) -> Vec<Notification> {
        crossings
            .into_iter()
            .filter_map(|c| self.process(c))
            .collect()
    }

    fn remember(&mut self, id: String) {
        self.seen.insert(id.clone());
        self.order.push_back(id);

        if self.order.len() > self.limit {
            let excess = self.order.len() - self.trim_to;
            for old in self.order.drain(..excess) {
                self.seen.remove(&old);
            }
            debug!(kept = self.order.len(), "Trimmed notification history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crossing(id: &str, vehicle: &str) -> CrossingEvent {
        CrossingEvent {
            id: id.to_string(),
            vehicle_id: vehicle.to_string(),
            vehicle_number: String::new(),
            team_name: String::new(),
            checkpoint_id: "1".to_string(),
            checkpoint_name: None,
            lap_number: None,
            timestamp_ms: 0,
        }
    }

    fn show_all() -> NotificationDeduplicator {
        NotificationDeduplicator::new(
            Interest {
                show_all: true,
                ..Interest::default()
            },
            DEFAULT_SEEN_LIMIT,
            DEFAULT_SEEN_TRIM_TO,
        )
    }

    #[test]
    fn test_interest_precedence() {
        let interest = Interest {
            show_all: false,
            watched: ["v1".to_string()].into_iter().collect(),
            selected: Some("v1".to_string()),
        };
        assert_eq!(interest.matches("v1"), Some(InterestReason::Watched));

        let interest = Interest {
            selected: Some("v2".to_string()),
            ..Interest::default()
        };
        assert_eq!(interest.matches("v2"), Some(InterestReason::Selected));
        assert_eq!(interest.matches("v3"), None);

        let interest = Interest {
            show_all: true,
            watched: ["v1".to_string()].into_iter().collect(),
            selected: None,
        };
        assert_eq!(interest.matches("v1"), Some(InterestReason::ShowAll));
    }

    #[test]
    fn test_duplicate_crossing_notifies_once() {
        let mut dedup = show_all();
        let c1 = crossing("c1", "v1");
        assert!(dedup.process(&c1).is_some());
        assert!(dedup.process(&c1).is_none());
    }

    #[test]
    fn test_uninteresting_crossing_is_still_marked_seen() {
        let mut dedup = NotificationDeduplicator::default();
        let c1 = crossing("c1", "v1");
        assert!(dedup.process(&c1).is_none());
        assert!(dedup.has_seen("c1"));

        // Turning on show-all alone does not re-evaluate it.
        dedup.set_show_all(true);
        assert!(dedup.process(&c1).is_none());
    }

    #[test]
    fn test_seen_set_is_bounded() {
        let mut dedup = show_all();
        for i in 0..150 {
            dedup.process(&crossing(&format!("c{i}"), "v1"));
            assert!(dedup.seen_len() <= DEFAULT_SEEN_LIMIT);
            if i == 100 {
                assert_eq!(dedup.seen_len(), DEFAULT_SEEN_TRIM_TO);
            }
        }
        // Oldest evicted first.
        assert!(!dedup.has_seen("c0"));
        assert!(dedup.has_seen("c149"));
    }

    #[test]
    fn test_changing_watch_list_clears_seen() {
        let mut dedup = NotificationDeduplicator::default();
        dedup.set_watch_list(["v1"]);
        let c = crossing("c1", "v2");
        assert!(dedup.process(&c).is_none());

        dedup.set_watch_list(["v2"]);
        assert_eq!(dedup.seen_len(), 0);
        let n = dedup.process(&c).unwrap();
        assert_eq!(n.reason, InterestReason::Watched);
    }

    #[test]
    fn test_same_watch_list_keeps_seen() {
        let mut dedup = NotificationDeduplicator::default();
        dedup.set_watch_list(["v1"]);
        dedup.process(&crossing("c1", "v1"));
        dedup.set_watch_list(["v1"]);
        assert_eq!(dedup.seen_len(), 1);
    }

    #[test]
    fn test_changing_selection_clears_seen() {
        let mut dedup = NotificationDeduplicator::default();
        dedup.process(&crossing("c1", "v9"));
        dedup.set_selected(Some("v9".to_string()));
        assert_eq!(dedup.seen_len(), 0);
        assert_eq!(
            dedup.process(&crossing("c1", "v9")).unwrap().reason,
            InterestReason::Selected
        );
    }

    #[test]
    fn test_process_all_in_arrival_order() {
        let mut dedup = show_all();
        let batch = vec![crossing("a", "v1"), crossing("b", "v2"), crossing("a", "v1")];
        let notes = dedup.process_all(&batch);
        let ids: Vec<&str> = notes.iter().map(|n| n.crossing.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
