//! One client's live subscription, without any I/O.
//!
//! [`LiveSession`] ties the connection manager, batcher, router,
//! notification deduplicator and store together. It is driven by three
//! kinds of input (subscription changes, transport events, and timer
//! ticks) and answers with [`TransportCommand`]s for whoever owns the
//! sockets. Because time comes from an injected [`Clock`], the whole
//! session runs deterministically under a manual clock.
//!
//! [`Clock`]: crate::clock::Clock

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::batcher::{UpdateBatcher, DEFAULT_BATCH_INTERVAL};
use crate::clock::SharedClock;
use crate::connection::{
    ConnectionManager, ConnectionStatus, TransportCommand, DEFAULT_BACKOFF_SCHEDULE_MS,
};
use crate::metrics::{MetricsTracker, DEFAULT_DEGRADED_AFTER, DEFAULT_RATE_WINDOW};
use crate::model::{Freshness, FreshnessThresholds, LeaderboardPayload};
use crate::notify::{
    Interest, Notification, NotificationDeduplicator, DEFAULT_SEEN_LIMIT, DEFAULT_SEEN_TRIM_TO,
};
use crate::router::{EventRouter, RouteContext, Routed, RouterStats};
use crate::store::{RaceStore, DEFAULT_MAX_RECENT_CROSSINGS};

/// Tunables for a [`LiveSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Position batch window.
    pub batch_interval: Duration,
    /// Reconnect delays in milliseconds; the last entry repeats.
    pub backoff_schedule_ms: Vec<u64>,
    /// Consecutive failures before the connection is reported degraded.
    pub degraded_after: u32,
    /// Window for the message-rate metric.
    pub rate_window: Duration,
    /// Crossings retained in the store.
    pub max_recent_crossings: usize,
    /// Notification interest.
    pub interest: Interest,
    /// Seen-set size that triggers a trim.
    pub seen_limit: usize,
    /// Seen-set size after a trim.
    pub seen_trim_to: usize,
    /// Freshness thresholds.
    pub freshness: FreshnessThresholds,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_interval: DEFAULT_BATCH_INTERVAL,
            backoff_schedule_ms: DEFAULT_BACKOFF_SCHEDULE_MS.to_vec(),
            degraded_after: DEFAULT_DEGRADED_AFTER,
            rate_window: DEFAULT_RATE_WINDOW,
            max_recent_crossings: DEFAULT_MAX_RECENT_CROSSINGS,
            interest: Interest::default(),
            seen_limit: DEFAULT_SEEN_LIMIT,
            seen_trim_to: DEFAULT_SEEN_TRIM_TO,
            freshness: FreshnessThresholds::default(),
        }
    }
}

/// Something the transport reports about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The stream is open.
    Opened {
        /// Connection generation.
        generation: u64,
    },
    /// A named frame arrived.
    Frame {
        /// Connection generation.
        generation: u64,
        /// SSE event name.
        name: String,
        /// SSE data (JSON).
        data: String,
    },
    /// The stream failed to open, errored, or ended.
    Failed {
        /// Connection generation.
        generation: u64,
        /// What went wrong.
        error: String,
    },
}

/// Live subscription state for one client.
#[derive(Debug)]
pub struct LiveSession {
    clock: SharedClock,
    connection: ConnectionManager,
    batcher: UpdateBatcher,
    router: EventRouter,
    dedup: NotificationDeduplicator,
    store: RaceStore,
    freshness: FreshnessThresholds,
    notifications: VecDeque<Notification>,
}

impl LiveSession {
    /// Create an idle session.
    #[must_use]
    pub fn new(config: SessionConfig, clock: SharedClock) -> Self {
        let metrics = MetricsTracker::new(config.rate_window, config.degraded_after);
        Self {
            clock,
            connection: ConnectionManager::new(config.backoff_schedule_ms, metrics),
            batcher: UpdateBatcher::new(config.batch_interval),
            router: EventRouter::new(),
            dedup: NotificationDeduplicator::new(
                config.interest,
                config.seen_limit,
                config.seen_trim_to,
            ),
            store: RaceStore::new(config.max_recent_crossings),
            freshness: config.freshness,
            notifications: VecDeque::new(),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    // === Subscription ===

    /// Subscribe to `event_id`. Subscribing to the current event again is a
    /// no-op; subscribing to another event tears the current one down first.
    pub fn subscribe(&mut self, event_id: &str) -> Vec<TransportCommand> {
        let now = self.now();
        if self.connection.event_id() == Some(event_id) {
            return self.connection.connect(event_id, now);
        }

        let mut commands = self.teardown();
        info!(event_id, "Subscribing");
        self.batcher.bind(Some(event_id.to_string()));
        commands.extend(self.connection.connect(event_id, now));
        commands
    }

    /// Drop the current subscription, if any.
    pub fn unsubscribe(&mut self) -> Vec<TransportCommand> {
        let commands = self.teardown();
        self.batcher.bind(None);
        commands
    }

    /// Teardown order matters: timers first so nothing fires mid-teardown,
    /// then the final flush, then the socket, then event-scoped state.
    fn teardown(&mut self) -> Vec<TransportCommand> {
        let Some(event_id) = self.connection.event_id().map(ToString::to_string) else {
            return Vec::new();
        };
        let now = self.now();

        let cancelled = self.connection.cancel_reconnect();
        let flushed = self.batcher.teardown(&mut self.store);
        let commands = self.connection.disconnect(now);
        self.store.reset_event();

        info!(
            event_id = %event_id,
            cancelled_reconnect = cancelled,
            flushed,
            "Unsubscribed"
        );
        commands
    }

    /// Event currently subscribed to.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        self.connection.event_id()
    }

    // === Inputs ===

    /// Feed a transport callback.
    pub fn handle(&mut self, event: TransportEvent) -> Vec<TransportCommand> {
        let now = self.now();
        match event {
            TransportEvent::Opened { generation } => {
                self.connection.on_open(generation, now);
                Vec::new()
            }
            TransportEvent::Failed { generation, error } => {
                self.connection.on_failure(generation, &error, now)
            }
            TransportEvent::Frame {
                generation,
                name,
                data,
            } => {
                self.handle_frame(generation, &name, &data, now);
                Vec::new()
            }
        }
    }

    fn handle_frame(&mut self, generation: u64, name: &str, data: &str, now: u64) {
        if !self.connection.is_current(generation) {
            debug!(generation, event = name, "Dropping frame from superseded connection");
            return;
        }
        let Some(event_id) = self.connection.event_id().map(ToString::to_string) else {
            return;
        };

        let routed = self.router.route(
            name,
            data,
            RouteContext {
                event_id: &event_id,
                now_ms: now,
                store: &mut self.store,
                batcher: &mut self.batcher,
                metrics: self.connection.metrics_mut(),
            },
        );

        match routed {
            Some(Routed::Checkpoint(crossing)) => {
                if let Some(notification) = self.dedup.process(&crossing) {
                    self.notifications.push_back(notification);
                }
            }
            Some(Routed::Heartbeat { .. }) => self.connection.publish(now),
            _ => {}
        }
    }

    /// Fire any due timers.
    pub fn tick(&mut self) -> Vec<TransportCommand> {
        let now = self.now();
        self.batcher.poll(now, &mut self.store);
        self.connection.poll(now)
    }

    /// Earliest pending timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        match (self.batcher.next_deadline(), self.connection.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Install a leaderboard fetched over REST for `event_id`. Ignored if
    /// the session has moved on to another event or the stream already
    /// delivered a leaderboard.
    pub fn seed_leaderboard(&mut self, event_id: &str, payload: LeaderboardPayload) -> bool {
        if self.connection.event_id() != Some(event_id) {
            debug!(event_id, "Ignoring leaderboard bootstrap for inactive event");
            return false;
        }
        let updated = payload.ts.unwrap_or_else(|| self.now());
        self.store.seed_leaderboard(payload.entries, updated)
    }

    // === Notifications ===

    /// Take every notification raised since the last call.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// Toggle notifications for every vehicle.
    pub fn set_show_all(&mut self, show_all: bool) {
        self.dedup.set_show_all(show_all);
    }

    /// Replace the notification watch list.
    pub fn set_watch_list(&mut self, vehicles: impl IntoIterator<Item = String>) {
        self.dedup.set_watch_list(vehicles);
    }

    /// Change the selected vehicle.
    pub fn set_selected(&mut self, vehicle_id: Option<String>) {
        self.dedup.set_selected(vehicle_id);
    }

    // === Reads ===

    /// Live state.
    #[must_use]
    pub fn store(&self) -> &RaceStore {
        &self.store
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&mut self) -> ConnectionStatus {
        let now = self.now();
        self.connection.status(now)
    }

    /// Watch connection status transitions.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe_status()
    }

    /// How recently any frame arrived, if one has.
    #[must_use]
    pub fn stream_freshness(&mut self) -> Option<Freshness> {
        let now = self.now();
        let last = self.connection.status(now).metrics.last_message_ms?;
        Some(Freshness::classify(now, last, self.freshness))
    }

    /// Configured freshness thresholds.
    #[must_use]
    pub fn freshness_thresholds(&self) -> FreshnessThresholds {
        self.freshness
    }

    /// Frame counters.
    #[must_use]
    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }
}
