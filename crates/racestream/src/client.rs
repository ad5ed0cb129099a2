//! Async live client.
//!
//! [`StreamClient::start`] spawns one background task that owns a
//! [`LiveSession`]. Every mutation goes through that task: callers send
//! commands over an unbounded channel via [`ClientHandle`], stream tasks
//! report frames over another channel, and timers are driven from the same
//! `tokio::select!` loop. Notifications are emitted on a bounded channel and
//! connection status on a `watch` channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::connection::{ConnectionStatus, TransportCommand};
use crate::error::{Error, Result};
use crate::model::{Freshness, LeaderboardPayload};
use crate::notify::Notification;
use crate::session::{LiveSession, SessionConfig, TransportEvent};
use crate::store::StoreSnapshot;
use crate::transport::Transport;

/// Capacity of the notification channel.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the channel stream tasks report on.
const TRANSPORT_CHANNEL_CAPACITY: usize = 1024;

/// Point-in-time view of the client, for display.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    /// Connection status.
    pub status: ConnectionStatus,
    /// How recently any frame arrived.
    pub stream_freshness: Option<Freshness>,
    /// Store contents.
    pub store: StoreSnapshot,
    /// Frames dropped because their payload was malformed.
    pub malformed_frames: u64,
}

enum Command {
    Subscribe(String),
    Unsubscribe,
    SeedLeaderboard {
        event_id: String,
        payload: LeaderboardPayload,
    },
    ShowAll(bool),
    Watch(Vec<String>),
    Select(Option<String>),
    Snapshot(oneshot::Sender<ClientSnapshot>),
    Shutdown,
}

/// Cloneable handle to a running [`StreamClient`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Subscribe(_) => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
            Self::SeedLeaderboard { .. } => "SeedLeaderboard",
            Self::ShowAll(_) => "ShowAll",
            Self::Watch(_) => "Watch",
            Self::Select(_) => "Select",
            Self::Snapshot(_) => "Snapshot",
            Self::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl ClientHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ClientClosed)
    }

    /// Subscribe to an event's live stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub fn subscribe(&self, event_id: impl Into<String>) -> Result<()> {
        self.send(Command::Subscribe(event_id.into()))
    }

    /// Drop the current subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub fn unsubscribe(&self) -> Result<()> {
        self.send(Command::Unsubscribe)
    }

    /// Install a REST leaderboard snapshot for `event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub fn seed_leaderboard(
        &self,
        event_id: impl Into<String>,
        payload: LeaderboardPayload,
    ) -> Result<()> {
        self.send(Command::SeedLeaderboard {
            event_id: event_id.into(),
            payload,
        })
    }

    /// Toggle notifications for every vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub fn set_show_all(&self, show_all: bool) -> Result<()> {
        self.send(Command::ShowAll(show_all))
    }

    /// Replace the notification watch list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub fn set_watch_list(&self, vehicles: Vec<String>) -> Result<()> {
        self.send(Command::Watch(vehicles))
    }

    /// Change the selected vehicle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub fn set_selected(&self, vehicle_id: Option<String>) -> Result<()> {
        self.send(Command::Select(vehicle_id))
    }

    /// Read the current state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client has shut down.
    pub async fn snapshot(&self) -> Result<ClientSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| Error::ClientClosed)
    }

    /// Watch connection status transitions.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stop the client and wait for its task to finish. Open streams are
    /// closed and pending position updates are flushed first.
    pub async fn shutdown(&self) {
        if self.send(Command::Shutdown).is_ok() {
            self.commands.closed().await;
        }
    }
}

/// Background task owning a [`LiveSession`].
#[derive(Debug)]
pub struct StreamClient {
    session: LiveSession,
    clock: SharedClock,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    notifications: mpsc::Sender<Notification>,
    streams: HashMap<u64, JoinHandle<()>>,
}

impl StreamClient {
    /// Start a client on the wall clock.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
    ) -> (ClientHandle, mpsc::Receiver<Notification>) {
        Self::start_with_clock(config, transport, Arc::new(SystemClock))
    }

    /// Start a client on the given clock.
    pub fn start_with_clock(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> (ClientHandle, mpsc::Receiver<Notification>) {
        let session = LiveSession::new(config, Arc::clone(&clock));
        let status = session.subscribe_status();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let (notifications, notifications_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let client = Self {
            session,
            clock,
            transport,
            commands,
            events_tx,
            events_rx,
            notifications,
            streams: HashMap::new(),
        };
        tokio::spawn(client.run());

        (
            ClientHandle {
                commands: commands_tx,
                status,
            },
            notifications_rx,
        )
    }

    async fn run(mut self) {
        debug!("Live client started");
        loop {
            let wait = self
                .session
                .next_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(self.clock.now_ms())));

            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.on_command(command),
                },
                Some(event) = self.events_rx.recv() => {
                    let commands = self.session.handle(event);
                    self.execute(commands);
                }
                () = tokio::time::sleep(wait.unwrap_or(Duration::MAX)), if wait.is_some() => {
                    let commands = self.session.tick();
                    self.execute(commands);
                }
            }

            self.emit_notifications();
        }

        let commands = self.session.unsubscribe();
        self.execute(commands);
        for (_, task) in self.streams.drain() {
            task.abort();
        }
        info!("Live client stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(event_id) => {
                let commands = self.session.subscribe(&event_id);
                self.execute(commands);
            }
            Command::Unsubscribe => {
                let commands = self.session.unsubscribe();
                self.execute(commands);
            }
            Command::SeedLeaderboard { event_id, payload } => {
                self.session.seed_leaderboard(&event_id, payload);
            }
            Command::ShowAll(show_all) => self.session.set_show_all(show_all),
            Command::Watch(vehicles) => self.session.set_watch_list(vehicles),
            Command::Select(vehicle) => self.session.set_selected(vehicle),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn snapshot(&mut self) -> ClientSnapshot {
        ClientSnapshot {
            status: self.session.status(),
            stream_freshness: self.session.stream_freshness(),
            store: self.session.store().snapshot(),
            malformed_frames: self.session.router_stats().malformed,
        }
    }

    fn execute(&mut self, commands: Vec<TransportCommand>) {
        for command in commands {
            match command {
                TransportCommand::Open {
                    event_id,
                    generation,
                } => {
                    let task = tokio::spawn(pump(
                        Arc::clone(&self.transport),
                        event_id,
                        generation,
                        self.events_tx.clone(),
                    ));
                    self.streams.insert(generation, task);
                }
                TransportCommand::Close { generation } => {
                    if let Some(task) = self.streams.remove(&generation) {
                        task.abort();
                    }
                }
            }
        }
    }

    fn emit_notifications(&mut self) {
        for notification in self.session.drain_notifications() {
            match self.notifications.try_send(notification) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!(crossing_id = %dropped.crossing.id, "Notification channel full, dropping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Read one connection's frames into the owner's channel, in order.
async fn pump(
    transport: Arc<dyn Transport>,
    event_id: String,
    generation: u64,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut frames = match transport.open(&event_id).await {
        Ok(frames) => frames,
        Err(err) => {
            let _ = events
                .send(TransportEvent::Failed {
                    generation,
                    error: err.to_string(),
                })
                .await;
            return;
        }
    };

    if events
        .send(TransportEvent::Opened { generation })
        .await
        .is_err()
    {
        return;
    }

    let error = loop {
        match frames.next().await {
            Some(Ok(frame)) => {
                let event = TransportEvent::Frame {
                    generation,
                    name: frame.event,
                    data: frame.data,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Some(Err(err)) => break err,
            None => break Error::stream_closed(&event_id, "server closed the stream"),
        }
    };

    let _ = events
        .send(TransportEvent::Failed {
            generation,
            error: error.to_string(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::connection::ConnectionState;
    use crate::transport::{FrameStream, SseFrame};

    /// What the fake does on the next `open`.
    enum Script {
        Refuse,
        /// Yield the frames, then stay open.
        Frames(Vec<(&'static str, &'static str)>),
    }

    #[derive(Default)]
    struct FakeTransport {
        scripts: Mutex<VecDeque<Script>>,
        opened: Mutex<Vec<String>>,
    }

    impl std::fmt::Debug for FakeTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("FakeTransport")
        }
    }

    impl FakeTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                opened: Mutex::new(Vec::new()),
            })
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(&self, event_id: &str) -> Result<FrameStream> {
            self.opened.lock().unwrap().push(event_id.to_string());
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Refuse) => Err(Error::stream_closed(event_id, "refused")),
                Some(Script::Frames(frames)) => {
                    let frames: Vec<Result<SseFrame>> = frames
                        .into_iter()
                        .map(|(event, data)| {
                            Ok(SseFrame {
                                event: event.to_string(),
                                data: data.to_string(),
                                id: None,
                                retry_ms: None,
                            })
                        })
                        .collect();
                    Ok(Box::pin(
                        futures::stream::iter(frames).chain(futures::stream::pending()),
                    ))
                }
                None => Ok(Box::pin(futures::stream::pending())),
            }
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            batch_interval: Duration::from_millis(10),
            backoff_schedule_ms: vec![20, 40],
            ..SessionConfig::default()
        }
    }

    async fn eventually<F>(handle: &ClientHandle, mut check: F) -> ClientSnapshot
    where
        F: FnMut(&ClientSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = handle.snapshot().await.unwrap();
                if check(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached")
    }

    #[tokio::test]
    async fn test_snapshot_and_batched_positions() {
        crate::logging::init_test_logging();
        let transport = FakeTransport::new(vec![Script::Frames(vec![
            ("connected", "{}"),
            (
                "snapshot",
                r#"{"vehicles":[{"vehicle_id":"v1","lat":32.5,"lon":-117.0},{"vehicle_id":"v2","lat":32.6,"lon":-117.1}]}"#,
            ),
            ("position", r#"{"vehicle_id":"v1","lat":32.51,"lon":-117.0}"#),
            ("position", r#"{"vehicle_id":"v1","lat":32.52,"lon":-117.0}"#),
        ])]);
        let (handle, _notes) = StreamClient::start(fast_config(), transport.clone());
        handle.subscribe("evt-42").unwrap();

        let snapshot = eventually(&handle, |s| {
            s.store
                .positions
                .iter()
                .any(|p| p.vehicle_id == "v1" && (p.lat - 32.52).abs() < f64::EPSILON)
        })
        .await;
        assert_eq!(snapshot.store.positions.len(), 2);
        assert!(snapshot.status.connected);
        assert_eq!(transport.opened(), vec!["evt-42"]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_refusal() {
        let transport = FakeTransport::new(vec![Script::Refuse, Script::Frames(vec![])]);
        let (handle, _notes) = StreamClient::start(fast_config(), transport.clone());
        let mut status = handle.status();
        handle.subscribe("evt-42").unwrap();

        let connected = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.connected))
            .await
            .expect("never connected")
            .unwrap()
            .clone();
        assert_eq!(connected.metrics.reconnect_count, 1);
        assert!(connected.metrics.last_error.is_none());
        assert_eq!(transport.opened().len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_crossing_notifies_once() {
        let crossing = r#"{"id":"c1","vehicle_id":"v1","vehicle_number":"12","checkpoint_id":"3"}"#;
        let transport = FakeTransport::new(vec![Script::Frames(vec![
            ("checkpoint", crossing),
            ("checkpoint", crossing),
        ])]);
        let (handle, mut notes) = StreamClient::start(fast_config(), transport);
        handle.set_show_all(true).unwrap();
        handle.subscribe("evt-42").unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), notes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.crossing.id, "c1");

        eventually(&handle, |s| s.store.recent_crossings.len() == 2).await;
        assert!(notes.try_recv().is_err());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_reconnecting() {
        let transport = FakeTransport::new(vec![Script::Refuse]);
        let config = SessionConfig {
            backoff_schedule_ms: vec![50],
            ..fast_config()
        };
        let (handle, _notes) = StreamClient::start(config, transport.clone());
        let mut status = handle.status();
        handle.subscribe("evt-42").unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.next_retry_ms.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        handle.unsubscribe().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.opened().len(), 1);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.status.state, ConnectionState::Closed);
        assert!(snapshot.status.event_id.is_none());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_errors_after_shutdown() {
        let (handle, _notes) = StreamClient::start(fast_config(), FakeTransport::new(vec![]));
        handle.shutdown().await;
        assert!(handle.subscribe("evt-42").unwrap_err().is_client_closed());
        assert!(handle.snapshot().await.unwrap_err().is_client_closed());
    }
}
