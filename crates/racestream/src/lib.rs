//! `racestream` - client for a race's live telemetry stream
//!
//! This library keeps one Server-Sent-Events connection per subscribed race
//! event alive across network failures, coalesces high-frequency position
//! updates, routes typed frames into a single store, and raises each
//! checkpoint notification exactly once.
//!
//! The core ([`session::LiveSession`] and everything below it) performs no
//! I/O and reads time from an injected [`clock::Clock`]; [`client`] drives it
//! on tokio with a real [`transport::Transport`].

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod api;
pub mod batcher;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;

pub use api::{ApiClient, EventSummary};
pub use client::{ClientHandle, ClientSnapshot, StreamClient};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, TransportCommand};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use metrics::ConnectionMetrics;
pub use model::{CrossingEvent, Freshness, LeaderboardEntry, Position};
pub use notify::{Interest, Notification};
pub use session::{LiveSession, SessionConfig, TransportEvent};
pub use store::{RaceStore, StoreSnapshot};
pub use transport::{HttpTransport, SseFrame, Transport};
