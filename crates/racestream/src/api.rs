//! REST collaborators of the live stream.
//!
//! The event list and a leaderboard snapshot come from plain JSON endpoints.
//! The snapshot bootstraps the leaderboard before the first streamed one.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::model::LeaderboardPayload;

/// An event as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    /// Event id used to subscribe.
    #[serde(alias = "event_id")]
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Lifecycle status reported by the server (e.g. `in_progress`).
    #[serde(default)]
    pub status: Option<String>,
}

/// The list endpoint answers either with a bare array or a wrapper object.
#[derive(Deserialize)]
#[serde(untagged)]
enum EventList {
    Bare(Vec<EventSummary>),
    Wrapped { events: Vec<EventSummary> },
}

impl From<EventList> for Vec<EventSummary> {
    fn from(list: EventList) -> Self {
        match list {
            EventList::Bare(events) | EventList::Wrapped { events } => events,
        }
    }
}

/// JSON client for the race cloud service.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a client for the given server.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(server.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: server.base_url.trim_end_matches('/').to_string(),
            token: server.token.clone(),
        })
    }

    /// Absolute URL for an API path.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// List events.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body cannot be decoded.
    pub async fn list_events(&self) -> Result<Vec<EventSummary>> {
        let list: EventList = self.get_json("events").await?;
        Ok(list.into())
    }

    /// Fetch the current leaderboard for an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body cannot be decoded.
    pub async fn leaderboard(&self, event_id: &str) -> Result<LeaderboardPayload> {
        self.get_json(&format!("events/{event_id}/leaderboard")).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!(url = %url, "GET");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
