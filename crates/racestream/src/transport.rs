//! Server-Sent Events transport.
//!
//! The live feed is a `text/event-stream` response. [`SseDecoder`] turns raw
//! body chunks into [`SseFrame`]s; [`Transport`] abstracts how a stream is
//! opened so the client can be driven by an in-memory fake in tests.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Event name used when a frame carries no `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last event id, if the server sent one.
    pub id: Option<String>,
    /// Reconnect hint from the server, in milliseconds.
    pub retry_ms: Option<u64>,
}

/// Incremental `text/event-stream` parser.
///
/// Input may be split at any byte; lines end in `\n` or `\r\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry_ms: Option<u64>,
}

impl SseDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body, returning every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry_ms = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            data,
            id: self.last_id.clone(),
            retry_ms: self.retry_ms,
        })
    }
}

/// A stream of decoded frames. Ends when the server closes the response.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame>> + Send>>;

/// Opens live streams for events.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Open the live stream for `event_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream could not be established.
    async fn open(&self, event_id: &str) -> Result<FrameStream>;
}

/// Decode a byte stream into frames.
pub fn frames_from_bytes<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    let state = (bytes, SseDecoder::new(), VecDeque::new());
    let frames = futures::stream::unfold(state, |(mut bytes, mut decoder, mut ready)| async move {
        loop {
            if let Some(frame) = ready.pop_front() {
                return Some((Ok(frame), (bytes, decoder, ready)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => ready.extend(decoder.feed(chunk.as_ref())),
                Some(Err(err)) => return Some((Err(err.into()), (bytes, decoder, ready))),
                None => return None,
            }
        }
    });
    Box::pin(frames)
}

/// SSE over HTTP using reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    /// Create a transport for the given server.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(server: &ServerConfig) -> Result<Self> {
        // No overall timeout: the response body is the live stream.
        let client = reqwest::Client::builder()
            .connect_timeout(server.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: server.base_url.trim_end_matches('/').to_string(),
            token: server.token.clone(),
        })
    }

    /// URL of the live stream for `event_id`.
    #[must_use]
    pub fn stream_url(&self, event_id: &str) -> String {
        format!("{}/api/v1/events/{event_id}/stream", self.base_url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, event_id: &str) -> Result<FrameStream> {
        let url = self.stream_url(event_id);
        debug!(event_id, url = %url, "Opening event stream");

        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
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

        Ok(frames_from_bytes(response.bytes_stream().boxed()))
    }
}
