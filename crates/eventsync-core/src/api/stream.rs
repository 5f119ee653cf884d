//! Server-sent alert notifications.
//!
//! The backend pushes `{type, data}` messages on `/alerts/stream`. They only
//! drive notifications; the caches are not updated from here.

use std::time::Duration;

use futures::StreamExt;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ApiClient, ApiError};

/// Delay before reconnecting after the stream drops.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const STREAM_ENDPOINT: &str = "/alerts/stream";

/// Connect timeout; the stream itself has no overall timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

const CHANNEL_CAPACITY: usize = 64;

/// Handshake message type, never forwarded.
const CONNECTED: &str = "connected";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Incremental decoder for the `data:` fields of an event stream.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk; returns the payload of every event it completes.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments (":") and other fields (event, id, retry) are ignored.
        }
        events
    }
}

enum StreamEnd {
    Closed,
    ReceiverGone,
}

/// Connects to the alert stream and keeps reconnecting until closed.
#[derive(Clone)]
pub struct LiveUpdates {
    client: Client,
    url: String,
    reconnect_delay: Duration,
}

impl LiveUpdates {
    pub fn new(api: &ApiClient) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: api.url(STREAM_ENDPOINT),
            reconnect_delay: RECONNECT_DELAY,
        })
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Start delivering messages. Delivery stops when the subscription is
    /// closed or dropped.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown, stop) = oneshot::channel();
        let task = tokio::spawn(run(self.clone(), sender, stop));
        Subscription {
            receiver,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    async fn stream_once(&self, sender: &mpsc::Sender<LiveMessage>) -> Result<StreamEnd, ApiError> {
        let response = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
        info!(url = %self.url, "Connected to live updates");

        let mut decoder = SseDecoder::default();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            for payload in decoder.push(&chunk?) {
                match serde_json::from_str::<LiveMessage>(&payload) {
                    Ok(message) if message.kind == CONNECTED => debug!("Live updates handshake"),
                    Ok(message) => {
                        if sender.send(message).await.is_err() {
                            return Ok(StreamEnd::ReceiverGone);
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable live message"),
                }
            }
        }
        Ok(StreamEnd::Closed)
    }
}

async fn run(live: LiveUpdates, sender: mpsc::Sender<LiveMessage>, mut stop: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut stop => return,
            end = live.stream_once(&sender) => match end {
                Ok(StreamEnd::ReceiverGone) => return,
                Ok(StreamEnd::Closed) => debug!("Live updates stream ended"),
                Err(e) => warn!(error = %e, "Live updates stream failed"),
            },
        }

        tokio::select! {
            _ = &mut stop => return,
            _ = tokio::time::sleep(live.reconnect_delay) => debug!("Reconnecting to live updates"),
        }
    }
}

/// An open live-update subscription.
pub struct Subscription {
    receiver: mpsc::Receiver<LiveMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Next message, or `None` once the subscription has stopped.
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        self.receiver.recv().await
    }

    /// Stop delivery, cancel any pending reconnect and wait for the task to end.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.receiver.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Live updates task ended abnormally");
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
