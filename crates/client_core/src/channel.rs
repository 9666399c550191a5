use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use shared::protocol::PushEvent;

use crate::session::SessionStore;

/// Connection lifecycle as reported to the render sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Doubling reconnect delay with a floor and a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    floor_ms: u64,
    ceiling_ms: u64,
    current_ms: u64,
}

impl Backoff {
    pub fn new(floor_ms: u64, ceiling_ms: u64) -> Self {
        let floor_ms = floor_ms.max(1);
        Self {
            floor_ms,
            ceiling_ms: ceiling_ms.max(floor_ms),
            current_ms: floor_ms,
        }
    }

    /// Delay to wait before the next attempt. Doubles afterward, capped at
    /// the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_millis(self.current_ms);
        self.current_ms = self.current_ms.saturating_mul(2).min(self.ceiling_ms);
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = self.floor_ms;
    }

    pub fn current_ms(&self) -> u64 {
        self.current_ms
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(500, 10_000)
    }
}

/// One live push connection, reduced to a stream of text frames.
#[async_trait]
pub trait PushConnection: Send {
    /// Next text frame. `Ok(None)` is an orderly close, `Err` a transport
    /// failure; ping/pong/binary frames are handled below this interface.
    async fn next_text(&mut self) -> anyhow::Result<Option<String>>;
}

/// Dials push connections. Injected so the reconnect machinery is testable
/// without a socket.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn PushConnection>>;
}

/// Production transport over tokio-tungstenite.
pub struct WebSocketTransport;

struct WebSocketConnection<S> {
    stream: WebSocketStream<S>,
}

#[async_trait]
impl<S> PushConnection for WebSocketConnection<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    async fn next_text(&mut self) -> anyhow::Result<Option<String>> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(Some(text)),
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn PushConnection>> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

/// Events emitted by the channel toward the engine.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    StateChanged(ConnectionState),
    Push(PushEvent),
}

/// Single-flight push channel with exponential reconnect.
///
/// At most one connection generation is authoritative at a time; `connect()`
/// bumps the generation, and a superseded generation stops mutating state as
/// soon as it observes the bump, so late frames from a stale socket are
/// dropped on the floor.
pub struct RealtimeChannel {
    transport: Arc<dyn PushTransport>,
    session: Arc<SessionStore>,
    ws_url: String,
    backoff_config: Backoff,
    state: Mutex<ConnectionState>,
    generation: AtomicU64,
    events: broadcast::Sender<ChannelEvent>,
}

impl RealtimeChannel {
    pub fn new(
        ws_url: impl Into<String>,
        session: Arc<SessionStore>,
        transport: Arc<dyn PushTransport>,
    ) -> Arc<Self> {
        Self::with_backoff(ws_url, session, transport, Backoff::default())
    }

    pub fn with_backoff(
        ws_url: impl Into<String>,
        session: Arc<SessionStore>,
        transport: Arc<dyn PushTransport>,
        backoff: Backoff,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            transport,
            session,
            ws_url: ws_url.into(),
            backoff_config: backoff,
            state: Mutex::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// Open a connection, superseding any live one.
    pub fn connect(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.run(generation).await });
    }

    /// Tear the channel down; the superseded connection's later events are
    /// ignored.
    pub async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if *state != ConnectionState::Disconnected {
            *state = ConnectionState::Disconnected;
            let _ = self
                .events
                .send(ChannelEvent::StateChanged(ConnectionState::Disconnected));
        }
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut backoff = self.backoff_config;
        loop {
            if self.superseded(generation) {
                return;
            }

            // A valid access token is required before dialing; recover one
            // via refresh when absent, and stay down if that fails.
            let token = match self.session.access_token().await {
                Some(token) => token,
                None => {
                    if !self.session.refresh().await {
                        let _ = self
                            .transition(generation, ConnectionState::Disconnected)
                            .await;
                        return;
                    }
                    match self.session.access_token().await {
                        Some(token) => token,
                        None => {
                            let _ = self
                                .transition(generation, ConnectionState::Disconnected)
                                .await;
                            return;
                        }
                    }
                }
            };

            if !self
                .transition(generation, ConnectionState::Connecting)
                .await
            {
                return;
            }

            let url = match self.connect_url(&token) {
                Ok(url) => url,
                Err(err) => {
                    warn!(error = %err, "invalid push endpoint url");
                    let _ = self
                        .transition(generation, ConnectionState::Disconnected)
                        .await;
                    return;
                }
            };

            match self.transport.connect(&url).await {
                Ok(mut connection) => {
                    if self.superseded(generation) {
                        return;
                    }
                    backoff.reset();
                    if !self.transition(generation, ConnectionState::Connected).await {
                        return;
                    }
                    self.pump(generation, connection.as_mut()).await;
                    if self.superseded(generation) {
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "push connection attempt failed");
                }
            }

            if !self
                .transition(generation, ConnectionState::Disconnected)
                .await
            {
                return;
            }

            if self.session.refresh_token().await.is_none() {
                // Nothing to reauthenticate with; stay down until connect()
                // is called again.
                return;
            }

            // The close may have been an expired access token; refresh before
            // redialing. A failed refresh clears the session, and the next
            // pass through the loop top exits.
            let _ = self.session.refresh().await;

            if !self
                .transition(generation, ConnectionState::Reconnecting)
                .await
            {
                return;
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    async fn pump(&self, generation: u64, connection: &mut dyn PushConnection) {
        loop {
            match connection.next_text().await {
                Ok(Some(text)) => {
                    if self.superseded(generation) {
                        return;
                    }
                    match serde_json::from_str::<PushEvent>(&text) {
                        Ok(event) => {
                            let _ = self.events.send(ChannelEvent::Push(event));
                        }
                        Err(err) => {
                            debug!(error = %err, "dropping malformed push payload");
                        }
                    }
                }
                Ok(None) => {
                    info!("push connection closed");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "push connection errored");
                    return;
                }
            }
        }
    }

    /// Set the state and emit, unless this generation has been superseded.
    async fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        if self.superseded(generation) {
            return false;
        }
        let mut state = self.state.lock().await;
        if *state != next {
            *state = next;
            let _ = self.events.send(ChannelEvent::StateChanged(next));
        }
        true
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// The handshake cannot carry bearer headers, so the access token rides
    /// as a query parameter.
    fn connect_url(&self, token: &str) -> anyhow::Result<String> {
        let mut url = Url::parse(&self.ws_url)
            .with_context(|| format!("invalid push url: {}", self.ws_url))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url.into())
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
