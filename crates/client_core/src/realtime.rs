use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientAction, RealtimeEvent};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::error::ClientError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything a subscriber can observe from the realtime connection:
/// lifecycle transitions plus the server-pushed events themselves.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    Push(RealtimeEvent),
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection on purpose; treated as final.
    ServerClosed,
    /// The stream dropped unexpectedly; reconnection kicks in.
    ConnectionLost,
    /// `disconnect()` was called locally.
    LocalClosed,
}

/// Contract for the push-event connection. The reconciler and the session
/// layer only ever hold `Arc<dyn RealtimeBridge>` so they can be exercised
/// without a live network.
#[async_trait]
pub trait RealtimeBridge: Send + Sync {
    async fn connect(&self, token: &str) -> Result<(), ClientError>;
    async fn disconnect(&self);
    /// Fire-and-forget; silently dropped when not connected.
    async fn send(&self, action: ClientAction);
    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent>;
    async fn is_connected(&self) -> bool;
}

pub struct MissingRealtimeBridge {
    events: broadcast::Sender<BridgeEvent>,
}

impl MissingRealtimeBridge {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { events }
    }
}

impl Default for MissingRealtimeBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeBridge for MissingRealtimeBridge {
    async fn connect(&self, _token: &str) -> Result<(), ClientError> {
        Err(ClientError::Transport(
            "realtime bridge is unavailable".to_string(),
        ))
    }

    async fn disconnect(&self) {}

    async fn send(&self, action: ClientAction) {
        debug!("realtime: dropping action without a bridge: {action:?}");
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    async fn is_connected(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.saturating_sub(1))
    }
}

/// Websocket-backed bridge. Maintains at most one live connection,
/// authenticated with the current credential; on unexpected drop it
/// reconnects with exponential backoff up to a fixed attempt count.
pub struct WsRealtimeBridge {
    shared: Arc<BridgeShared>,
}

struct BridgeShared {
    server_url: String,
    policy: ReconnectPolicy,
    events: broadcast::Sender<BridgeEvent>,
    inner: Mutex<BridgeState>,
}

#[derive(Default)]
struct BridgeState {
    token: Option<String>,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    reader: Option<JoinHandle<()>>,
    // Bumped on every (re)connect and explicit disconnect so tasks spawned
    // for an older connection become inert.
    generation: u64,
}

impl WsRealtimeBridge {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_policy(server_url, ReconnectPolicy::default())
    }

    pub fn with_policy(server_url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(BridgeShared {
                server_url: server_url.into().trim_end_matches('/').to_string(),
                policy,
                events,
                inner: Mutex::new(BridgeState::default()),
            }),
        }
    }
}

fn websocket_url(server_url: &str) -> Result<String, ClientError> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ClientError::Transport(
            "server url must start with http:// or https://".to_string(),
        ));
    };
    Ok(format!("{ws_base}/ws"))
}

impl BridgeShared {
    async fn open(self: &Arc<Self>, token: &str) -> Result<(), ClientError> {
        let ws_url = format!("{}?token={token}", websocket_url(&self.server_url)?);
        let (stream, _) = connect_async(&ws_url)
            .await
            .map_err(|err| ClientError::Transport(format!("websocket connect failed: {err}")))?;
        let (mut sink, mut source) = stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let generation = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            guard.token = Some(token.to_string());
            guard.outbound = Some(tx);
            if let Some(previous) = guard.reader.take() {
                previous.abort();
            }
            guard.generation
        };

        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<RealtimeEvent>(&text) {
                            Ok(event) => {
                                let _ = shared.events.send(BridgeEvent::Push(event));
                            }
                            Err(err) => warn!("realtime: dropping malformed frame: {err}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => break DisconnectReason::ServerClosed,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("realtime: receive failed: {err}");
                        break DisconnectReason::ConnectionLost;
                    }
                    None => break DisconnectReason::ConnectionLost,
                }
            };

            let token = {
                let mut guard = shared.inner.lock().await;
                if guard.generation != generation {
                    // A newer connection (or an explicit disconnect) already
                    // replaced this one.
                    return;
                }
                guard.outbound = None;
                guard.reader = None;
                guard.token.clone()
            };
            let _ = shared.events.send(BridgeEvent::Disconnected { reason });

            if reason == DisconnectReason::ConnectionLost {
                if let Some(token) = token {
                    shared.run_reconnect(generation, token).await;
                }
            }
        });

        let mut guard = self.inner.lock().await;
        if guard.generation == generation {
            guard.reader = Some(handle);
        }
        Ok(())
    }

    // Boxed so the open -> reader -> run_reconnect -> open cycle has a
    // concrete future type instead of an infinitely recursive opaque one.
    fn run_reconnect(
        self: &Arc<Self>,
        lost_generation: u64,
        token: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let shared = Arc::clone(self);
        Box::pin(async move {
            for attempt in 1..=shared.policy.max_attempts {
                tokio::time::sleep(shared.policy.delay_for(attempt)).await;
                {
                    let guard = shared.inner.lock().await;
                    if guard.generation != lost_generation {
                        return;
                    }
                }
                info!(
                    attempt,
                    max_attempts = shared.policy.max_attempts,
                    "realtime: attempting reconnect"
                );
                match shared.open(&token).await {
                    Ok(()) => {
                        let _ = shared.events.send(BridgeEvent::Connected);
                        info!("realtime: reconnected");
                        return;
                    }
                    Err(err) => warn!(attempt, "realtime: reconnect attempt failed: {err}"),
                }
            }
            warn!(
                attempts = shared.policy.max_attempts,
                "realtime: reconnect attempts exhausted"
            );
            let _ = shared.events.send(BridgeEvent::ReconnectExhausted {
                attempts: shared.policy.max_attempts,
            });
        })
    }
}

#[async_trait]
impl RealtimeBridge for WsRealtimeBridge {
    async fn connect(&self, token: &str) -> Result<(), ClientError> {
        {
            let guard = self.shared.inner.lock().await;
            if guard.outbound.is_some() {
                debug!("realtime: connect ignored, already connected");
                return Ok(());
            }
        }
        self.shared.open(token).await?;
        let _ = self.shared.events.send(BridgeEvent::Connected);
        info!("realtime: connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let (outbound, reader) = {
            let mut guard = self.shared.inner.lock().await;
            guard.generation += 1;
            guard.token = None;
            (guard.outbound.take(), guard.reader.take())
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        if outbound.is_some() {
            let _ = self.shared.events.send(BridgeEvent::Disconnected {
                reason: DisconnectReason::LocalClosed,
            });
            info!("realtime: disconnected");
        }
    }

    async fn send(&self, action: ClientAction) {
        let guard = self.shared.inner.lock().await;
        let Some(tx) = guard.outbound.as_ref() else {
            debug!("realtime: dropping action while disconnected: {action:?}");
            return;
        };
        match serde_json::to_string(&action) {
            Ok(text) => {
                let _ = tx.send(WsMessage::Text(text));
            }
            Err(err) => warn!("realtime: failed to encode action: {err}"),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.shared.inner.lock().await.outbound.is_some()
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
