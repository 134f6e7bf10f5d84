//! WebSocket client transport.
//!
//! Connects to `{server_url}/{room_id}` (see [`crate::relay::RelayServer`])
//! and keeps the connection alive from a background session task:
//!
//! ```text
//!   connect()
//!      │
//!      ▼
//!   Connecting ──ok──▶ Connected ──socket lost──┐
//!      ▲   │                                    │
//!      │   └─fail─▶ Error ── backoff ───────────┤
//!      └────────────────────────────────────────┘
//! ```
//!
//! Updates sent while the socket is down wait in an [`OutboundQueue`] and are
//! flushed, in order, right after the next successful connect.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{
    lock, ConnectionStatus, EventSender, Link, OutboundQueue, Transport, TransportError,
    TransportEvent, DEFAULT_OUTBOUND_CAPACITY,
};
use crate::protocol::{Channel, Frame};

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Give up after this many consecutive failures (`None` = never)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

struct Session {
    task: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct WsState {
    link: Link,
    outbound: OutboundQueue,
    /// Present only while the socket is open
    writer: Option<mpsc::UnboundedSender<Message>>,
    session: Option<Session>,
}

pub struct WebSocketTransport {
    server_url: String,
    policy: ReconnectPolicy,
    state: Arc<Mutex<WsState>>,
}

impl WebSocketTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_queue_capacity(server_url, DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_queue_capacity(server_url: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            server_url: server_url.into(),
            policy: ReconnectPolicy::default(),
            state: Arc::new(Mutex::new(WsState {
                link: Link::new(),
                outbound: OutboundQueue::new(queue_capacity),
                writer: None,
                session: None,
            })),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Updates waiting for a connection.
    pub fn queued(&self) -> usize {
        lock(&self.state).outbound.len()
    }

    fn send_frame(&self, frame: Frame) -> Result<(), Frame> {
        let state = lock(&self.state);
        let Some(writer) = &state.writer else {
            return Err(frame);
        };
        match frame.encode() {
            Ok(bytes) => writer
                .send(Message::Binary(bytes.into()))
                .map_err(|_| frame),
            Err(e) => {
                log::warn!("Dropping unencodable frame: {e}");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, room_id: &str, events: EventSender) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if let Some(previous) = state.session.take() {
            previous.task.abort();
            state.writer = None;
        }
        state.link.attach(events);

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), room_id);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            url,
            self.policy.clone(),
            self.state.clone(),
            shutdown_rx,
        ));
        state.session = Some(Session {
            task,
            shutdown: Some(shutdown_tx),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let session = {
            let mut state = lock(&self.state);
            state.outbound.clear();
            state.session.take()
        };

        let mut result = Ok(());
        if let Some(mut session) = session {
            if let Some(shutdown) = session.shutdown.take() {
                let _ = shutdown.send(());
            }
            if tokio::time::timeout(Duration::from_secs(2), &mut session.task)
                .await
                .is_err()
            {
                session.task.abort();
                result = Err(TransportError::Timeout);
            }
        }

        let mut state = lock(&self.state);
        state.writer = None;
        state.link.detach();
        result
    }

    fn send_update(&self, bytes: Vec<u8>) {
        if let Err(frame) = self.send_frame(Frame::document(bytes)) {
            let mut state = lock(&self.state);
            if state.outbound.push(frame.payload).is_some() {
                log::warn!("Outbound queue full, dropped oldest update");
            }
        }
    }

    fn send_ephemeral(&self, bytes: Vec<u8>) {
        if self.send_frame(Frame::ephemeral(bytes)).is_err() {
            log::trace!("Dropped ephemeral frame while offline");
        }
    }

    fn status(&self) -> ConnectionStatus {
        lock(&self.state).link.status()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.state).session.take() {
            session.task.abort();
        }
    }
}

/// Connect, pump frames until the socket drops, back off, repeat.
async fn run_session(
    url: String,
    policy: ReconnectPolicy,
    state: Arc<Mutex<WsState>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut attempt = 0u32;
    loop {
        lock(&state).link.set_status(ConnectionStatus::Connecting);

        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = &mut shutdown => return,
        };

        match connected {
            Ok((ws_stream, _)) => {
                attempt = 0;
                log::info!("Connected to {url}");
                let (mut sink, mut stream) = ws_stream.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
                {
                    let mut st = lock(&state);
                    let queued = st.outbound.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued updates", queued.len());
                    }
                    for payload in queued {
                        match Frame::document(payload).encode() {
                            Ok(bytes) => {
                                let _ = out_tx.send(Message::Binary(bytes.into()));
                            }
                            Err(e) => log::warn!("Dropping unencodable frame: {e}"),
                        }
                    }
                    st.writer = Some(out_tx);
                    st.link.set_status(ConnectionStatus::Connected);
                }

                let closed_by_us = loop {
                    tokio::select! {
                        _ = &mut shutdown => {
                            // Frames already handed over (presence leave) go out first.
                            while let Ok(msg) = out_rx.try_recv() {
                                if sink.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            let _ = sink.send(Message::Close(None)).await;
                            break true;
                        }
                        outgoing = out_rx.recv() => match outgoing {
                            Some(msg) => {
                                if let Err(e) = sink.send(msg).await {
                                    log::warn!("WebSocket send failed: {e}");
                                    break false;
                                }
                            }
                            None => break false,
                        },
                        incoming = stream.next() => match incoming {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                deliver(&state, &bytes);
                            }
                            Some(Ok(Message::Close(_))) | None => break false,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::warn!("WebSocket receive failed: {e}");
                                break false;
                            }
                        },
                    }
                };

                let mut st = lock(&state);
                st.writer = None;
                if closed_by_us {
                    return;
                }
                log::warn!("Lost connection to {url}");
                st.link.set_status(ConnectionStatus::Connecting);
            }
            Err(e) => {
                log::warn!("Connection to {url} failed: {e}");
                lock(&state).link.set_status(ConnectionStatus::Error);
            }
        }

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            log::error!("Giving up on {url} after {attempt} attempts");
            lock(&state).link.set_status(ConnectionStatus::Error);
            return;
        }
        let delay = policy.delay(attempt);
        attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => return,
        }
    }
}

fn deliver(state: &Mutex<WsState>, bytes: &[u8]) {
    let frame = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Dropping malformed frame: {e}");
            return;
        }
    };
    let event = match frame.channel {
        Channel::Document => TransportEvent::Update(frame.payload),
        Channel::Ephemeral => TransportEvent::Ephemeral(frame.payload),
        Channel::Resync => TransportEvent::Resync,
    };
    lock(state).link.emit(event);
}
