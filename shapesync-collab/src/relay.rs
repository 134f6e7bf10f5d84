//! Stateless WebSocket relay with room-based routing.
//!
//! ```text
//! Client A ──┐                                   ┌──▶ Client B
//!             ├── ws://host/{room} ── RelayRoom ──┤
//! Client C ──┘      (broadcast)                  └──▶ Client C
//! ```
//!
//! The relay never decodes document traffic and keeps no document state:
//! a binary message from one connection is fanned out unchanged to every
//! other connection in the same room. Replicas stay the only source of truth;
//! a connection that falls behind the room's broadcast buffer receives a
//! `Resync` frame and pulls state from its peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Frame;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast buffer per room (frames)
    pub room_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            room_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_connections: u64,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

type RoomFrame = (u64, Arc<Vec<u8>>);

struct RelayRoom {
    sender: broadcast::Sender<RoomFrame>,
    peers: usize,
}

struct Shared {
    config: RelayConfig,
    rooms: RwLock<HashMap<String, RelayRoom>>,
    stats: RwLock<RelayStats>,
    next_connection: AtomicU64,
}

pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(RelayStats::default()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), RelayError> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let room_id = match path.trim_matches('/') {
        "" => "default".to_string(),
        id => id.to_string(),
    };
    let connection = shared.next_connection.fetch_add(1, Ordering::Relaxed);

    let joined = {
        let mut rooms = shared.rooms.write().await;
        let capacity = shared.config.room_capacity.max(1);
        let room = rooms.entry(room_id.clone()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(capacity);
            RelayRoom { sender, peers: 0 }
        });
        if room.peers >= shared.config.max_peers_per_room {
            None
        } else {
            room.peers += 1;
            Some((room.sender.clone(), room.sender.subscribe(), rooms.len()))
        }
    };

    let Some((room_tx, mut room_rx, room_count)) = joined else {
        log::warn!("Room {room_id} full, rejecting {addr}");
        shared.stats.write().await.rejected_connections += 1;
        ws_sender.send(Message::Close(None)).await?;
        return Ok(());
    };

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
        s.active_rooms = room_count;
    }
    log::info!("Connection {connection} from {addr} joined room {room_id}");

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    {
                        let mut s = shared.stats.write().await;
                        s.total_frames += 1;
                        s.total_bytes += bytes.len() as u64;
                    }
                    let _ = room_tx.send((connection, Arc::new(bytes)));
                }
                Some(Ok(Message::Ping(data))) => {
                    ws_sender.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection {connection} closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            },

            frame = room_rx.recv() => match frame {
                Ok((from, _)) if from == connection => {}
                Ok((_, data)) => {
                    ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Connection {connection} lagged by {n} frames, requesting resync");
                    match Frame::resync().encode() {
                        Ok(bytes) => ws_sender.send(Message::Binary(bytes.into())).await?,
                        Err(e) => log::warn!("Failed to encode resync frame: {e}"),
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let mut rooms = shared.rooms.write().await;
    if let Some(room) = rooms.get_mut(&room_id) {
        room.peers = room.peers.saturating_sub(1);
        if room.peers == 0 {
            rooms.remove(&room_id);
            log::info!("Room {room_id} removed (empty)");
        }
    }
    let mut s = shared.stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_rooms = rooms.len();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.room_capacity, 256);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = RelayServer::with_defaults();
        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_frames, 0);
        assert_eq!(relay.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_relay_fans_out_within_room() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Arc::new(RelayServer::with_defaults());
        let server = relay.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let url = format!("ws://{addr}/room-1");
        let (mut a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut other, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/room-2").as_str())
                .await
                .unwrap();

        // Wait until both room-1 connections are registered.
        for _ in 0..100 {
            if relay.stats().await.active_connections == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        a.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), b.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received, Message::Binary(vec![1, 2, 3].into()));

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(100), other.next()).await;
        assert!(nothing.is_err());
        assert_eq!(relay.room_count().await, 2);
    }
}
