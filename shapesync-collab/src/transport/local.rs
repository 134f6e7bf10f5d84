//! In-process transport over tokio broadcast channels.
//!
//! A [`LocalHub`] maps room ids to broadcast groups. Every
//! [`LocalTransport`] handed out by the hub is one endpoint; a frame published
//! by an endpoint fans out to every other endpoint in the same room.
//!
//! Receivers buffer up to `capacity` frames. A receiver that falls further
//! behind loses frames; its transport reports [`TransportEvent::Resync`] so
//! the owner can pull full state again.
//!
//! [`LocalTransport::sever`] and [`LocalTransport::readmit`] simulate a
//! network partition: the endpoint leaves the room (status `Connecting`),
//! queues outbound updates and later rejoins exactly like a reconnecting
//! WebSocket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::{
    lock, ConnectionStatus, EventSender, Link, OutboundQueue, Transport, TransportError,
    TransportEvent,
};
use crate::protocol::Channel;

#[derive(Debug, Clone)]
struct HubFrame {
    from: u64,
    channel: Channel,
    payload: Arc<Vec<u8>>,
}

/// Statistics for one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

struct LocalRoom {
    sender: broadcast::Sender<HubFrame>,
    messages_sent: AtomicU64,
    members: AtomicUsize,
}

impl LocalRoom {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            messages_sent: AtomicU64::new(0),
            members: AtomicUsize::new(0),
        }
    }

    /// Returns the number of receivers (the sender's own included).
    fn publish(&self, frame: HubFrame) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).unwrap_or(0)
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.members.load(Ordering::Relaxed),
        }
    }
}

struct HubInner {
    rooms: Mutex<HashMap<String, Arc<LocalRoom>>>,
    capacity: usize,
    next_endpoint: AtomicU64,
}

/// Room registry for in-process replicas. Cheap to clone.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    /// `capacity` frames are buffered per endpoint before it lags.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                next_endpoint: AtomicU64::new(1),
            }),
        }
    }

    /// A new, unconnected endpoint on this hub.
    pub fn transport(&self) -> LocalTransport {
        self.transport_with_queue(super::DEFAULT_OUTBOUND_CAPACITY)
    }

    /// A new endpoint with a custom outbound queue capacity.
    pub fn transport_with_queue(&self, queue_capacity: usize) -> LocalTransport {
        let endpoint = self.inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        LocalTransport {
            hub: self.clone(),
            endpoint,
            state: Mutex::new(LocalState {
                link: Link::new(),
                online: true,
                room_id: None,
                room: None,
                outbound: OutboundQueue::new(queue_capacity),
                forwarder: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn room_count(&self) -> usize {
        lock(&self.inner.rooms).len()
    }

    pub fn stats(&self, room_id: &str) -> Option<RoomStats> {
        lock(&self.inner.rooms).get(room_id).map(|room| room.stats())
    }

    fn room(&self, room_id: &str) -> Arc<LocalRoom> {
        let mut rooms = lock(&self.inner.rooms);
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                log::debug!("Created local room {room_id}");
                Arc::new(LocalRoom::new(self.inner.capacity))
            })
            .clone()
    }

    fn remove_if_empty(&self, room_id: &str) {
        let mut rooms = lock(&self.inner.rooms);
        if let Some(room) = rooms.get(room_id) {
            if room.members.load(Ordering::Relaxed) == 0 {
                rooms.remove(room_id);
                log::debug!("Removed empty local room {room_id}");
            }
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

struct LocalState {
    link: Link,
    /// Simulated network reachability
    online: bool,
    room_id: Option<String>,
    room: Option<Arc<LocalRoom>>,
    outbound: OutboundQueue,
    forwarder: Option<JoinHandle<()>>,
}

/// One endpoint of a [`LocalHub`].
pub struct LocalTransport {
    hub: LocalHub,
    endpoint: u64,
    state: Mutex<LocalState>,
}

impl LocalTransport {
    /// Simulate losing the network: leave the room, keep the session.
    pub fn sever(&self) {
        let mut state = lock(&self.state);
        if !state.online {
            return;
        }
        state.online = false;
        if state.room.is_some() {
            log::info!("Endpoint {} severed", self.endpoint);
            self.leave(&mut state);
            state.link.set_status(ConnectionStatus::Connecting);
        }
    }

    /// Restore the network: rejoin the room and flush queued updates.
    pub fn readmit(&self) {
        let mut state = lock(&self.state);
        if state.online {
            return;
        }
        state.online = true;
        if state.room.is_some() {
            log::info!("Endpoint {} readmitted", self.endpoint);
            self.join(&mut state);
        }
    }

    pub fn is_online(&self) -> bool {
        lock(&self.state).online
    }

    /// Updates waiting for a connection.
    pub fn queued(&self) -> usize {
        lock(&self.state).outbound.len()
    }

    /// Updates evicted from a full outbound queue.
    pub fn dropped(&self) -> u64 {
        lock(&self.state).outbound.dropped()
    }

    fn join(&self, state: &mut LocalState) {
        let (Some(room), Some(events)) = (state.room.clone(), state.link.events()) else {
            return;
        };
        let rx = room.sender.subscribe();
        room.members.fetch_add(1, Ordering::Relaxed);
        state.forwarder = Some(tokio::spawn(forward(rx, self.endpoint, events)));
        state.link.set_status(ConnectionStatus::Connected);

        let queued = state.outbound.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued updates", queued.len());
        }
        for payload in queued {
            room.publish(HubFrame {
                from: self.endpoint,
                channel: Channel::Document,
                payload: Arc::new(payload),
            });
        }
    }

    fn leave(&self, state: &mut LocalState) {
        if let Some(forwarder) = state.forwarder.take() {
            forwarder.abort();
            if let Some(room) = &state.room {
                room.members.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Publish if joined; hands the payload back otherwise.
    fn publish(
        &self,
        state: &LocalState,
        channel: Channel,
        payload: Vec<u8>,
    ) -> Result<(), Vec<u8>> {
        match &state.room {
            Some(room) if state.forwarder.is_some() => {
                room.publish(HubFrame {
                    from: self.endpoint,
                    channel,
                    payload: Arc::new(payload),
                });
                Ok(())
            }
            _ => Err(payload),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, room_id: &str, events: EventSender) -> Result<(), TransportError> {
        let room = self.hub.room(room_id);
        let mut state = lock(&self.state);
        self.leave(&mut state);
        state.link.attach(events);
        state.room = Some(room);
        state.room_id = Some(room_id.to_string());
        state.link.set_status(ConnectionStatus::Connecting);
        if state.online {
            self.join(&mut state);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let room_id = {
            let mut state = lock(&self.state);
            self.leave(&mut state);
            state.outbound.clear();
            state.room = None;
            state.link.detach();
            state.room_id.take()
        };
        if let Some(room_id) = room_id {
            self.hub.remove_if_empty(&room_id);
        }
        Ok(())
    }

    fn send_update(&self, bytes: Vec<u8>) {
        let mut state = lock(&self.state);
        if let Err(bytes) = self.publish(&state, Channel::Document, bytes) {
            if state.outbound.push(bytes).is_some() {
                log::warn!("Outbound queue full, dropped oldest update");
            }
        }
    }

    fn send_ephemeral(&self, bytes: Vec<u8>) {
        let state = lock(&self.state);
        if self.publish(&state, Channel::Ephemeral, bytes).is_err() {
            log::trace!("Dropped ephemeral frame while offline");
        }
    }

    fn status(&self) -> ConnectionStatus {
        lock(&self.state).link.status()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if let Some(forwarder) = &state.forwarder {
            forwarder.abort();
            if let Some(room) = &state.room {
                room.members.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

async fn forward(mut rx: broadcast::Receiver<HubFrame>, endpoint: u64, events: EventSender) {
    loop {
        let event = match rx.recv().await {
            Ok(frame) if frame.from == endpoint => continue,
            Ok(frame) => match frame.channel {
                Channel::Document => TransportEvent::Update(frame.payload.to_vec()),
                Channel::Ephemeral => TransportEvent::Ephemeral(frame.payload.to_vec()),
                Channel::Resync => TransportEvent::Resync,
            },
            Err(RecvError::Lagged(missed)) => {
                log::warn!("Endpoint {endpoint} lagged, {missed} frames lost");
                TransportEvent::Resync
            }
            Err(RecvError::Closed) => break,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}
