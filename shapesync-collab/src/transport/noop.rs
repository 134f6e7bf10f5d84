//! Transport for single-user sessions: connects instantly, sends nowhere.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{lock, ConnectionStatus, EventSender, Link, Transport, TransportError};

pub struct NoopTransport {
    link: Mutex<Link>,
}

impl NoopTransport {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(Link::new()),
        }
    }
}

impl Default for NoopTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for NoopTransport {
    async fn connect(&self, room_id: &str, events: EventSender) -> Result<(), TransportError> {
        log::debug!("Noop transport joined {room_id}");
        let mut link = lock(&self.link);
        link.attach(events);
        link.set_status(ConnectionStatus::Connecting);
        link.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        lock(&self.link).detach();
        Ok(())
    }

    fn send_update(&self, bytes: Vec<u8>) {
        log::trace!("Noop transport discarded {} update bytes", bytes.len());
    }

    fn send_ephemeral(&self, _bytes: Vec<u8>) {}

    fn status(&self) -> ConnectionStatus {
        lock(&self.link).status()
    }
}
