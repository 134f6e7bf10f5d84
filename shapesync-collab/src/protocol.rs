//! Binary sync protocol.
//!
//! Two layers, both bincode-encoded (standard config):
//!
//! ```text
//! Frame        ┌──────────┬─────────────────────────────┐
//! (transport)  │ channel  │ payload                     │
//!              │ 1 byte   │ varint len + bytes          │
//!              └──────────┴─────────────────────────────┘
//!
//! SyncMessage  ┌──────────┬───────────┬─────────────────┐
//! (document)   │ msg_type │ sender    │ payload         │
//!              │ 1 byte   │ replica   │ delta / sv      │
//!              └──────────┴───────────┴─────────────────┘
//! ```
//!
//! `Frame` is what travels over a WebSocket: it separates durable document
//! traffic from lossy presence traffic. `SyncMessage` is the document-channel
//! envelope; its payload is an opaque delta or state vector from
//! `shapesync-core`.
//!
//! Handshake, run by every replica each time its transport reports
//! `Connected`:
//!
//! ```text
//!   A ── Hello(sv_A) ──────────▶ B
//!   A ── Update(full_A) ───────▶ B      B merges A's whole state
//!   A ◀────── Diff(delta_since(sv_A)) ── B
//! ```

use serde::{Deserialize, Serialize};
use shapesync_core::{ReplicaId, StateVector};
use thiserror::Error;

/// Message types on the document channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; peers answer with a `Diff`
    Hello = 1,
    /// Answer to a `Hello`: everything the asker is missing
    Diff = 2,
    /// Local edit or full-state push
    Update = 3,
}

/// Document-channel envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub sender: ReplicaId,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Announce our state vector.
    pub fn hello(sender: ReplicaId, state_vector: &StateVector) -> Result<Self, ProtocolError> {
        let payload = state_vector
            .encode()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Hello,
            sender,
            payload,
        })
    }

    pub fn diff(sender: ReplicaId, delta: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Diff,
            sender,
            payload: delta,
        }
    }

    pub fn update(sender: ReplicaId, delta: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            sender,
            payload: delta,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the state vector carried by a `Hello`.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        if self.msg_type != MessageType::Hello {
            return Err(ProtocolError::InvalidMessageType);
        }
        StateVector::decode(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Logical channel of a transport frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    /// Durable document traffic (`SyncMessage`)
    Document = 1,
    /// Lossy presence traffic
    Ephemeral = 2,
    /// Relay notice: this connection lost frames and must resync
    Resync = 3,
}

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn document(payload: Vec<u8>) -> Self {
        Self {
            channel: Channel::Document,
            payload,
        }
    }

    pub fn ephemeral(payload: Vec<u8>) -> Self {
        Self {
            channel: Channel::Ephemeral,
            payload,
        }
    }

    pub fn resync() -> Self {
        Self {
            channel: Channel::Resync,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors. A frame that fails to decode is dropped with a warning.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shapesync_core::{FieldKey, ShapeId, ShapeStore};

    #[test]
    fn test_update_roundtrip() {
        let payload = vec![1, 2, 3, 4, 5];
        let msg = SyncMessage::update(ReplicaId::new("alice"), payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.sender.as_str(), "alice");
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_hello_carries_state_vector() {
        let mut store = ShapeStore::new("alice");
        store
            .apply_local_write(ShapeId::new(), [(FieldKey::geometry("x"), 1.0.into())]);

        let msg = SyncMessage::hello(store.replica().clone(), store.state_vector()).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Hello);
        assert_eq!(&decoded.state_vector().unwrap(), store.state_vector());
    }

    #[test]
    fn test_state_vector_requires_hello() {
        let msg = SyncMessage::diff(ReplicaId::new("b"), vec![1]);
        assert_eq!(msg.state_vector(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_frame_channels() {
        let doc = Frame::document(vec![7; 3]);
        let eph = Frame::ephemeral(vec![9]);
        assert_eq!(Frame::decode(&doc.encode().unwrap()).unwrap(), doc);
        assert_eq!(Frame::decode(&eph.encode().unwrap()).unwrap(), eph);
        assert_eq!(
            Frame::decode(&Frame::resync().encode().unwrap()).unwrap().channel,
            Channel::Resync
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
        assert!(Frame::decode(&[0x09]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Hello as u8, 1);
        assert_eq!(MessageType::Diff as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
    }

    #[test]
    fn test_envelope_overhead_small() {
        let msg = SyncMessage::update(ReplicaId::new("replica-1"), vec![0u8; 50]);
        let encoded = Frame::document(msg.encode().unwrap()).encode().unwrap();
        assert!(encoded.len() < 80, "Encoded size {} too large", encoded.len());
    }
}
