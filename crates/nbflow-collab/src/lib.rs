use nbflow_core::collab_wire::{CollabEnvelope, CollabMsg};
use nbflow_core::frame::FrameError;
use nbflow_core::CellId;
use std::fmt;
use thiserror::Error;

mod client;

pub use client::{connect, CollabEvents, CollabHandle};

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported relay url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("send queue is full")]
    QueueFull,
    #[error("collaboration client stopped")]
    Stopped,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer's cursor, kept only in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub client_id: String,
    pub cell_id: CellId,
    pub cursor_pos: usize,
    pub selection_end: usize,
}

#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Our own broadcast coming back from the relay.
    Echo,
    Malformed(FrameError),
    Edit(CollabMsg),
    Presence(PresenceUpdate),
}

pub fn classify_inbound(own_client_id: &str, raw: &str, max_bytes: usize) -> Inbound {
    let envelope = match CollabEnvelope::decode(raw, max_bytes) {
        Ok(envelope) => envelope,
        Err(err) => return Inbound::Malformed(err),
    };
    if envelope.client_id == own_client_id {
        return Inbound::Echo;
    }
    match envelope.msg {
        CollabMsg::CursorUpdate {
            cell_id,
            cursor_pos,
            selection_end,
        } => Inbound::Presence(PresenceUpdate {
            client_id: envelope.client_id,
            cell_id,
            cursor_pos,
            selection_end,
        }),
        msg => Inbound::Edit(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbflow_core::frame::DEFAULT_MAX_FRAME_BYTES;

    fn update(client_id: &str, cell_id: CellId) -> String {
        CollabEnvelope::new(
            client_id,
            CollabMsg::CellUpdate {
                cell_id,
                content: "x = 3".to_string(),
            },
        )
        .encode(DEFAULT_MAX_FRAME_BYTES)
        .expect("encode")
    }

    #[test]
    fn own_messages_are_suppressed_and_peer_messages_applied() {
        let cell_id = CellId::generate();
        let raw = update("c1", cell_id);
        assert_eq!(classify_inbound("c1", &raw, DEFAULT_MAX_FRAME_BYTES), Inbound::Echo);

        match classify_inbound("c2", &raw, DEFAULT_MAX_FRAME_BYTES) {
            Inbound::Edit(CollabMsg::CellUpdate { cell_id: id, content }) => {
                assert_eq!(id, cell_id);
                assert_eq!(content, "x = 3");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn cursor_updates_route_to_presence() {
        let cell_id = CellId::generate();
        let raw = CollabEnvelope::new(
            "peer",
            CollabMsg::CursorUpdate {
                cell_id,
                cursor_pos: 3,
                selection_end: 7,
            },
        )
        .encode(DEFAULT_MAX_FRAME_BYTES)
        .expect("encode");
        assert_eq!(
            classify_inbound("me", &raw, DEFAULT_MAX_FRAME_BYTES),
            Inbound::Presence(PresenceUpdate {
                client_id: "peer".to_string(),
                cell_id,
                cursor_pos: 3,
                selection_end: 7,
            })
        );
    }

    #[test]
    fn malformed_and_oversized_payloads_are_flagged() {
        assert!(matches!(
            classify_inbound("me", "{\"type\":", DEFAULT_MAX_FRAME_BYTES),
            Inbound::Malformed(FrameError::Decode(_))
        ));
        let raw = update("peer", CellId::generate());
        assert!(matches!(
            classify_inbound("me", &raw, 16),
            Inbound::Malformed(FrameError::OversizedFrame { .. })
        ));
    }
}
