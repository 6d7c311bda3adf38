use crate::frame::{decode_frame, encode_json, FrameError};
use crate::{CellId, CellKind};
use serde::{Deserialize, Serialize};

/// One collaboration message as it travels through a relay room.
///
/// `client_id` is stamped by the sending client and only used to discard
/// echoes of its own broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollabEnvelope {
    pub client_id: String,
    #[serde(flatten)]
    pub msg: CollabMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollabMsg {
    AddCell {
        cell_id: CellId,
        cell_type: CellKind,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    CellUpdate {
        cell_id: CellId,
        content: String,
    },
    DeleteCell {
        cell_id: CellId,
    },
    CursorUpdate {
        cell_id: CellId,
        cursor_pos: usize,
        selection_end: usize,
    },
}

impl CollabMsg {
    pub fn cell_id(&self) -> CellId {
        match self {
            CollabMsg::AddCell { cell_id, .. }
            | CollabMsg::CellUpdate { cell_id, .. }
            | CollabMsg::DeleteCell { cell_id }
            | CollabMsg::CursorUpdate { cell_id, .. } => *cell_id,
        }
    }

    pub fn is_presence(&self) -> bool {
        matches!(self, CollabMsg::CursorUpdate { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CollabMsg::AddCell { .. } => "add_cell",
            CollabMsg::CellUpdate { .. } => "cell_update",
            CollabMsg::DeleteCell { .. } => "delete_cell",
            CollabMsg::CursorUpdate { .. } => "cursor_update",
        }
    }
}

impl CollabEnvelope {
    pub fn new(client_id: impl Into<String>, msg: CollabMsg) -> Self {
        Self {
            client_id: client_id.into(),
            msg,
        }
    }

    pub fn encode(&self, max_bytes: usize) -> Result<String, FrameError> {
        let bytes = encode_json(self, max_bytes)?;
        String::from_utf8(bytes).map_err(|err| FrameError::Encode(err.to_string()))
    }

    pub fn decode(raw: &str, max_bytes: usize) -> Result<Self, FrameError> {
        decode_frame(raw.as_bytes(), max_bytes)
    }
}
