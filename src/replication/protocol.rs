//! Replication Protocol
//!
//! Defines the wire protocol between the authoring process and render nodes.

use serde::{Deserialize, Serialize};

use crate::frame::FrameToken;
use crate::id::{ObjectId, Version};

/// Identifiers a render node needs to map the session's shared objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Object holding the one-shot initialization data
    pub init_id: ObjectId,
    /// Object holding the per-frame state
    pub frame_state_id: ObjectId,
    /// Number of the next frame the authoring process will broadcast
    pub next_frame: u64,
}

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Session ==========
    /// Render node introduces itself (first message on a connection)
    Hello {
        node_id: String,
        contexts: u32,
    },

    /// Authoring answer to `Hello`
    Welcome {
        authoring_id: String,
        session: SessionInfo,
    },

    /// Render node leaves the session voluntarily
    Goodbye {
        node_id: String,
    },

    // ========== Object Replication ==========
    /// A new authoritative object became visible
    Publish {
        id: ObjectId,
        version: Version,
        payload: Vec<u8>,
    },

    /// A new snapshot of a published object was committed
    Update {
        id: ObjectId,
        version: Version,
        payload: Vec<u8>,
    },

    /// The authoritative object was withdrawn
    Unpublish {
        id: ObjectId,
    },

    // ========== Frame Barrier ==========
    /// Render this frame at this state version
    FrameToken {
        token: FrameToken,
    },

    /// Render node finished a frame
    FrameAck {
        node_id: String,
        frame: u64,
    },

    /// Authoring process ends the session; no further tokens follow
    Shutdown {
        reason: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::Welcome { .. } => "Welcome",
            Message::Goodbye { .. } => "Goodbye",
            Message::Publish { .. } => "Publish",
            Message::Update { .. } => "Update",
            Message::Unpublish { .. } => "Unpublish",
            Message::FrameToken { .. } => "FrameToken",
            Message::FrameAck { .. } => "FrameAck",
            Message::Shutdown { .. } => "Shutdown",
        }
    }

    /// Whether the replication directory consumes this message
    pub fn is_replication(&self) -> bool {
        matches!(
            self,
            Message::Publish { .. } | Message::Update { .. } | Message::Unpublish { .. }
        )
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Upper bound for a single message body
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
