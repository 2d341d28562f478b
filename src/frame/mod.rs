//! Frame Module
//!
//! Lock-step frame advancement. The authoring process runs a
//! [`FrameSequencer`] that commits state, broadcasts a [`FrameToken`] and
//! waits on the barrier; every render node runs a [`FrameParticipant`] that
//! receives the token, synchronizes its mirror and acknowledges.

mod sequencer;
mod participant;

pub use sequencer::{BarrierEvent, BarrierReport, FrameSequencer};
pub use participant::{FrameParticipant, FrameSignal};

use serde::{Deserialize, Serialize};

use crate::id::Version;

/// Frame number plus the state version to render in that frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameToken {
    pub frame: u64,
    pub version: Version,
}

impl FrameToken {
    pub fn new(frame: u64, version: Version) -> Self {
        Self { frame, version }
    }
}

impl std::fmt::Display for FrameToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame {} @ {}", self.frame, self.version)
    }
}

/// Where the sequencer is within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FramePhase {
    /// Between frames; state may be mutated
    Idle,
    /// Snapshotting the frame state
    Committing,
    /// Sending the token
    Broadcasting,
    /// Waiting for participants to acknowledge
    AwaitingAck,
    /// Barrier released, moving to the next frame
    Advancing,
}

impl std::fmt::Display for FramePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramePhase::Idle => write!(f, "IDLE"),
            FramePhase::Committing => write!(f, "COMMITTING"),
            FramePhase::Broadcasting => write!(f, "BROADCASTING"),
            FramePhase::AwaitingAck => write!(f, "AWAITING_ACK"),
            FramePhase::Advancing => write!(f, "ADVANCING"),
        }
    }
}

/// Per-frame state driven by the sequencer
pub trait FrameData {
    /// Whether the authoring side asked to stop after this frame
    fn quit_requested(&self) -> bool {
        false
    }
}
