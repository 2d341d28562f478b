//! Lockstep - Frame-Locked State Replication for Clustered Renderers
//!
//! Keeps every process of a clustered real-time renderer on the same frame
//! and the same scene state, and stops the threads sharing a node from
//! repeating the same per-frame upkeep.
//!
//! # Architecture
//!
//! One authoring process owns the authoritative state. Every frame it
//! commits that state under a new version, broadcasts a frame token, and
//! waits until every render node has synchronized its mirror to that version
//! and rendered the frame. Within a render node, the threads driving its GPU
//! contexts elect one owner per shared resource to run maintenance while
//! the rest wait.
//!
//! # Features
//!
//! - Versioned authoritative objects and last-writer-wins mirrors
//! - Frame barrier tolerant of participants dropping out
//! - Lock-free per-frame maintenance election with optional liveness bound
//! - The same render code standalone or clustered
//! - In-process and TCP transports

pub mod config;
pub mod error;
pub mod id;
pub mod network;
pub mod replication;
pub mod frame;
pub mod state;
pub mod context;
pub mod runtime;
pub mod scene;

pub use config::LockstepConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LockstepConfig, NodeRole};
    pub use crate::context::{ClusterContext, ExecutionContext, StandaloneContext};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{FrameData, FrameToken};
    pub use crate::id::{ObjectId, Version};
    pub use crate::network::{LocalHub, Transport};
    pub use crate::replication::{Authoritative, Mirror, ReplicationDirectory};
    pub use crate::runtime::{AuthoringNode, JoinOptions, RenderNode, StandaloneNode};
    pub use crate::state::{MaintenanceElection, ResourceScope};
}
