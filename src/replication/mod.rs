//! Replication Module
//!
//! Propagates authoritative snapshots from the authoring process to mirrors
//! on every render node.

pub mod protocol;
mod object;
mod directory;

pub use protocol::{FrameHeader, Message, SessionInfo};
pub use object::{decode, encode, Authoritative, Mirror, Record, ReplicaState};
pub use directory::ReplicationDirectory;
