//! Runtime Module
//!
//! Wires replication, the frame barrier and the maintenance election into
//! the three kinds of process: authoring, render and standalone.

pub mod pump;
mod authoring;
mod render;
mod standalone;

pub use authoring::AuthoringNode;
pub use render::{mirror_with_retry, JoinOptions, RenderNode};
pub use standalone::StandaloneNode;
