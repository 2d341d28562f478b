//! Execution Context
//!
//! What rendering code sees of the topology it runs in. A frame's render
//! logic is written against [`ExecutionContext`] and works unchanged in a
//! single standalone process and on a cluster render node: it asks for the
//! current state, and asks whether it owns this frame's upkeep of the node
//! or of its GPU context.

mod standalone;
mod cluster;

pub use standalone::StandaloneContext;
pub use cluster::ClusterContext;

use crate::error::Result;
use crate::id::Version;

/// Capabilities available to rendering code for one frame
pub trait ExecutionContext {
    /// Replicated per-frame state
    type State;
    /// Resources shared by every context of the node
    type NodeResources;
    /// Resources private to one GPU context
    type ContextResources;

    /// Frame being rendered
    fn frame(&self) -> u64;

    /// Version of the state being rendered
    fn version(&self) -> Version;

    /// State to render this frame
    fn current_state(&self) -> &Self::State;

    fn try_become_node_maintenance_owner(&self) -> bool;
    fn mark_node_maintenance_finished(&self) -> Result<()>;
    fn wait_node_maintenance_finished(&self) -> Result<()>;

    fn try_become_context_maintenance_owner(&self) -> bool;
    fn mark_context_maintenance_finished(&self) -> Result<()>;
    fn wait_context_maintenance_finished(&self) -> Result<()>;

    fn node_resources(&self) -> &Self::NodeResources;
    fn context_resources(&self) -> &Self::ContextResources;

    /// Run node upkeep if this caller wins the node's election, else wait
    /// for the winner. Returns the task output for the winner only.
    fn run_node_maintenance<R>(
        &self,
        task: impl FnOnce(&Self::NodeResources) -> R,
    ) -> Result<Option<R>> {
        if self.try_become_node_maintenance_owner() {
            let output = task(self.node_resources());
            self.mark_node_maintenance_finished()?;
            Ok(Some(output))
        } else {
            self.wait_node_maintenance_finished()?;
            Ok(None)
        }
    }

    /// Context-scoped counterpart of [`run_node_maintenance`](Self::run_node_maintenance)
    fn run_context_maintenance<R>(
        &self,
        task: impl FnOnce(&Self::ContextResources) -> R,
    ) -> Result<Option<R>> {
        if self.try_become_context_maintenance_owner() {
            let output = task(self.context_resources());
            self.mark_context_maintenance_finished()?;
            Ok(Some(output))
        } else {
            self.wait_context_maintenance_finished()?;
            Ok(None)
        }
    }
}
