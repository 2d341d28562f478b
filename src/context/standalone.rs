//! Standalone execution context: one process, no replication, always the
//! sole maintenance owner.

use std::cell::Cell;

use super::ExecutionContext;
use crate::error::{Error, Result};
use crate::id::Version;

/// Context for a process that is its own cluster
pub struct StandaloneContext<'a, S, N, C> {
    frame: u64,
    state: &'a S,
    node: &'a N,
    context: &'a C,
    node_claimed: Cell<bool>,
    context_claimed: Cell<bool>,
}

impl<'a, S, N, C> StandaloneContext<'a, S, N, C> {
    pub fn new(frame: u64, state: &'a S, node: &'a N, context: &'a C) -> Self {
        Self {
            frame,
            state,
            node,
            context,
            node_claimed: Cell::new(false),
            context_claimed: Cell::new(false),
        }
    }
}

fn finish(claimed: &Cell<bool>, scope: &str) -> Result<()> {
    if claimed.replace(false) {
        Ok(())
    } else {
        Err(Error::NotOwner(scope.to_string()))
    }
}

impl<'a, S, N, C> ExecutionContext for StandaloneContext<'a, S, N, C> {
    type State = S;
    type NodeResources = N;
    type ContextResources = C;

    fn frame(&self) -> u64 {
        self.frame
    }

    // Nothing is replicated, so the frame number doubles as the version
    fn version(&self) -> Version {
        Version(self.frame)
    }

    fn current_state(&self) -> &S {
        self.state
    }

    fn try_become_node_maintenance_owner(&self) -> bool {
        self.node_claimed.set(true);
        true
    }

    fn mark_node_maintenance_finished(&self) -> Result<()> {
        finish(&self.node_claimed, "node:standalone")
    }

    fn wait_node_maintenance_finished(&self) -> Result<()> {
        Ok(())
    }

    fn try_become_context_maintenance_owner(&self) -> bool {
        self.context_claimed.set(true);
        true
    }

    fn mark_context_maintenance_finished(&self) -> Result<()> {
        finish(&self.context_claimed, "context:standalone/0")
    }

    fn wait_context_maintenance_finished(&self) -> Result<()> {
        Ok(())
    }

    fn node_resources(&self) -> &N {
        self.node
    }

    fn context_resources(&self) -> &C {
        self.context
    }
}
