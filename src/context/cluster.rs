//! Cluster execution context: the state comes from the frame-state mirror
//! and maintenance ownership is elected among the node's render threads.

use std::cell::RefCell;

use super::ExecutionContext;
use crate::error::{Error, Result};
use crate::frame::FrameToken;
use crate::id::Version;
use crate::state::{Election, MaintenanceElection, MaintenanceLease, ResourceScope};

/// Context for one GPU context of a render node during one frame
pub struct ClusterContext<'a, S, N, C> {
    token: FrameToken,
    state: &'a S,
    election: &'a MaintenanceElection,
    node_scope: ResourceScope,
    context_scope: ResourceScope,
    node: &'a N,
    context: &'a C,
    /// Leases won by this context; only their holder may finish the task
    node_lease: RefCell<Option<MaintenanceLease>>,
    context_lease: RefCell<Option<MaintenanceLease>>,
}

impl<'a, S, N, C> ClusterContext<'a, S, N, C> {
    pub fn new(
        node_id: &str,
        context_index: u32,
        token: FrameToken,
        state: &'a S,
        election: &'a MaintenanceElection,
        node: &'a N,
        context: &'a C,
    ) -> Self {
        Self {
            token,
            state,
            election,
            node_scope: ResourceScope::node(node_id),
            context_scope: ResourceScope::context(node_id, context_index),
            node,
            context,
            node_lease: RefCell::new(None),
            context_lease: RefCell::new(None),
        }
    }

    pub fn context_index(&self) -> u32 {
        match self.context_scope {
            ResourceScope::Context { context, .. } => context,
            ResourceScope::Node(_) => 0,
        }
    }

    fn claim(&self, scope: &ResourceScope, held: &RefCell<Option<MaintenanceLease>>) -> bool {
        match self.election.elect(scope) {
            Election::Owner(lease) => {
                *held.borrow_mut() = Some(lease);
                true
            }
            Election::Follower => false,
        }
    }
}

fn finish(scope: &ResourceScope, held: &RefCell<Option<MaintenanceLease>>) -> Result<()> {
    match held.borrow_mut().take() {
        Some(lease) => lease.finish(),
        None => Err(Error::NotOwner(scope.to_string())),
    }
}

impl<'a, S, N, C> ExecutionContext for ClusterContext<'a, S, N, C> {
    type State = S;
    type NodeResources = N;
    type ContextResources = C;

    fn frame(&self) -> u64 {
        self.token.frame
    }

    fn version(&self) -> Version {
        self.token.version
    }

    fn current_state(&self) -> &S {
        self.state
    }

    fn try_become_node_maintenance_owner(&self) -> bool {
        self.claim(&self.node_scope, &self.node_lease)
    }

    fn mark_node_maintenance_finished(&self) -> Result<()> {
        finish(&self.node_scope, &self.node_lease)
    }

    fn wait_node_maintenance_finished(&self) -> Result<()> {
        self.election.wait_until_finished(&self.node_scope).map(|_| ())
    }

    fn try_become_context_maintenance_owner(&self) -> bool {
        self.claim(&self.context_scope, &self.context_lease)
    }

    fn mark_context_maintenance_finished(&self) -> Result<()> {
        finish(&self.context_scope, &self.context_lease)
    }

    fn wait_context_maintenance_finished(&self) -> Result<()> {
        self.election.wait_until_finished(&self.context_scope).map(|_| ())
    }

    fn node_resources(&self) -> &N {
        self.node
    }

    fn context_resources(&self) -> &C {
        self.context
    }
}
