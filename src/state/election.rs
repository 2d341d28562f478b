//! Maintenance Election
//!
//! Lets several execution units sharing a resource agree, once per frame,
//! on which of them runs the resource's upkeep task. The winner runs it and
//! reports completion; everybody else spins until then instead of running it
//! again.
//!
//! An owner that never reports completion leaves the others spinning. With
//! `owner_timeout` configured the wait ends in `OwnerLivenessTimeout`; no
//! recovery is attempted beyond surfacing the error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use super::slot::{OwnershipSlot, ResourceScope, SlotStatus};
use crate::config::MaintenanceConfig;
use crate::error::Result;

/// Outcome of an election for one scope
#[derive(Debug)]
pub enum Election {
    /// Caller owns the task and must finish the lease
    Owner(MaintenanceLease),
    /// Someone else owns it
    Follower,
}

/// Proof of ownership for one scope and epoch
#[derive(Debug)]
pub struct MaintenanceLease {
    slot: Arc<OwnershipSlot>,
    epoch: u64,
    finished: bool,
}

impl MaintenanceLease {
    pub fn scope(&self) -> &ResourceScope {
        self.slot.scope()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Report completion, releasing every waiter
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.slot.mark_finished(self.epoch)
    }
}

impl Drop for MaintenanceLease {
    fn drop(&mut self) {
        if !self.finished && self.slot.status(self.epoch) == SlotStatus::Assigned {
            tracing::error!(
                "Maintenance lease for {} (epoch {}) dropped unfinished; waiters will spin",
                self.slot.scope(),
                self.epoch
            );
        }
    }
}

/// Registry of ownership slots for one process, keyed by scope
pub struct MaintenanceElection {
    /// Current frame epoch
    epoch: AtomicU64,
    /// Slot per scope, created on first use
    slots: RwLock<HashMap<ResourceScope, Arc<OwnershipSlot>>>,
    /// Bound on follower waits
    owner_timeout: Option<Duration>,
}

impl MaintenanceElection {
    /// Create a registry; `None` waits for owners indefinitely
    pub fn new(owner_timeout: Option<Duration>) -> Self {
        Self {
            epoch: AtomicU64::new(0),
            slots: RwLock::new(HashMap::new()),
            owner_timeout,
        }
    }

    /// Create a registry from configuration
    pub fn from_config(config: &MaintenanceConfig) -> Self {
        Self::new(config.owner_timeout())
    }

    /// Start a new frame epoch; every slot becomes open again
    pub fn begin_epoch(&self, epoch: u64) {
        let previous = self.epoch.fetch_max(epoch, Ordering::AcqRel);
        if epoch < previous {
            tracing::warn!("Ignoring epoch {} older than current {}", epoch, previous);
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Get or create the slot for a scope
    pub fn slot(&self, scope: &ResourceScope) -> Arc<OwnershipSlot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
        {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(scope.clone())
                .or_insert_with(|| Arc::new(OwnershipSlot::new(scope.clone()))),
        )
    }

    /// Spin until the current owner of `scope` finishes
    pub fn wait_until_finished(&self, scope: &ResourceScope) -> Result<u64> {
        self.slot(scope)
            .wait_until_finished(self.epoch(), self.owner_timeout)
    }

    /// Claim the task of `scope` for the current epoch.
    ///
    /// The winner gets the only lease able to report completion.
    pub fn elect(&self, scope: &ResourceScope) -> Election {
        let slot = self.slot(scope);
        let epoch = self.epoch();
        if slot.try_become_owner(epoch) {
            tracing::trace!("Won maintenance of {} for epoch {}", scope, epoch);
            Election::Owner(MaintenanceLease {
                slot,
                epoch,
                finished: false,
            })
        } else {
            Election::Follower
        }
    }

    /// Run `task` if this caller wins, otherwise wait for the winner.
    ///
    /// Returns `Some` with the task's output for the owner, `None` for
    /// followers once the owner finished.
    pub fn run_once<R>(&self, scope: &ResourceScope, task: impl FnOnce() -> R) -> Result<Option<R>> {
        match self.elect(scope) {
            Election::Owner(lease) => {
                let output = task();
                lease.finish()?;
                Ok(Some(output))
            }
            Election::Follower => {
                self.wait_until_finished(scope)?;
                Ok(None)
            }
        }
    }

    /// Number of scopes seen so far
    pub fn scope_count(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for MaintenanceElection {
    fn default() -> Self {
        Self::new(None)
    }
}
