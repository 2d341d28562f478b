//! Ownership Slots
//!
//! A slot elects one owner per resource scope per frame epoch. The epoch and
//! the slot state are packed into a single atomic word, so a slot left over
//! from an earlier frame reads as open again without anyone resetting it,
//! and every transition is a single compare-and-swap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const OPEN: u64 = 0;
const ASSIGNED: u64 = 1;
const FINISHED: u64 = 2;

const STATE_BITS: u64 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// How many yields pass between deadline checks
const DEADLINE_CHECK_INTERVAL: u64 = 64;

fn pack(epoch: u64, state: u64) -> u64 {
    (epoch << STATE_BITS) | state
}

fn unpack(word: u64) -> (u64, u64) {
    (word >> STATE_BITS, word & STATE_MASK)
}

/// Granularity at which maintenance ownership is elected
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceScope {
    /// Shared by every context of one node
    Node(String),
    /// Private to one GPU context of a node
    Context { node: String, context: u32 },
}

impl ResourceScope {
    pub fn node(node: impl Into<String>) -> Self {
        ResourceScope::Node(node.into())
    }

    pub fn context(node: impl Into<String>, context: u32) -> Self {
        ResourceScope::Context {
            node: node.into(),
            context,
        }
    }
}

impl std::fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceScope::Node(node) => write!(f, "node:{}", node),
            ResourceScope::Context { node, context } => write!(f, "context:{}/{}", node, context),
        }
    }
}

/// Observable state of a slot within one epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Nobody claimed the task yet
    Open,
    /// An owner is running the task
    Assigned,
    /// The owner reported completion
    Finished,
}

/// Per-scope election cell
#[derive(Debug)]
pub struct OwnershipSlot {
    scope: ResourceScope,
    cell: AtomicU64,
}

impl OwnershipSlot {
    /// Create an open slot
    pub fn new(scope: ResourceScope) -> Self {
        Self {
            scope,
            cell: AtomicU64::new(pack(0, OPEN)),
        }
    }

    pub fn scope(&self) -> &ResourceScope {
        &self.scope
    }

    /// Claim the slot for `epoch`. Exactly one caller per epoch gets `true`.
    pub fn try_become_owner(&self, epoch: u64) -> bool {
        let mut current = self.cell.load(Ordering::Acquire);
        loop {
            let (slot_epoch, state) = unpack(current);
            if slot_epoch > epoch || (slot_epoch == epoch && state != OPEN) {
                return false;
            }

            match self.cell.compare_exchange(
                current,
                pack(epoch, ASSIGNED),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Report completion of the task claimed for `epoch`
    pub fn mark_finished(&self, epoch: u64) -> Result<()> {
        self.cell
            .compare_exchange(
                pack(epoch, ASSIGNED),
                pack(epoch, FINISHED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| Error::NotOwner(self.scope.to_string()))
    }

    /// State of the slot as seen by a caller in `epoch`
    pub fn status(&self, epoch: u64) -> SlotStatus {
        let (slot_epoch, state) = unpack(self.cell.load(Ordering::Acquire));
        if slot_epoch > epoch {
            // The frame moved on, so this epoch's task is over
            return SlotStatus::Finished;
        }
        if slot_epoch < epoch {
            return SlotStatus::Open;
        }
        match state {
            ASSIGNED => SlotStatus::Assigned,
            FINISHED => SlotStatus::Finished,
            _ => SlotStatus::Open,
        }
    }

    pub fn is_finished(&self, epoch: u64) -> bool {
        self.status(epoch) == SlotStatus::Finished
    }

    /// Spin until the owner of `epoch` finishes, yielding on every turn.
    ///
    /// Returns the number of yields spent. With `deadline` set, gives up with
    /// `OwnerLivenessTimeout` once it has passed; without one, an owner that
    /// never finishes keeps the caller spinning forever.
    pub fn wait_until_finished(&self, epoch: u64, deadline: Option<Duration>) -> Result<u64> {
        let start = Instant::now();
        let mut yields = 0u64;

        loop {
            if self.is_finished(epoch) {
                return Ok(yields);
            }

            if let Some(limit) = deadline {
                if yields % DEADLINE_CHECK_INTERVAL == 0 && start.elapsed() > limit {
                    tracing::error!(
                        "Maintenance owner of {} did not finish epoch {} within {:?}",
                        self.scope,
                        epoch,
                        limit
                    );
                    return Err(Error::OwnerLivenessTimeout {
                        scope: self.scope.to_string(),
                        waited_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }

            std::thread::yield_now();
            yields += 1;
        }
    }
}
