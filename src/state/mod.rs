//! State Management Module
//!
//! Participant membership for the frame barrier, and the per-frame
//! maintenance election shared by a node's execution units.

mod membership;
mod slot;
pub mod election;

pub use membership::{ParticipantSet, ParticipantState, ParticipantStatus, ParticipantSummary};
pub use slot::{OwnershipSlot, ResourceScope, SlotStatus};
pub use election::{Election, MaintenanceElection, MaintenanceLease};
