//! Object Identifiers and Versions
//!
//! Every published object gets a random 128-bit identifier that stays fixed
//! for its lifetime. Committed snapshots are tagged with a [`Version`] drawn
//! from a per-directory [`VersionClock`], so versions are totally ordered
//! across all objects of one authoring process.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Globally unique identifier of a published object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Mint a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the raw 128-bit value
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for ObjectId {
    fn from(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

/// Version tag attached to every committed snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// The version of an object that has never been committed
    pub const ZERO: Version = Version(0);

    /// Get the raw counter value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Monotonic clock handing out commit versions
///
/// Lock-free; each `tick` advances the clock by exactly one.
#[derive(Debug, Default)]
pub struct VersionClock {
    current: AtomicU64,
}

impl VersionClock {
    /// Create a clock that has not issued any version yet
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
        }
    }

    /// Issue the next version
    pub fn tick(&self) -> Version {
        Version(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Last version issued (`Version::ZERO` if none)
    pub fn current(&self) -> Version {
        Version(self.current.load(Ordering::SeqCst))
    }
}
