//! Versioned Objects
//!
//! An object is either the authoritative copy, owned and mutated by the
//! authoring process, or a mirror: a read-only replica that only changes
//! when [`Mirror::synchronize`] pulls in a newer committed snapshot.

use std::sync::Arc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::id::{ObjectId, Version};
use crate::error::{Error, Result};

/// Encode a payload for replication
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a replicated payload
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// One committed snapshot of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub version: Version,
    pub payload: Arc<Vec<u8>>,
}

impl Record {
    pub fn new(version: Version, payload: Vec<u8>) -> Self {
        Self {
            version,
            payload: Arc::new(payload),
        }
    }
}

/// Latest known state of an object as seen by this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaState {
    /// Newest committed snapshot received so far
    Live(Record),
    /// The authoritative object was unpublished
    Gone,
}

impl ReplicaState {
    /// Version of the live record, if any
    pub fn version(&self) -> Option<Version> {
        match self {
            ReplicaState::Live(record) => Some(record.version),
            ReplicaState::Gone => None,
        }
    }
}

/// The canonical copy of a replicated value
#[derive(Debug)]
pub struct Authoritative<T> {
    id: Option<ObjectId>,
    version: Version,
    value: T,
}

impl<T> Authoritative<T> {
    /// Wrap a value; it is not visible to anyone until published
    pub fn new(value: T) -> Self {
        Self {
            id: None,
            version: Version::ZERO,
            value,
        }
    }

    /// Identifier, once published
    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    /// Version of the last commit
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_published(&self) -> bool {
        self.id.is_some()
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mutate in place; changes become visible at the next commit
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub(crate) fn mark_published(&mut self, id: ObjectId) {
        self.id = Some(id);
    }

    pub(crate) fn mark_committed(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn mark_unpublished(&mut self) {
        self.id = None;
    }
}

/// A read-only replica of a published object
pub struct Mirror<T> {
    id: ObjectId,
    version: Version,
    value: T,
    slot: watch::Receiver<ReplicaState>,
}

impl<T: DeserializeOwned> Mirror<T> {
    pub(crate) fn new(id: ObjectId, record: &Record, slot: watch::Receiver<ReplicaState>) -> Result<Self> {
        Ok(Self {
            id,
            version: record.version,
            value: decode(&record.payload)?,
            slot,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Version of the payload currently held
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Wait until this mirror holds the payload as of `target` or newer.
    ///
    /// Returns immediately if the mirror is already there. Snapshots are
    /// applied last-writer-wins: if newer versions arrived meanwhile the
    /// mirror jumps straight to the newest one and never goes back.
    pub async fn synchronize(&mut self, target: Version) -> Result<Version> {
        loop {
            let latest = match &*self.slot.borrow_and_update() {
                ReplicaState::Gone => return Err(Error::SourceGone(self.id)),
                ReplicaState::Live(record) => record.clone(),
            };

            if self.version >= target {
                return Ok(self.version);
            }

            if latest.version >= target {
                self.apply(&latest)?;
                return Ok(self.version);
            }

            tracing::trace!("Mirror {} waiting for {} (latest {})", self.id, target, latest.version);
            if self.slot.changed().await.is_err() {
                return Err(Error::SourceGone(self.id));
            }
        }
    }

    /// Pull in the newest snapshot already received, without waiting
    pub fn refresh(&mut self) -> Result<Version> {
        let latest = match &*self.slot.borrow_and_update() {
            ReplicaState::Gone => return Err(Error::SourceGone(self.id)),
            ReplicaState::Live(record) => record.clone(),
        };
        self.apply(&latest)?;
        Ok(self.version)
    }

    fn apply(&mut self, record: &Record) -> Result<()> {
        if record.version <= self.version {
            tracing::debug!(
                "{}",
                Error::VersionRegression {
                    id: self.id,
                    received: record.version,
                    current: self.version,
                }
            );
            return Ok(());
        }

        self.value = decode(&record.payload)?;
        self.version = record.version;
        Ok(())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mirror<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Angle {
        angle: f32,
    }

    fn live(version: u64, angle: f32) -> ReplicaState {
        ReplicaState::Live(Record::new(Version(version), encode(&Angle { angle }).unwrap()))
    }

    fn mirror_at(version: u64, angle: f32) -> (watch::Sender<ReplicaState>, Mirror<Angle>) {
        let (tx, rx) = watch::channel(live(version, angle));
        let record = match &*tx.borrow() {
            ReplicaState::Live(record) => record.clone(),
            ReplicaState::Gone => unreachable!(),
        };
        let mirror = Mirror::new(ObjectId::new(), &record, rx).unwrap();
        (tx, mirror)
    }

    #[test]
    fn test_codec_roundtrip_is_bit_exact() {
        let value = Angle { angle: -0.0 };
        let bytes = encode(&value).unwrap();
        let back: Angle = decode(&bytes).unwrap();
        assert_eq!(encode(&back).unwrap(), bytes);
    }

    #[test]
    fn test_authoritative_starts_unpublished() {
        let mut obj = Authoritative::new(Angle { angle: 1.0 });
        assert!(!obj.is_published());
        assert_eq!(obj.version(), Version::ZERO);
        obj.get_mut().angle = 2.0;
        assert_eq!(obj.get().angle, 2.0);
    }

    #[tokio::test]
    async fn test_synchronize_is_idempotent() {
        let (_tx, mut mirror) = mirror_at(1, 0.0);

        assert_eq!(mirror.synchronize(Version(1)).await.unwrap(), Version(1));
        assert_eq!(mirror.synchronize(Version(1)).await.unwrap(), Version(1));
        assert_eq!(mirror.get(), &Angle { angle: 0.0 });
    }

    #[tokio::test]
    async fn test_synchronize_waits_for_target() {
        let (tx, mut mirror) = mirror_at(1, 0.0);

        let waiter = tokio::spawn(async move {
            let version = mirror.synchronize(Version(3)).await.unwrap();
            (version, mirror.get().clone())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(live(2, 45.0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(live(3, 90.0));

        let (version, value) = waiter.await.unwrap();
        assert_eq!(version, Version(3));
        assert_eq!(value, Angle { angle: 90.0 });
    }

    #[tokio::test]
    async fn test_synchronize_fails_when_source_gone() {
        let (tx, mut mirror) = mirror_at(1, 0.0);
        tx.send_replace(ReplicaState::Gone);

        let err = mirror.synchronize(Version(2)).await.unwrap_err();
        assert!(matches!(err, Error::SourceGone(_)));
    }

    #[tokio::test]
    async fn test_synchronize_fails_when_directory_dropped() {
        let (tx, mut mirror) = mirror_at(1, 0.0);
        let waiter = tokio::spawn(async move { mirror.synchronize(Version(5)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(tx);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SourceGone(_)));
    }

    #[test]
    fn test_refresh_never_regresses() {
        let (tx, mut mirror) = mirror_at(4, 10.0);
        tx.send_replace(live(2, 99.0));

        assert_eq!(mirror.refresh().unwrap(), Version(4));
        assert_eq!(mirror.get().angle, 10.0);
    }
}
