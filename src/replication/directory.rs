//! Replication Directory
//!
//! Per-process registry of replicated objects. On the authoring process it
//! mints identifiers, versions commits and pushes them to the transport; on
//! every process it holds the newest snapshot received for each identifier
//! and hands out mirrors bound to it.

use std::collections::HashMap;
use std::sync::Arc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use super::object::{encode, Authoritative, Mirror, Record, ReplicaState};
use super::protocol::Message;
use crate::id::{ObjectId, Version, VersionClock};
use crate::network::Transport;
use crate::error::{Error, Result};

/// Directory entry for one object
struct Entry {
    /// Whether this process holds the authoritative copy
    authoritative: bool,
    /// Newest snapshot, observed by every mirror of the object
    slot: watch::Sender<ReplicaState>,
}

/// Registry of published and mirrored objects for one process
pub struct ReplicationDirectory {
    /// Commit clock, shared by every object published here
    clock: VersionClock,
    /// Known objects
    objects: RwLock<HashMap<ObjectId, Entry>>,
    /// Outbound replication traffic
    transport: Arc<dyn Transport>,
}

impl ReplicationDirectory {
    /// Create a directory bound to a transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            clock: VersionClock::new(),
            objects: RwLock::new(HashMap::new()),
            transport,
        }
    }

    /// Last version issued by this directory's clock
    pub fn clock(&self) -> Version {
        self.clock.current()
    }

    /// Register an authoritative object and broadcast its first snapshot
    pub async fn publish<T: Serialize>(&self, object: &mut Authoritative<T>) -> Result<ObjectId> {
        if let Some(id) = object.id() {
            return Err(Error::AlreadyPublished(id));
        }

        let id = ObjectId::new();
        let payload = encode(object.get())?;
        let version = self.clock.tick();
        let record = Record::new(version, payload);

        let (slot, _) = watch::channel(ReplicaState::Live(record.clone()));
        self.objects.write().await.insert(id, Entry {
            authoritative: true,
            slot,
        });
        object.mark_published(id);
        object.mark_committed(version);

        let reached = self
            .transport
            .broadcast(&Message::Publish {
                id,
                version,
                payload: record.payload.to_vec(),
            })
            .await?;

        tracing::info!("Published {} at {} ({} peers)", id, version, reached);
        Ok(id)
    }

    /// Snapshot the current payload under the next version and replicate it
    pub async fn commit<T: Serialize>(&self, object: &mut Authoritative<T>) -> Result<Version> {
        let id = object.id().ok_or(Error::NotPublished)?;
        let payload = encode(object.get())?;

        let version = {
            let objects = self.objects.read().await;
            let entry = objects
                .get(&id)
                .filter(|entry| entry.authoritative)
                .ok_or(Error::UnknownIdentifier(id))?;

            let version = self.clock.tick();
            entry
                .slot
                .send_replace(ReplicaState::Live(Record::new(version, payload.clone())));
            version
        };
        object.mark_committed(version);

        self.transport
            .broadcast(&Message::Update {
                id,
                version,
                payload,
            })
            .await?;

        tracing::trace!("Committed {} at {}", id, version);
        Ok(version)
    }

    /// Withdraw an authoritative object, failing all of its mirrors
    pub async fn unpublish<T>(&self, object: &mut Authoritative<T>) -> Result<()> {
        let id = object.id().ok_or(Error::NotPublished)?;
        let result = self.withdraw(id).await;
        // Withdrawn locally even when telling the peers failed
        if !matches!(result, Err(Error::UnknownIdentifier(_))) {
            object.mark_unpublished();
        }
        result
    }

    /// Withdraw every authoritative object held here
    pub async fn unpublish_all(&self) -> Result<usize> {
        let ids: Vec<ObjectId> = self
            .objects
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.authoritative)
            .map(|(id, _)| *id)
            .collect();

        let mut first_error = None;
        for id in &ids {
            if let Err(e) = self.withdraw(*id).await {
                tracing::error!("Failed to unpublish {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(ids.len()),
        }
    }

    async fn withdraw(&self, id: ObjectId) -> Result<()> {
        {
            let mut objects = self.objects.write().await;
            match objects.get(&id) {
                Some(entry) if entry.authoritative => {}
                _ => return Err(Error::UnknownIdentifier(id)),
            }
            if let Some(entry) = objects.remove(&id) {
                entry.slot.send_replace(ReplicaState::Gone);
            }
        }

        self.transport.broadcast(&Message::Unpublish { id }).await?;
        tracing::info!("Unpublished {}", id);
        Ok(())
    }

    /// Drop every mirrored object after losing the authoring process.
    ///
    /// Pending and future synchronizes on those mirrors fail with
    /// `SourceGone`.
    pub async fn abandon_mirrors(&self) -> usize {
        let mut objects = self.objects.write().await;
        let ids: Vec<ObjectId> = objects
            .iter()
            .filter(|(_, entry)| !entry.authoritative)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(entry) = objects.remove(id) {
                entry.slot.send_replace(ReplicaState::Gone);
            }
        }
        ids.len()
    }

    /// Map a mirror of a published object
    pub async fn mirror<T: DeserializeOwned>(&self, id: ObjectId) -> Result<Mirror<T>> {
        let objects = self.objects.read().await;
        let entry = objects.get(&id).ok_or(Error::UnknownIdentifier(id))?;

        let slot = entry.slot.subscribe();
        let record = match &*slot.borrow() {
            ReplicaState::Live(record) => record.clone(),
            ReplicaState::Gone => return Err(Error::UnknownIdentifier(id)),
        };
        Mirror::new(id, &record, slot)
    }

    /// Synchronize a mirror to `version`
    pub async fn synchronize<T: DeserializeOwned>(
        &self,
        mirror: &mut Mirror<T>,
        version: Version,
    ) -> Result<Version> {
        mirror.synchronize(version).await
    }

    /// Apply an inbound replication message.
    ///
    /// Snapshots at or below the version already held are dropped; they are
    /// logged as regressions but never surfaced as errors.
    pub async fn apply(&self, message: &Message) -> Result<()> {
        match message {
            Message::Publish { id, version, payload } | Message::Update { id, version, payload } => {
                self.apply_record(*id, *version, payload).await;
                Ok(())
            }
            Message::Unpublish { id } => {
                let removed = {
                    let mut objects = self.objects.write().await;
                    match objects.get(id) {
                        Some(entry) if entry.authoritative => {
                            tracing::warn!("Ignoring remote unpublish of locally owned {}", id);
                            return Ok(());
                        }
                        _ => objects.remove(id),
                    }
                };
                match removed {
                    Some(entry) => {
                        entry.slot.send_replace(ReplicaState::Gone);
                        tracing::info!("Source of {} is gone", id);
                    }
                    None => tracing::debug!("Unpublish for unknown {}", id),
                }
                Ok(())
            }
            other => Err(Error::Internal(format!(
                "{} is not a replication message",
                other.type_name()
            ))),
        }
    }

    async fn apply_record(&self, id: ObjectId, version: Version, payload: &[u8]) {
        let mut objects = self.objects.write().await;

        match objects.get(&id) {
            None => {
                let (slot, _) = watch::channel(ReplicaState::Live(Record::new(version, payload.to_vec())));
                objects.insert(id, Entry {
                    authoritative: false,
                    slot,
                });
                tracing::debug!("Learned {} at {}", id, version);
            }
            Some(entry) if entry.authoritative => {
                tracing::warn!("Ignoring remote snapshot of locally owned {}", id);
            }
            Some(entry) => {
                let current = entry.slot.borrow().version().unwrap_or(Version::ZERO);
                if version <= current {
                    tracing::debug!(
                        "{}",
                        Error::VersionRegression {
                            id,
                            received: version,
                            current,
                        }
                    );
                    return;
                }
                entry
                    .slot
                    .send_replace(ReplicaState::Live(Record::new(version, payload.to_vec())));
            }
        }
    }

    /// Send the newest snapshot of every authoritative object to one peer
    pub async fn replay_to(&self, node_id: &str) -> Result<usize> {
        let records: Vec<(ObjectId, Record)> = self
            .objects
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.authoritative)
            .filter_map(|(id, entry)| match &*entry.slot.borrow() {
                ReplicaState::Live(record) => Some((*id, record.clone())),
                ReplicaState::Gone => None,
            })
            .collect();

        for (id, record) in &records {
            self.transport
                .send_to(node_id, &Message::Publish {
                    id: *id,
                    version: record.version,
                    payload: record.payload.to_vec(),
                })
                .await?;
        }

        tracing::debug!("Replayed {} objects to {}", records.len(), node_id);
        Ok(records.len())
    }

    /// Newest version known for an object
    pub async fn latest_version(&self, id: ObjectId) -> Option<Version> {
        self.objects
            .read()
            .await
            .get(&id)
            .and_then(|entry| entry.slot.borrow().version())
    }

    /// Whether an object is known and live
    pub async fn contains(&self, id: ObjectId) -> bool {
        self.latest_version(id).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalHub;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Angle {
        angle: f32,
    }

    async fn local_directory(node: &str) -> ReplicationDirectory {
        let hub = LocalHub::new();
        let (transport, _rx) = hub.connect(node).await;
        ReplicationDirectory::new(transport)
    }

    fn update(id: ObjectId, version: u64, angle: f32) -> Message {
        Message::Update {
            id,
            version: Version(version),
            payload: encode(&Angle { angle }).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_publish_twice_fails() {
        let directory = local_directory("authoring").await;
        let mut obj = Authoritative::new(Angle { angle: 0.0 });

        let id = directory.publish(&mut obj).await.unwrap();
        let err = directory.publish(&mut obj).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyPublished(dup) if dup == id));
    }

    #[tokio::test]
    async fn test_commit_advances_global_clock() {
        let directory = local_directory("authoring").await;
        let mut a = Authoritative::new(Angle { angle: 0.0 });
        let mut b = Authoritative::new(Angle { angle: 1.0 });

        directory.publish(&mut a).await.unwrap();
        directory.publish(&mut b).await.unwrap();
        let before = directory.clock();

        let v = directory.commit(&mut a).await.unwrap();
        assert_eq!(v, Version(before.as_u64() + 1));
        assert_eq!(a.version(), v);
        assert!(directory.commit(&mut b).await.unwrap() > v);
    }

    #[tokio::test]
    async fn test_commit_requires_publish() {
        let directory = local_directory("authoring").await;
        let mut obj = Authoritative::new(Angle { angle: 0.0 });
        assert!(matches!(directory.commit(&mut obj).await, Err(Error::NotPublished)));
    }

    #[tokio::test]
    async fn test_local_mirror_follows_commits() {
        let directory = local_directory("authoring").await;
        let mut obj = Authoritative::new(Angle { angle: 0.0 });
        let id = directory.publish(&mut obj).await.unwrap();

        let mut mirror: Mirror<Angle> = directory.mirror(id).await.unwrap();
        obj.get_mut().angle = 90.0;
        let v = directory.commit(&mut obj).await.unwrap();

        directory.synchronize(&mut mirror, v).await.unwrap();
        assert_eq!(mirror.get().angle, 90.0);
        assert_eq!(mirror.version(), v);
    }

    #[tokio::test]
    async fn test_mirror_unknown_identifier() {
        let directory = local_directory("render-1").await;
        let err = directory.mirror::<Angle>(ObjectId::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownIdentifier(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unpublish_invalidates_mirrors() {
        let directory = local_directory("authoring").await;
        let mut obj = Authoritative::new(Angle { angle: 0.0 });
        let id = directory.publish(&mut obj).await.unwrap();
        let mut mirror: Mirror<Angle> = directory.mirror(id).await.unwrap();

        directory.unpublish(&mut obj).await.unwrap();
        assert!(!obj.is_published());

        assert!(matches!(
            directory.mirror::<Angle>(id).await,
            Err(Error::UnknownIdentifier(_))
        ));
        assert!(matches!(
            mirror.synchronize(Version(100)).await,
            Err(Error::SourceGone(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_delivery_is_discarded() {
        let directory = local_directory("render-1").await;
        let id = ObjectId::new();

        directory.apply(&update(id, 1, 0.0)).await.unwrap();
        let mut mirror: Mirror<Angle> = directory.mirror(id).await.unwrap();

        directory.apply(&update(id, 3, 30.0)).await.unwrap();
        directory.apply(&update(id, 2, 20.0)).await.unwrap();

        assert_eq!(directory.latest_version(id).await, Some(Version(3)));
        mirror.synchronize(Version(2)).await.unwrap();
        assert_eq!(mirror.version(), Version(3));
        assert_eq!(mirror.get().angle, 30.0);
    }

    #[tokio::test]
    async fn test_remote_unpublish_marks_gone() {
        let directory = local_directory("render-1").await;
        let id = ObjectId::new();
        directory.apply(&update(id, 1, 0.0)).await.unwrap();
        let mut mirror: Mirror<Angle> = directory.mirror(id).await.unwrap();

        directory.apply(&Message::Unpublish { id }).await.unwrap();
        assert!(!directory.contains(id).await);
        assert!(matches!(
            mirror.synchronize(Version(1)).await,
            Err(Error::SourceGone(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_rejects_non_replication_message() {
        let directory = local_directory("render-1").await;
        let err = directory
            .apply(&Message::Shutdown { reason: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_abandon_mirrors_keeps_owned_objects() {
        let directory = local_directory("render-1").await;
        let remote = ObjectId::new();
        directory.apply(&update(remote, 1, 0.0)).await.unwrap();
        let mut mirror: Mirror<Angle> = directory.mirror(remote).await.unwrap();

        let mut owned = Authoritative::new(Angle { angle: 5.0 });
        let owned_id = directory.publish(&mut owned).await.unwrap();

        assert_eq!(directory.abandon_mirrors().await, 1);
        assert!(directory.contains(owned_id).await);
        assert!(matches!(
            mirror.synchronize(Version(1)).await,
            Err(Error::SourceGone(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remote_unpublish_never_hides_owned_object() {
        let directory = Arc::new(local_directory("authoring").await);
        let mut owned = Authoritative::new(Angle { angle: 0.0 });
        let id = directory.publish(&mut owned).await.unwrap();

        let spoofer = {
            let directory = Arc::clone(&directory);
            tokio::spawn(async move {
                for _ in 0..500 {
                    directory.apply(&Message::Unpublish { id }).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for step in 0..500 {
            owned.get_mut().angle = step as f32;
            directory.commit(&mut owned).await.unwrap();
            let mirror: Mirror<Angle> = directory.mirror(id).await.unwrap();
            assert!(mirror.version() >= Version(1));
        }
        spoofer.await.unwrap();
        assert!(directory.contains(id).await);
    }
}
