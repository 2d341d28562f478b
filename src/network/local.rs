//! In-process Transport
//!
//! Connects several logical processes living in one address space, used by
//! the `demo` command and by the integration tests. Each endpoint gets its
//! own ordered inbound queue.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use super::{Delivery, Transport, CHANNEL_CAPACITY};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Shared fabric all local endpoints attach to
#[derive(Default)]
pub struct LocalHub {
    endpoints: RwLock<HashMap<String, mpsc::Sender<Delivery>>>,
}

impl LocalHub {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an endpoint and get its transport and inbound queue
    pub async fn connect(
        self: &Arc<Self>,
        node_id: &str,
    ) -> (Arc<LocalTransport>, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.endpoints.write().await.insert(node_id.to_string(), tx);
        tracing::debug!("Local endpoint {} attached", node_id);

        let transport = Arc::new(LocalTransport {
            node_id: node_id.to_string(),
            hub: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Detach an endpoint, telling every other endpoint it is gone.
    ///
    /// Returns false if it was not attached.
    pub async fn disconnect(&self, node_id: &str) -> bool {
        let others: Vec<(String, mpsc::Sender<Delivery>)> = {
            let mut endpoints = self.endpoints.write().await;
            if endpoints.remove(node_id).is_none() {
                return false;
            }
            endpoints.iter().map(|(id, tx)| (id.clone(), tx.clone())).collect()
        };

        tracing::info!("Local endpoint {} detached", node_id);
        for (peer, tx) in others {
            let notice = Delivery::Disconnected {
                node_id: node_id.to_string(),
            };
            if let Err(e) = tx.try_send(notice) {
                tracing::warn!("Could not tell {} that {} left: {}", peer, node_id, e);
            }
        }
        true
    }

    async fn deliver(&self, from: &str, to: &str, message: &Message) -> Result<()> {
        let tx = self
            .endpoints
            .read()
            .await
            .get(to)
            .cloned()
            .ok_or_else(|| Error::Disconnected(to.to_string()))?;

        let delivery = Delivery::Message {
            from: from.to_string(),
            message: message.clone(),
        };
        match tx.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Inbound queue of {} is full; detaching it", to);
                self.disconnect(to).await;
                Err(Error::Disconnected(to.to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(Error::Disconnected(to.to_string())),
        }
    }
}

/// One endpoint's view of the hub
pub struct LocalTransport {
    node_id: String,
    hub: Arc<LocalHub>,
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    fn local_id(&self) -> &str {
        &self.node_id
    }

    async fn broadcast(&self, message: &Message) -> Result<usize> {
        let mut reached = 0;
        for peer in self.peers().await {
            match self.hub.deliver(&self.node_id, &peer, message).await {
                Ok(()) => reached += 1,
                Err(e) => tracing::warn!("Broadcast to {} failed: {}", peer, e),
            }
        }
        Ok(reached)
    }

    async fn send_to(&self, node_id: &str, message: &Message) -> Result<()> {
        self.hub.deliver(&self.node_id, node_id, message).await
    }

    async fn evict(&self, node_id: &str) -> bool {
        self.hub.disconnect(node_id).await
    }

    async fn peers(&self) -> Vec<String> {
        self.hub
            .endpoints
            .read()
            .await
            .keys()
            .filter(|id| *id != &self.node_id)
            .cloned()
            .collect()
    }
}
