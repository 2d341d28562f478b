//! Peer Table
//!
//! Tracks live TCP connections by node id and implements [`Transport`] on
//! top of them. Each connection has one writer task draining an outbound
//! queue, so messages to a peer stay in order.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};

use super::{read_message, write_message, Delivery, Transport, CHANNEL_CAPACITY};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Outbound side of one live connection
#[derive(Clone)]
struct PeerHandle {
    tx: mpsc::Sender<Message>,
    /// Wakes the connection's reader so it closes the connection
    evicted: Arc<Notify>,
}

/// Live connections keyed by peer node id
pub struct PeerTable {
    local_id: String,
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl PeerTable {
    /// Create an empty table for this process
    pub fn new(local_id: String) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a connection's handle, replacing any previous connection
    async fn register(&self, node_id: &str, handle: PeerHandle) {
        if self.peers.write().await.insert(node_id.to_string(), handle).is_some() {
            tracing::warn!("Peer {} reconnected, replacing old connection", node_id);
        }
    }

    /// Queue `message` for a peer without waiting; a full queue evicts it
    async fn enqueue(&self, node_id: &str, handle: &PeerHandle, message: &Message) -> Result<()> {
        match handle.tx.try_send(message.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Outbound queue to {} is full; dropping the peer", node_id);
                self.evict(node_id).await;
                Err(Error::Disconnected(node_id.to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(Error::Disconnected(node_id.to_string())),
        }
    }

    /// Number of connected peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether no peer is connected
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Drive one established connection until it closes.
    ///
    /// `node_id` is the peer's identity, already learned from the handshake,
    /// and `handshake` the message that carried it; it is forwarded only once
    /// the peer is registered so replies to it can be routed.
    /// Inbound messages are forwarded to `incoming_tx`; when the connection
    /// drops or the peer is evicted, a `Disconnected` delivery is emitted.
    pub async fn serve<R, W>(
        self: Arc<Self>,
        node_id: String,
        handshake: Option<Message>,
        mut reader: R,
        mut writer: W,
        incoming_tx: mpsc::Sender<Delivery>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        let evicted = Arc::new(Notify::new());
        self.register(
            &node_id,
            PeerHandle {
                tx: out_tx.clone(),
                evicted: Arc::clone(&evicted),
            },
        )
        .await;

        let writer_peer = node_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    tracing::warn!("Write to {} failed: {}", writer_peer, e);
                    break;
                }
            }
        });

        if let Some(message) = handshake {
            let _ = incoming_tx
                .send(Delivery::Message {
                    from: node_id.clone(),
                    message,
                })
                .await;
        }

        let mut was_evicted = false;
        loop {
            let read = tokio::select! {
                read = read_message(&mut reader) => read,
                _ = evicted.notified() => {
                    tracing::info!("Closing connection to evicted peer {}", node_id);
                    was_evicted = true;
                    break;
                }
            };

            match read {
                Ok(message) => {
                    tracing::trace!("Received {} from {}", message.type_name(), node_id);
                    let delivery = Delivery::Message {
                        from: node_id.clone(),
                        message,
                    };
                    if incoming_tx.send(delivery).await.is_err() {
                        break;
                    }
                }
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("Connection to {} closed", node_id);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Error reading from {}: {}", node_id, e);
                    break;
                }
            }
        }

        writer_task.abort();

        // A connection replaced by a newer one goes quietly
        let still_current = {
            let mut peers = self.peers.write().await;
            let current = peers
                .get(&node_id)
                .map(|peer| peer.tx.same_channel(&out_tx))
                .unwrap_or(false);
            if current {
                peers.remove(&node_id);
            }
            current
        };
        if still_current || was_evicted {
            let _ = incoming_tx.send(Delivery::Disconnected { node_id }).await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for PeerTable {
    fn local_id(&self) -> &str {
        &self.local_id
    }

    async fn broadcast(&self, message: &Message) -> Result<usize> {
        let targets: Vec<(String, PeerHandle)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, peer)| (id.clone(), peer.clone()))
            .collect();

        let mut reached = 0;
        for (peer, handle) in targets {
            match self.enqueue(&peer, &handle, message).await {
                Ok(()) => reached += 1,
                Err(e) => tracing::warn!("Broadcast to {} failed: {}", peer, e),
            }
        }
        Ok(reached)
    }

    async fn send_to(&self, node_id: &str, message: &Message) -> Result<()> {
        let handle = self
            .peers
            .read()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::Disconnected(node_id.to_string()))?;

        self.enqueue(node_id, &handle, message).await
    }

    async fn evict(&self, node_id: &str) -> bool {
        match self.peers.write().await.remove(node_id) {
            Some(peer) => {
                peer.evicted.notify_one();
                true
            }
            None => false,
        }
    }

    async fn peers(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serve_forwards_and_reports_disconnect() {
        let table = PeerTable::new("authoring".to_string());
        let (incoming_tx, mut incoming_rx) = mpsc::channel(16);

        let (local, remote) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let (mut remote_reader, mut remote_writer) = tokio::io::split(remote);

        let serve = tokio::spawn(Arc::clone(&table).serve(
            "render-1".to_string(),
            None,
            reader,
            writer,
            incoming_tx,
        ));

        // Remote sends an ack, we should see it inbound
        write_message(&mut remote_writer, &Message::FrameAck {
            node_id: "render-1".into(),
            frame: 0,
        })
        .await
        .unwrap();

        match incoming_rx.recv().await.unwrap() {
            Delivery::Message { from, message } => {
                assert_eq!(from, "render-1");
                assert_eq!(message.type_name(), "FrameAck");
            }
            other => panic!("Unexpected delivery: {:?}", other),
        }

        // Outbound through the transport reaches the remote side
        assert_eq!(table.peers().await, vec!["render-1".to_string()]);
        table
            .send_to("render-1", &Message::Shutdown { reason: "bye".into() })
            .await
            .unwrap();
        let reply = read_message(&mut remote_reader).await.unwrap();
        assert_eq!(reply.type_name(), "Shutdown");

        // Closing the remote end yields a liveness notification
        drop(remote_writer);
        drop(remote_reader);
        match incoming_rx.recv().await.unwrap() {
            Delivery::Disconnected { node_id } => assert_eq!(node_id, "render-1"),
            other => panic!("Unexpected delivery: {:?}", other),
        }
        serve.await.unwrap();
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_closes_connection() {
        let table = PeerTable::new("authoring".to_string());
        let (incoming_tx, mut incoming_rx) = mpsc::channel(16);

        let (local, remote) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let (mut remote_reader, _remote_writer) = tokio::io::split(remote);

        let serve = tokio::spawn(Arc::clone(&table).serve(
            "render-1".to_string(),
            None,
            reader,
            writer,
            incoming_tx,
        ));
        while table.is_empty().await {
            tokio::task::yield_now().await;
        }

        assert!(table.evict("render-1").await);
        assert!(!table.evict("render-1").await);

        // The remote end is still open, yet the drop is reported and the
        // connection closed from our side
        match incoming_rx.recv().await.unwrap() {
            Delivery::Disconnected { node_id } => assert_eq!(node_id, "render-1"),
            other => panic!("Unexpected delivery: {:?}", other),
        }
        serve.await.unwrap();
        assert!(read_message(&mut remote_reader).await.is_err());
        assert!(table
            .send_to("render-1", &Message::Shutdown { reason: "x".into() })
            .await
            .is_err());
    }
}
