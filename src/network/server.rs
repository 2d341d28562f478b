//! Network Server
//!
//! TCP listener run by the authoring process. Render nodes connect, say
//! `Hello`, and from then on the connection is driven by the [`PeerTable`].

use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{read_message, Delivery, PeerTable};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Registry outbound traffic is routed through
    table: Arc<PeerTable>,
    /// Channel for incoming deliveries
    incoming_tx: mpsc::Sender<Delivery>,
    /// How long a new connection may take to say `Hello`
    handshake_timeout: Duration,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(
        bind_address: String,
        table: Arc<PeerTable>,
        incoming_tx: mpsc::Sender<Delivery>,
        handshake_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            table,
            incoming_tx,
            handshake_timeout,
            shutdown: shutdown_tx,
        }
    }

    /// Bind the listener
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Network server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let table = Arc::clone(&self.table);
                            let incoming_tx = self.incoming_tx.clone();
                            let handshake_timeout = self.handshake_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, table, incoming_tx, handshake_timeout).await {
                                    tracing::warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }

    /// Bind and accept connections until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handshake a single connection, then hand it to the peer table
async fn handle_connection(
    socket: TcpStream,
    table: Arc<PeerTable>,
    incoming_tx: mpsc::Sender<Delivery>,
    handshake_timeout: Duration,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let peer_addr = socket.peer_addr()?.to_string();
    let (mut reader, writer) = socket.into_split();

    let hello = match timeout(handshake_timeout, read_message(&mut reader)).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::ConnectionTimeout(peer_addr)),
    };

    let node_id = match &hello {
        Message::Hello { node_id, .. } => node_id.clone(),
        other => {
            return Err(Error::Network(format!(
                "Expected Hello from {}, got {}",
                peer_addr,
                other.type_name()
            )));
        }
    };

    tracing::info!("Render node {} connected from {}", node_id, peer_addr);
    table.serve(node_id, Some(hello), reader, writer, incoming_tx).await;
    Ok(())
}
