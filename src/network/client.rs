//! Network Client
//!
//! TCP client used by render nodes to join the authoring process.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use super::{read_message, write_message, Delivery, PeerTable};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Network client for connecting to the authoring process
pub struct NetworkClient {
    /// This render node's id
    node_id: String,
    /// GPU contexts hosted here, announced in `Hello`
    contexts: u32,
    /// Connection timeout
    connect_timeout: Duration,
    /// Delay between connection attempts
    retry_delay: Duration,
    /// Maximum connection attempts
    max_attempts: u32,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(
        node_id: String,
        contexts: u32,
        connect_timeout: Duration,
        retry_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            node_id,
            contexts,
            connect_timeout,
            retry_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Connect, handshake and spawn the connection driver.
    ///
    /// Returns the authoring process id taken from its `Welcome`. The
    /// `Welcome` itself is forwarded to `incoming_tx` like any other message.
    pub async fn join(
        &self,
        address: &str,
        table: Arc<PeerTable>,
        incoming_tx: mpsc::Sender<Delivery>,
    ) -> Result<String> {
        let stream = self.connect_with_retry(address).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_message(&mut writer, &Message::Hello {
            node_id: self.node_id.clone(),
            contexts: self.contexts,
        })
        .await?;

        let welcome = match timeout(self.connect_timeout, read_message(&mut reader)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };

        let authoring_id = match &welcome {
            Message::Welcome { authoring_id, .. } => authoring_id.clone(),
            other => {
                return Err(Error::Network(format!(
                    "Expected Welcome from {}, got {}",
                    address,
                    other.type_name()
                )));
            }
        };

        tracing::info!("Joined session of {} at {}", authoring_id, address);
        tokio::spawn(table.serve(authoring_id.clone(), Some(welcome), reader, writer, incoming_tx));
        Ok(authoring_id)
    }

    /// Connect, retrying while the authoring process is not up yet
    async fn connect_with_retry(&self, address: &str) -> Result<TcpStream> {
        let mut attempt = 1;
        loop {
            match self.connect(address).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    tracing::debug!(
                        "Connect to {} failed (attempt {}/{}): {}",
                        address,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    attempt += 1;
                    sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }
}
