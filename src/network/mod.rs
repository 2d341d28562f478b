//! Network Module
//!
//! Message transport between the authoring process and render nodes.
//! The core only talks to the [`Transport`] trait; inbound traffic arrives
//! on an `mpsc` channel of [`Delivery`] values, including liveness
//! notifications when a peer drops out.

mod local;
mod peers;
mod server;
mod client;

pub use local::{LocalHub, LocalTransport};
pub use peers::PeerTable;
pub use server::NetworkServer;
pub use client::NetworkClient;

use crate::replication::{FrameHeader, Message};
use crate::error::{Error, Result};

/// Capacity of inbound and per-peer outbound queues
pub const CHANNEL_CAPACITY: usize = 10000;

/// Something received from the transport
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A message from a peer
    Message { from: String, message: Message },
    /// A peer's connection is gone
    Disconnected { node_id: String },
}

/// Reliable, ordered message fabric between cluster processes
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Identifier of this process on the fabric
    fn local_id(&self) -> &str;

    /// Send to every connected peer, returning how many were reached.
    ///
    /// Never waits on a slow peer: one whose queue is full is evicted.
    async fn broadcast(&self, message: &Message) -> Result<usize>;

    /// Send to one peer; a full queue evicts it like `broadcast` does
    async fn send_to(&self, node_id: &str, message: &Message) -> Result<()>;

    /// Stop delivering to a peer and drop its connection.
    ///
    /// Returns false if it was not connected. Other endpoints learn of the
    /// drop through a `Delivery::Disconnected`.
    async fn evict(&self, node_id: &str) -> bool;

    /// Currently connected peers
    async fn peers(&self) -> Vec<String>;
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Message length {} exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}
