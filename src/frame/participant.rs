//! Frame Participant
//!
//! Render-side half of the barrier: waits for the next token, brings the
//! frame-state mirror to the token's version, and acknowledges once the
//! frame has been rendered.

use std::sync::Arc;
use std::time::Duration;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::FrameToken;
use crate::error::{Error, Result};
use crate::id::Version;
use crate::network::Transport;
use crate::replication::{Message, Mirror};

/// Frame traffic routed to the participant by the message pump
#[derive(Debug, Clone)]
pub enum FrameSignal {
    Token(FrameToken),
    /// The session ended; no further tokens follow
    Shutdown(String),
}

/// Render-side frame driver
pub struct FrameParticipant<S> {
    node_id: String,
    authoring_id: String,
    transport: Arc<dyn Transport>,
    /// Mirror of the frame state
    mirror: Mirror<S>,
    signals: mpsc::Receiver<FrameSignal>,
    /// Tokens below this frame predate our join
    first_frame: u64,
    current: Option<FrameToken>,
    acked: bool,
    closed: bool,
    sync_timeout: Option<Duration>,
}

impl<S: DeserializeOwned> FrameParticipant<S> {
    pub fn new(
        transport: Arc<dyn Transport>,
        authoring_id: String,
        mirror: Mirror<S>,
        signals: mpsc::Receiver<FrameSignal>,
        first_frame: u64,
        sync_timeout: Option<Duration>,
    ) -> Self {
        Self {
            node_id: transport.local_id().to_string(),
            authoring_id,
            transport,
            mirror,
            signals,
            first_frame,
            current: None,
            acked: true,
            closed: false,
            sync_timeout,
        }
    }

    /// Frame state as of the current frame
    pub fn state(&self) -> &S {
        self.mirror.get()
    }

    pub fn mirror(&self) -> &Mirror<S> {
        &self.mirror
    }

    pub fn current(&self) -> Option<FrameToken> {
        self.current
    }

    /// Whether the session has ended for this participant
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait for the next frame and synchronize the mirror to it.
    ///
    /// Returns `None` once the authoring process has shut the session down.
    /// Fails with `FramePending` while the previous frame is unacknowledged.
    pub async fn next_frame(&mut self) -> Result<Option<FrameToken>> {
        if let Some(token) = self.current {
            if !self.acked {
                return Err(Error::FramePending(token.frame));
            }
        }
        if self.closed {
            return Ok(None);
        }

        loop {
            let signal = match self.signals.recv().await {
                Some(signal) => signal,
                None => {
                    tracing::warn!("Frame signals closed on {}", self.node_id);
                    self.closed = true;
                    return Ok(None);
                }
            };

            let token = match signal {
                FrameSignal::Token(token) => token,
                FrameSignal::Shutdown(reason) => {
                    tracing::info!("Session ended on {}: {}", self.node_id, reason);
                    self.closed = true;
                    return Ok(None);
                }
            };

            let stale = token.frame < self.first_frame
                || self.current.map(|c| token.frame <= c.frame).unwrap_or(false);
            if stale {
                tracing::debug!("Skipping stale token for {}", token);
                continue;
            }

            self.synchronize(token.version).await?;
            self.current = Some(token);
            self.acked = false;
            tracing::trace!("{} entered {}", self.node_id, token);
            return Ok(Some(token));
        }
    }

    /// Bring the frame-state mirror to `version`, bounded by the sync timeout
    pub async fn synchronize(&mut self, version: Version) -> Result<Version> {
        let id = self.mirror.id();
        match self.sync_timeout {
            None => self.mirror.synchronize(version).await,
            Some(limit) => match timeout(limit, self.mirror.synchronize(version)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Network(format!(
                    "Timed out synchronizing {} to {} after {:?}",
                    id, version, limit
                ))),
            },
        }
    }

    /// Report the current frame as rendered
    pub async fn complete(&mut self) -> Result<FrameToken> {
        let token = self
            .current
            .ok_or_else(|| Error::Internal("no frame in progress".into()))?;
        if self.acked {
            return Ok(token);
        }

        self.transport
            .send_to(&self.authoring_id, &Message::FrameAck {
                node_id: self.node_id.clone(),
                frame: token.frame,
            })
            .await?;
        self.acked = true;
        Ok(token)
    }

    /// Leave the session voluntarily
    pub async fn leave(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport
            .send_to(&self.authoring_id, &Message::Goodbye {
                node_id: self.node_id.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Delivery, LocalHub};
    use crate::replication::{Authoritative, ReplicationDirectory};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Angle {
        angle: f32,
    }

    struct Harness {
        author: Arc<ReplicationDirectory>,
        state: Authoritative<Angle>,
        author_rx: mpsc::Receiver<Delivery>,
        participant: FrameParticipant<Angle>,
        signals: mpsc::Sender<FrameSignal>,
    }

    async fn harness() -> Harness {
        let hub = LocalHub::new();
        let (author_transport, author_rx) = hub.connect("author").await;
        let (render_transport, mut render_rx) = hub.connect("r1").await;

        let author = Arc::new(ReplicationDirectory::new(author_transport));
        let mut state = Authoritative::new(Angle { angle: 0.0 });
        author.publish(&mut state).await.unwrap();

        let render = Arc::new(ReplicationDirectory::new(render_transport.clone()));
        {
            let render = Arc::clone(&render);
            tokio::spawn(async move {
                while let Some(Delivery::Message { message, .. }) = render_rx.recv().await {
                    if message.is_replication() {
                        render.apply(&message).await.unwrap();
                    }
                }
            });
        }

        let id = state.id().unwrap();
        let mirror = loop {
            match render.mirror::<Angle>(id).await {
                Ok(mirror) => break mirror,
                Err(e) if e.is_retryable() => tokio::task::yield_now().await,
                Err(e) => panic!("mirror failed: {}", e),
            }
        };

        let (signals, rx) = mpsc::channel(16);
        let participant = FrameParticipant::new(
            render_transport,
            "author".to_string(),
            mirror,
            rx,
            0,
            Some(Duration::from_secs(2)),
        );

        Harness {
            author,
            state,
            author_rx,
            participant,
            signals,
        }
    }

    #[tokio::test]
    async fn test_next_frame_synchronizes_and_acks() {
        let mut h = harness().await;

        h.state.get_mut().angle = 90.0;
        let version = h.author.commit(&mut h.state).await.unwrap();
        h.signals
            .send(FrameSignal::Token(FrameToken::new(0, version)))
            .await
            .unwrap();

        let token = h.participant.next_frame().await.unwrap().unwrap();
        assert_eq!(token.frame, 0);
        assert_eq!(h.participant.state().angle, 90.0);
        assert_eq!(h.participant.mirror().version(), version);

        h.participant.complete().await.unwrap();
        match h.author_rx.recv().await.unwrap() {
            Delivery::Message {
                message: Message::FrameAck { node_id, frame },
                ..
            } => {
                assert_eq!(node_id, "r1");
                assert_eq!(frame, 0);
            }
            other => panic!("Unexpected delivery: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unacked_frame_blocks_next() {
        let mut h = harness().await;
        let version = h.author.commit(&mut h.state).await.unwrap();
        h.signals
            .send(FrameSignal::Token(FrameToken::new(0, version)))
            .await
            .unwrap();

        h.participant.next_frame().await.unwrap();
        assert!(matches!(
            h.participant.next_frame().await,
            Err(Error::FramePending(0))
        ));
    }

    #[tokio::test]
    async fn test_stale_tokens_are_skipped() {
        let mut h = harness().await;
        let version = h.author.commit(&mut h.state).await.unwrap();

        for frame in [0, 0, 1] {
            h.signals
                .send(FrameSignal::Token(FrameToken::new(frame, version)))
                .await
                .unwrap();
        }

        assert_eq!(h.participant.next_frame().await.unwrap().unwrap().frame, 0);
        h.participant.complete().await.unwrap();
        assert_eq!(h.participant.next_frame().await.unwrap().unwrap().frame, 1);
    }

    #[tokio::test]
    async fn test_shutdown_ends_frames() {
        let mut h = harness().await;
        h.signals
            .send(FrameSignal::Shutdown("quit".into()))
            .await
            .unwrap();

        assert!(h.participant.next_frame().await.unwrap().is_none());
        assert!(h.participant.is_closed());
        assert!(h.participant.next_frame().await.unwrap().is_none());
    }
}
