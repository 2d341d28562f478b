//! Message Pumps
//!
//! Tasks draining a node's inbound [`Delivery`] queue and routing each
//! message to the component that owns it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::frame::{BarrierEvent, FrameSignal};
use crate::network::Delivery;
use crate::replication::{Message, ReplicationDirectory, SessionInfo};

/// Authoring side: joins, acks and departures go to the frame sequencer
pub async fn run_authoring_pump(
    mut inbox: mpsc::Receiver<Delivery>,
    events: mpsc::Sender<BarrierEvent>,
) {
    tracing::info!("Authoring message pump started");

    while let Some(delivery) = inbox.recv().await {
        let event = match delivery {
            Delivery::Disconnected { node_id } => BarrierEvent::Disconnected { node_id },
            Delivery::Message { from, message } => match message {
                Message::Hello { node_id, contexts } => BarrierEvent::Joined { node_id, contexts },
                Message::FrameAck { node_id, frame } => BarrierEvent::Ack { node_id, frame },
                Message::Goodbye { node_id } => BarrierEvent::Disconnected { node_id },
                other => {
                    tracing::debug!("Ignoring {} from {}", other.type_name(), from);
                    continue;
                }
            },
        };

        if events.send(event).await.is_err() {
            break;
        }
    }

    tracing::info!("Authoring message pump stopped");
}

/// Render side: replication traffic goes to the directory, frame traffic to
/// the participant. Losing the authoring process ends the session.
pub async fn run_render_pump(
    mut inbox: mpsc::Receiver<Delivery>,
    directory: Arc<ReplicationDirectory>,
    authoring_id: String,
    signals: mpsc::Sender<FrameSignal>,
) {
    tracing::info!("Render message pump started");

    let reason = loop {
        let Some(delivery) = inbox.recv().await else {
            break "inbound queue closed".to_string();
        };

        match delivery {
            Delivery::Disconnected { node_id } if node_id == authoring_id => {
                break format!("authoring process {} disconnected", node_id);
            }
            Delivery::Disconnected { node_id } => {
                tracing::debug!("Peer {} disconnected", node_id);
            }
            Delivery::Message { message, .. } if message.is_replication() => {
                if let Err(e) = directory.apply(&message).await {
                    tracing::error!("Failed to apply {}: {}", message.type_name(), e);
                }
            }
            Delivery::Message { message, from } => {
                let signal = match message {
                    Message::FrameToken { token } => FrameSignal::Token(token),
                    Message::Shutdown { reason } => FrameSignal::Shutdown(reason),
                    other => {
                        tracing::debug!("Ignoring {} from {}", other.type_name(), from);
                        continue;
                    }
                };
                if signals.send(signal).await.is_err() {
                    tracing::info!("Render message pump stopped");
                    return;
                }
            }
        }
    };

    let abandoned = directory.abandon_mirrors().await;
    tracing::warn!("Session lost ({}); abandoned {} mirrors", reason, abandoned);
    let _ = signals.send(FrameSignal::Shutdown(reason)).await;
}

/// Wait for the authoring process's `Welcome`.
///
/// Replication traffic that arrives first is applied; frame traffic that
/// predates the join is dropped.
pub async fn await_welcome(
    inbox: &mut mpsc::Receiver<Delivery>,
    directory: &ReplicationDirectory,
    wait: Duration,
) -> Result<(String, SessionInfo)> {
    match timeout(wait, next_welcome(inbox, directory)).await {
        Ok(welcome) => welcome,
        Err(_) => Err(Error::ConnectionTimeout("no welcome from authoring process".into())),
    }
}

async fn next_welcome(
    inbox: &mut mpsc::Receiver<Delivery>,
    directory: &ReplicationDirectory,
) -> Result<(String, SessionInfo)> {
    loop {
        match inbox.recv().await {
            None => return Err(Error::Disconnected("inbound queue closed".into())),
            Some(Delivery::Disconnected { node_id }) => {
                tracing::debug!("Peer {} disconnected before welcome", node_id);
            }
            Some(Delivery::Message { message, from }) => match message {
                Message::Welcome { authoring_id, session } => return Ok((authoring_id, session)),
                message if message.is_replication() => directory.apply(&message).await?,
                other => {
                    tracing::debug!("Dropping {} from {} before welcome", other.type_name(), from)
                }
            },
        }
    }
}
