//! Frame Sequencer
//!
//! Drives frames on the authoring process:
//! `Idle -> Committing -> Broadcasting -> AwaitingAck -> Advancing -> Idle`.
//! Joins, acknowledgments and disconnects reach it as [`BarrierEvent`]s
//! from the message pump.

use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{FrameData, FramePhase, FrameToken};
use crate::error::{Error, Result};
use crate::id::{ObjectId, Version};
use crate::network::Transport;
use crate::replication::{Authoritative, Message, ReplicationDirectory, SessionInfo};
use crate::state::ParticipantSet;

/// Participant activity relevant to the barrier
#[derive(Debug, Clone)]
pub enum BarrierEvent {
    /// A render node said `Hello`
    Joined { node_id: String, contexts: u32 },
    /// A render node finished a frame
    Ack { node_id: String, frame: u64 },
    /// A render node left or its connection dropped
    Disconnected { node_id: String },
}

/// Outcome of one frame's barrier
#[derive(Debug, Clone)]
pub struct BarrierReport {
    pub frame: u64,
    pub version: Version,
    /// Participants that acknowledged the frame
    pub acked: usize,
    /// Participants lost since the previous report
    pub disconnected: Vec<String>,
    /// Participants dropped for missing the barrier deadline
    pub timed_out: Vec<String>,
    /// No frame follows this one
    pub final_frame: bool,
    pub elapsed: Duration,
}

/// Authoring-side frame driver
pub struct FrameSequencer<S> {
    directory: Arc<ReplicationDirectory>,
    transport: Arc<dyn Transport>,
    participants: Arc<ParticipantSet>,
    /// Authoritative frame state
    state: Authoritative<S>,
    /// What joiners are told; `next_frame` advances with every broadcast
    session: SessionInfo,
    phase: FramePhase,
    current: Option<FrameToken>,
    final_frame: bool,
    shut_down: bool,
    /// Disconnects not reported yet
    dropped: Vec<String>,
    events: mpsc::Receiver<BarrierEvent>,
    barrier_timeout: Option<Duration>,
}

impl<S: Serialize + FrameData> FrameSequencer<S> {
    /// Create a sequencer for a published frame state
    pub fn new(
        directory: Arc<ReplicationDirectory>,
        transport: Arc<dyn Transport>,
        participants: Arc<ParticipantSet>,
        state: Authoritative<S>,
        init_id: ObjectId,
        events: mpsc::Receiver<BarrierEvent>,
        barrier_timeout: Option<Duration>,
    ) -> Result<Self> {
        let frame_state_id = state.id().ok_or(Error::NotPublished)?;

        Ok(Self {
            directory,
            transport,
            participants,
            state,
            session: SessionInfo {
                init_id,
                frame_state_id,
                next_frame: 0,
            },
            phase: FramePhase::Idle,
            current: None,
            final_frame: false,
            shut_down: false,
            dropped: Vec::new(),
            events,
            barrier_timeout,
        })
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Number of the next frame to broadcast
    pub fn next_frame(&self) -> u64 {
        self.session.next_frame
    }

    pub fn session(&self) -> SessionInfo {
        self.session
    }

    /// Token of the frame in flight or last completed
    pub fn current(&self) -> Option<FrameToken> {
        self.current
    }

    pub fn state(&self) -> &S {
        self.state.get()
    }

    /// Mutable frame state, to be changed between frames
    pub fn state_mut(&mut self) -> &mut S {
        self.state.get_mut()
    }

    pub fn participants(&self) -> &Arc<ParticipantSet> {
        &self.participants
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Process joins until `count` participants are connected
    pub async fn wait_for_participants(&mut self, count: usize, wait: Duration) -> Result<usize> {
        let deadline = Instant::now() + wait;

        loop {
            let connected = self.participants.connected().await.len();
            if connected >= count {
                return Ok(connected);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ConnectionTimeout(format!(
                    "{} of {} participants joined",
                    connected, count
                )));
            }

            match timeout(remaining, self.events.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => return Err(Error::ShuttingDown),
                Err(_) => {}
            }
        }
    }

    /// Commit the frame state and broadcast the token of the next frame
    pub async fn begin_frame(&mut self) -> Result<FrameToken> {
        if self.shut_down {
            return Err(Error::ShuttingDown);
        }
        if self.phase != FramePhase::Idle {
            let frame = self.current.map(|t| t.frame).unwrap_or(self.session.next_frame);
            return Err(Error::FramePending(frame));
        }

        // Whoever joined since the last frame owes this one
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await;
        }

        self.phase = FramePhase::Committing;
        let committed = self.directory.commit(&mut self.state).await;
        let version = match committed {
            Ok(version) => version,
            Err(e) => return Err(self.abort_session("commit", e).await),
        };
        let token = FrameToken::new(self.session.next_frame, version);
        self.final_frame = self.state.get().quit_requested();

        self.phase = FramePhase::Broadcasting;
        let sent = self.transport.broadcast(&Message::FrameToken { token }).await;
        let reached = match sent {
            Ok(reached) => reached,
            Err(e) => return Err(self.abort_session("frame token broadcast", e).await),
        };
        self.session.next_frame += 1;
        self.current = Some(token);
        self.phase = FramePhase::AwaitingAck;

        tracing::debug!("Broadcast {} to {} participants", token, reached);
        Ok(token)
    }

    /// Wait until every connected participant acknowledged the current frame
    pub async fn end_frame(&mut self) -> Result<BarrierReport> {
        let token = match (self.phase, self.current) {
            (FramePhase::AwaitingAck, Some(token)) => token,
            _ => return Err(Error::Internal("no frame is awaiting acknowledgment".into())),
        };

        let started = Instant::now();
        let mut timed_out = Vec::new();
        let mut warned = false;

        loop {
            let pending = self.participants.pending(token.frame).await;
            if pending.is_empty() {
                break;
            }

            let wait = match self.barrier_timeout {
                None => None,
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        for node_id in pending {
                            if self.participants.disconnect(&node_id).await {
                                tracing::warn!(
                                    "Participant {} missed the barrier of frame {} ({:?})",
                                    node_id,
                                    token.frame,
                                    limit
                                );
                                self.transport.evict(&node_id).await;
                                timed_out.push(node_id);
                            }
                        }
                        break;
                    }

                    if !warned && elapsed >= limit / 2 {
                        let lagging = self.participants.mark_lagging(token.frame).await;
                        tracing::warn!("Frame {} waiting on {:?}", token.frame, lagging);
                        warned = true;
                    }

                    if warned {
                        Some(limit - elapsed)
                    } else {
                        Some(limit / 2 - elapsed)
                    }
                }
            };

            let event = match wait {
                None => self.events.recv().await,
                Some(wait) => match timeout(wait, self.events.recv()).await {
                    Ok(event) => event,
                    Err(_) => continue,
                },
            };

            match event {
                Some(event) => self.handle_event(event).await,
                None => {
                    tracing::error!("Barrier events closed; releasing frame {}", token.frame);
                    for node_id in pending {
                        if self.participants.disconnect(&node_id).await {
                            self.dropped.push(node_id);
                        }
                    }
                    break;
                }
            }
        }

        self.phase = FramePhase::Advancing;
        let acked = self
            .participants
            .connected()
            .await
            .iter()
            .filter(|node| node.has_acked(token.frame))
            .count();

        let report = BarrierReport {
            frame: token.frame,
            version: token.version,
            acked,
            disconnected: std::mem::take(&mut self.dropped),
            timed_out,
            final_frame: self.final_frame,
            elapsed: started.elapsed(),
        };
        tracing::debug!(
            "Frame {} released after {:?} ({} acks)",
            token.frame,
            report.elapsed,
            report.acked
        );

        self.phase = FramePhase::Idle;
        if self.final_frame {
            self.shutdown("quit requested").await?;
        }
        Ok(report)
    }

    /// Mutate the state, then run one full frame
    pub async fn run_frame(&mut self, mutate: impl FnOnce(&mut S)) -> Result<BarrierReport> {
        if self.shut_down {
            return Err(Error::ShuttingDown);
        }
        mutate(self.state.get_mut());
        self.begin_frame().await?;
        self.end_frame().await
    }

    /// Unpublish everything and release every participant.
    ///
    /// Every step is attempted even if an earlier one fails; the first
    /// error is returned.
    pub async fn shutdown(&mut self, reason: &str) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.phase = FramePhase::Idle;

        let mut first_error = None;
        if self.state.is_published() {
            if let Err(e) = self.directory.unpublish(&mut self.state).await {
                tracing::error!("Failed to withdraw the frame state: {}", e);
                first_error.get_or_insert(e);
            }
        }
        let withdrawn = match self.directory.unpublish_all().await {
            Ok(withdrawn) => withdrawn,
            Err(e) => {
                first_error.get_or_insert(e);
                0
            }
        };

        let notice = Message::Shutdown {
            reason: reason.to_string(),
        };
        if let Err(e) = self.transport.broadcast(&notice).await {
            tracing::error!("Failed to announce shutdown: {}", e);
            first_error.get_or_insert(e);
        }

        tracing::info!(
            "Session shut down after {} frames ({}), {} further objects withdrawn",
            self.session.next_frame,
            reason,
            withdrawn
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// End the session after a replication failure, returning the failure
    async fn abort_session(&mut self, step: &str, error: Error) -> Error {
        tracing::error!("Frame {} {} failed: {}", self.session.next_frame, step, error);
        if let Err(e) = self.shutdown(&format!("{} failed: {}", step, error)).await {
            tracing::error!("Shutdown after failed {} also failed: {}", step, e);
        }
        error
    }

    async fn handle_event(&mut self, event: BarrierEvent) {
        match event {
            BarrierEvent::Joined { node_id, contexts } => self.admit(&node_id, contexts).await,
            BarrierEvent::Ack { node_id, frame } => {
                self.participants.record_ack(&node_id, frame).await;
            }
            BarrierEvent::Disconnected { node_id } => {
                if self.participants.disconnect(&node_id).await {
                    self.transport.evict(&node_id).await;
                    self.dropped.push(node_id);
                }
            }
        }
    }

    /// Welcome a joiner and replay every published object to it
    async fn admit(&mut self, node_id: &str, contexts: u32) {
        self.participants
            .join(node_id, contexts, self.session.next_frame)
            .await;

        let welcome = Message::Welcome {
            authoring_id: self.transport.local_id().to_string(),
            session: self.session,
        };

        let result = match self.transport.send_to(node_id, &welcome).await {
            Ok(()) => self.directory.replay_to(node_id).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::warn!("Failed to admit {}: {}", node_id, e);
            if self.participants.disconnect(node_id).await {
                self.transport.evict(node_id).await;
                self.dropped.push(node_id.to_string());
            }
        }
    }
}
