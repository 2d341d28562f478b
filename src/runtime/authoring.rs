//! Authoring Node
//!
//! The process holding the authoritative session state. It publishes the
//! init data and the frame state, then drives frames through the sequencer
//! while a message pump feeds it joins, acks and disconnects.

use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pump;
use crate::config::FrameConfig;
use crate::error::Result;
use crate::frame::{BarrierReport, FrameData, FrameSequencer};
use crate::network::{Delivery, Transport, CHANNEL_CAPACITY};
use crate::replication::{Authoritative, ReplicationDirectory, SessionInfo};
use crate::state::ParticipantSet;

/// Authoring process of a session
pub struct AuthoringNode<I, S> {
    directory: Arc<ReplicationDirectory>,
    init: Authoritative<I>,
    sequencer: FrameSequencer<S>,
    pump: JoinHandle<()>,
    frame_interval: Option<Duration>,
    max_frames: u64,
}

impl<I: Serialize, S: Serialize + FrameData> AuthoringNode<I, S> {
    /// Publish the session objects and start routing inbound traffic
    pub async fn start(
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<Delivery>,
        init: I,
        state: S,
        config: &FrameConfig,
    ) -> Result<Self> {
        let directory = Arc::new(ReplicationDirectory::new(Arc::clone(&transport)));

        let mut init = Authoritative::new(init);
        let init_id = directory.publish(&mut init).await?;
        let mut state = Authoritative::new(state);
        directory.publish(&mut state).await?;

        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump::run_authoring_pump(inbox, events_tx));

        let sequencer = FrameSequencer::new(
            Arc::clone(&directory),
            Arc::clone(&transport),
            Arc::new(ParticipantSet::new()),
            state,
            init_id,
            events_rx,
            config.barrier_timeout(),
        )?;

        tracing::info!(
            "Authoring node {} started (init {}, frame state {})",
            transport.local_id(),
            init_id,
            sequencer.session().frame_state_id
        );

        Ok(Self {
            directory,
            init,
            sequencer,
            pump,
            frame_interval: config.frame_interval(),
            max_frames: config.max_frames,
        })
    }

    pub fn directory(&self) -> &Arc<ReplicationDirectory> {
        &self.directory
    }

    pub fn session(&self) -> SessionInfo {
        self.sequencer.session()
    }

    pub fn init(&self) -> &I {
        self.init.get()
    }

    pub fn state(&self) -> &S {
        self.sequencer.state()
    }

    pub fn participants(&self) -> &Arc<ParticipantSet> {
        self.sequencer.participants()
    }

    pub fn sequencer(&self) -> &FrameSequencer<S> {
        &self.sequencer
    }

    pub fn is_shut_down(&self) -> bool {
        self.sequencer.is_shut_down()
    }

    /// Wait until `count` render nodes have joined
    pub async fn wait_for_participants(&mut self, count: usize, wait: Duration) -> Result<usize> {
        self.sequencer.wait_for_participants(count, wait).await
    }

    /// Apply `mutate` to the frame state and run one frame to completion
    pub async fn run_frame(&mut self, mutate: impl FnOnce(&mut S)) -> Result<BarrierReport> {
        let result = self.sequencer.run_frame(mutate).await;
        if self.sequencer.is_shut_down() {
            // The sequencer withdrew every object, init data included
            self.init.mark_unpublished();
        }
        result
    }

    /// Run frames until quit is requested or the frame limit is reached,
    /// paced to the target frame rate. Returns the number of frames run.
    ///
    /// A failed frame ends the session before the error is returned.
    pub async fn run(&mut self, mut mutate: impl FnMut(u64, &mut S)) -> Result<u64> {
        let mut frames = 0;

        while !self.is_shut_down() {
            if self.max_frames > 0 && frames >= self.max_frames {
                self.shutdown("frame limit reached").await?;
                break;
            }

            let started = Instant::now();
            let frame = self.sequencer.next_frame();
            let report = match self.run_frame(|state| mutate(frame, state)).await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!("Frame {} failed: {}", frame, e);
                    if let Err(shutdown_error) = self.shutdown(&e.to_string()).await {
                        tracing::error!("Shutdown after failed frame also failed: {}", shutdown_error);
                    }
                    return Err(e);
                }
            };
            frames += 1;

            if !report.disconnected.is_empty() || !report.timed_out.is_empty() {
                tracing::warn!(
                    "Frame {}: lost {:?}, timed out {:?}",
                    report.frame,
                    report.disconnected,
                    report.timed_out
                );
            }

            if let Some(interval) = self.frame_interval {
                let spent = started.elapsed();
                if spent < interval && !report.final_frame {
                    tokio::time::sleep(interval - spent).await;
                }
            }
        }

        Ok(frames)
    }

    /// End the session: unpublish everything and release every render node
    pub async fn shutdown(&mut self, reason: &str) -> Result<()> {
        if self.is_shut_down() {
            return Ok(());
        }
        let init_withdrawn = if self.init.is_published() {
            self.directory.unpublish(&mut self.init).await
        } else {
            Ok(())
        };
        let released = self.sequencer.shutdown(reason).await;
        init_withdrawn.and(released)
    }
}

impl<I, S> Drop for AuthoringNode<I, S> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
