//! Render Node
//!
//! A process that mirrors the session state and renders every frame on
//! each of its GPU contexts. Each context renders on its own thread; all of
//! them share the node's maintenance election.

use std::sync::Arc;
use std::time::Duration;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::pump;
use crate::config::LockstepConfig;
use crate::context::ClusterContext;
use crate::error::{Error, Result};
use crate::frame::{FrameParticipant, FrameToken};
use crate::id::{ObjectId, Version};
use crate::network::{Delivery, LocalHub, NetworkClient, PeerTable, Transport, CHANNEL_CAPACITY};
use crate::replication::{Message, Mirror, ReplicationDirectory, SessionInfo};
use crate::state::MaintenanceElection;

/// How a render node joins and paces itself
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// How long to wait for `Welcome`
    pub welcome_timeout: Duration,
    /// Attempts to map each session object
    pub join_attempts: u32,
    /// Delay between those attempts
    pub join_retry: Duration,
    /// Bound on each frame's synchronize
    pub sync_timeout: Option<Duration>,
    /// Bound on maintenance waits
    pub owner_timeout: Option<Duration>,
}

impl JoinOptions {
    pub fn from_config(config: &LockstepConfig) -> Self {
        Self {
            welcome_timeout: config.connect_timeout(),
            join_attempts: config.cluster.join_attempts,
            join_retry: config.join_retry(),
            sync_timeout: config.frame.sync_timeout(),
            owner_timeout: config.maintenance.owner_timeout(),
        }
    }
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            welcome_timeout: Duration::from_secs(5),
            join_attempts: 20,
            join_retry: Duration::from_millis(50),
            sync_timeout: Some(Duration::from_secs(2)),
            owner_timeout: None,
        }
    }
}

/// Map a mirror, retrying while the object is not known here yet
pub async fn mirror_with_retry<T: DeserializeOwned>(
    directory: &ReplicationDirectory,
    id: ObjectId,
    attempts: u32,
    delay: Duration,
) -> Result<Mirror<T>> {
    let mut attempt = 1;
    loop {
        match directory.mirror(id).await {
            Ok(mirror) => return Ok(mirror),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::debug!("Mirror of {} not ready (attempt {}/{}): {}", id, attempt, attempts, e);
                attempt += 1;
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Render process of a session
pub struct RenderNode<I, S, N = (), C = ()> {
    node_id: String,
    directory: Arc<ReplicationDirectory>,
    session: SessionInfo,
    init: Mirror<I>,
    participant: FrameParticipant<S>,
    election: MaintenanceElection,
    node_resources: N,
    context_resources: Vec<C>,
    pump: JoinHandle<()>,
}

impl<I, S, N, C> RenderNode<I, S, N, C>
where
    I: DeserializeOwned,
    S: DeserializeOwned,
{
    /// Join a session over an in-process hub
    pub async fn join_local(
        hub: &Arc<LocalHub>,
        node_id: &str,
        authoring_id: &str,
        options: JoinOptions,
        node_resources: N,
        context_resources: Vec<C>,
    ) -> Result<Self> {
        let (transport, inbox) = hub.connect(node_id).await;
        transport
            .send_to(authoring_id, &Message::Hello {
                node_id: node_id.to_string(),
                contexts: context_resources.len() as u32,
            })
            .await?;
        Self::attach(transport, inbox, options, node_resources, context_resources).await
    }

    /// Join a session over TCP as configured
    pub async fn join_tcp(
        config: &LockstepConfig,
        node_resources: N,
        context_resources: Vec<C>,
    ) -> Result<Self> {
        let address = config
            .cluster
            .authoring_address
            .as_deref()
            .ok_or_else(|| Error::Config("cluster.authoring_address is not set".into()))?;

        let table = PeerTable::new(config.node.id.clone());
        let (incoming_tx, inbox) = mpsc::channel(CHANNEL_CAPACITY);
        let client = NetworkClient::new(
            config.node.id.clone(),
            context_resources.len() as u32,
            config.connect_timeout(),
            config.join_retry(),
            config.cluster.join_attempts,
        );
        client.join(address, Arc::clone(&table), incoming_tx).await?;

        Self::attach(
            table,
            inbox,
            JoinOptions::from_config(config),
            node_resources,
            context_resources,
        )
        .await
    }

    /// Finish joining once `Hello` went out: wait for `Welcome`, start the
    /// pump and map the session objects
    pub async fn attach(
        transport: Arc<dyn Transport>,
        mut inbox: mpsc::Receiver<Delivery>,
        options: JoinOptions,
        node_resources: N,
        context_resources: Vec<C>,
    ) -> Result<Self> {
        if context_resources.is_empty() {
            return Err(Error::Config("a render node needs at least one context".into()));
        }

        let node_id = transport.local_id().to_string();
        let directory = Arc::new(ReplicationDirectory::new(Arc::clone(&transport)));
        let (authoring_id, session) =
            pump::await_welcome(&mut inbox, &directory, options.welcome_timeout).await?;

        let (signals_tx, signals_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump::run_render_pump(
            inbox,
            Arc::clone(&directory),
            authoring_id.clone(),
            signals_tx,
        ));

        let mapped = async {
            let init = mirror_with_retry(
                &directory,
                session.init_id,
                options.join_attempts,
                options.join_retry,
            )
            .await?;
            let frame_state = mirror_with_retry(
                &directory,
                session.frame_state_id,
                options.join_attempts,
                options.join_retry,
            )
            .await?;
            Ok::<_, Error>((init, frame_state))
        }
        .await;

        let (init, frame_state) = match mapped {
            Ok(mirrors) => mirrors,
            Err(e) => {
                pump.abort();
                return Err(e);
            }
        };

        let participant = FrameParticipant::new(
            transport,
            authoring_id.clone(),
            frame_state,
            signals_rx,
            session.next_frame,
            options.sync_timeout,
        );

        tracing::info!(
            "Render node {} joined {} at frame {} with {} contexts",
            node_id,
            authoring_id,
            session.next_frame,
            context_resources.len()
        );

        Ok(Self {
            node_id,
            directory,
            session,
            init,
            participant,
            election: MaintenanceElection::new(options.owner_timeout),
            node_resources,
            context_resources,
            pump,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn session(&self) -> SessionInfo {
        self.session
    }

    pub fn directory(&self) -> &Arc<ReplicationDirectory> {
        &self.directory
    }

    pub fn init(&self) -> &I {
        self.init.get()
    }

    /// Frame state of the current frame
    pub fn state(&self) -> &S {
        self.participant.state()
    }

    pub fn state_version(&self) -> Version {
        self.participant.mirror().version()
    }

    pub fn current(&self) -> Option<FrameToken> {
        self.participant.current()
    }

    pub fn election(&self) -> &MaintenanceElection {
        &self.election
    }

    pub fn node_resources(&self) -> &N {
        &self.node_resources
    }

    pub fn contexts(&self) -> u32 {
        self.context_resources.len() as u32
    }

    /// Wait for the next frame; `None` once the session is over
    pub async fn next_frame(&mut self) -> Result<Option<FrameToken>> {
        let token = self.participant.next_frame().await?;
        if let Some(token) = token {
            self.election.begin_epoch(token.frame);
        }
        Ok(token)
    }

    /// Synchronize the frame-state mirror to `version` outside the frame loop
    pub async fn synchronize(&mut self, version: Version) -> Result<Version> {
        self.participant.synchronize(version).await
    }

    /// Render the current frame on every context, one thread per context.
    ///
    /// Returns each context's output in context order.
    pub fn render_frame<R, F>(&self, render: F) -> Result<Vec<R>>
    where
        F: Fn(&ClusterContext<'_, S, N, C>) -> R + Sync,
        R: Send,
        S: Sync,
        N: Sync,
        C: Sync,
    {
        let token = self
            .participant
            .current()
            .ok_or_else(|| Error::Internal("no frame in progress".into()))?;
        let state = self.participant.state();
        let node_id = self.node_id.as_str();
        let election = &self.election;
        let node_resources = &self.node_resources;
        let render = &render;

        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .context_resources
                .iter()
                .enumerate()
                .map(|(index, resources)| {
                    scope.spawn(move || {
                        let ctx = ClusterContext::new(
                            node_id,
                            index as u32,
                            token,
                            state,
                            election,
                            node_resources,
                            resources,
                        );
                        render(&ctx)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| Error::Internal("render thread panicked".into()))
                })
                .collect()
        })
    }

    /// Acknowledge the current frame
    pub async fn complete_frame(&mut self) -> Result<FrameToken> {
        self.participant.complete().await
    }

    /// Leave the session voluntarily
    pub async fn leave(&mut self) -> Result<()> {
        self.participant.leave().await
    }
}

impl<I, S, N, C> Drop for RenderNode<I, S, N, C> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
