//! Lockstep - Frame-Locked State Replication for Clustered Renderers
//!
//! Runs one process of a rendering session: the authoring process, a render
//! node, or a standalone renderer. The `demo` command runs a whole cluster
//! in one process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lockstep::config::{LockstepConfig, NodeRole};
use lockstep::context::ExecutionContext;
use lockstep::network::{LocalHub, NetworkServer, PeerTable, CHANNEL_CAPACITY};
use lockstep::runtime::{AuthoringNode, JoinOptions, RenderNode, StandaloneNode};
use lockstep::scene::{CacheSweeper, FrameState, InitData, InputEvent};
use lockstep::error::{Error, Result};

/// Frames a cache entry may go unused before a sweep evicts it
const CACHE_MAX_AGE: u64 = 120;

/// Lockstep - Frame-Locked State Replication for Clustered Renderers
#[derive(Parser)]
#[command(name = "lockstep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "lockstep.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start this node in the role given by its configuration
    Start,

    /// Run an authoring process and render nodes in one process
    Demo {
        /// Render nodes to start
        #[arg(short, long, default_value_t = 2)]
        participants: usize,

        /// GPU contexts per render node
        #[arg(short = 'x', long, default_value_t = 2)]
        contexts: u32,

        /// Frames to run; the last one requests quit
        #[arg(short, long, default_value_t = 120)]
        frames: u64,

        /// Seed for the simulated input
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "lockstep.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Role (authoring, render, standalone)
        #[arg(long, default_value = "standalone")]
        role: NodeRole,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that read the configuration log the way it asks to
    let logging = match cli.command {
        Commands::Start => LockstepConfig::from_file(&cli.config).ok().map(|c| c.logging),
        _ => None,
    };
    let level = cli
        .log_level
        .clone()
        .or_else(|| logging.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = logging.map(|l| l.format).unwrap_or_else(|| "pretty".to_string());
    init_logging(&level, &format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Demo {
            participants,
            contexts,
            frames,
            seed,
        } => run_demo(participants, contexts, frames, seed).await,
        Commands::Init {
            output,
            node_id,
            role,
        } => run_init(output, node_id, role),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Render one view of the scene.
///
/// Shared by every topology: the node cache is swept by exactly one context
/// per sweep frame, and each context sweeps its own cache.
fn render_view<X>(ctx: &X, sweep_interval: u64) -> Result<f32>
where
    X: ExecutionContext<State = FrameState, NodeResources = CacheSweeper, ContextResources = CacheSweeper>,
{
    let frame = ctx.frame();
    let state = ctx.current_state();

    ctx.node_resources()
        .touch(&format!("lod-{}", state.camera.distance as u32), frame);
    ctx.context_resources()
        .touch(&format!("view-{}", (state.camera.yaw / 45.0) as u32), frame);

    if frame % sweep_interval == 0 {
        if let Some(evicted) = ctx.run_node_maintenance(|cache| cache.sweep(frame))? {
            if evicted > 0 {
                tracing::debug!("Frame {}: node sweep evicted {} entries", frame, evicted);
            }
        }
    }
    ctx.run_context_maintenance(|cache| cache.sweep(frame))?;

    Ok(state.camera.yaw)
}

/// Start the node in its configured role
async fn run_start(config_path: PathBuf) -> Result<()> {
    let config = match LockstepConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Starting {} node {}", config.node.role, config.node.id);

    match config.node.role {
        NodeRole::Authoring => run_authoring(config).await?,
        NodeRole::Render => run_render(config).await?,
        NodeRole::Standalone => run_standalone(config).await?,
    }

    tracing::info!("Lockstep shutdown complete");
    Ok(())
}

/// Serve render nodes over TCP and drive frames
async fn run_authoring(config: LockstepConfig) -> Result<()> {
    let table = PeerTable::new(config.node.id.clone());
    let (incoming_tx, inbox) = mpsc::channel(CHANNEL_CAPACITY);
    let server = Arc::new(NetworkServer::new(
        config.node.bind_address.clone(),
        Arc::clone(&table),
        incoming_tx,
        config.connect_timeout(),
    ));

    let listener = server.bind().await?;
    let serving = Arc::clone(&server);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = serving.serve(listener).await {
            tracing::error!("Network server error: {}", e);
        }
    });

    let mut node = AuthoringNode::start(
        table,
        inbox,
        InitData::new("teapot", config.render.contexts),
        FrameState::default(),
        &config.frame,
    )
    .await?;

    let mut interrupted = false;
    let expected = config.cluster.expected_participants;
    if expected > 0 {
        tracing::info!("Waiting for {} render nodes on {}", expected, config.advertise_address());
        tokio::select! {
            result = node.wait_for_participants(expected, Duration::from_secs(300)) => {
                match result {
                    Ok(joined) => tracing::info!("{} render nodes joined", joined),
                    Err(e) => {
                        tracing::error!("Render nodes did not join: {}", e);
                        interrupted = true;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                interrupted = true;
            }
        }
    }

    if !interrupted {
        tokio::select! {
            result = node.run(|_, state| state.advance()) => {
                match result {
                    Ok(frames) => tracing::info!("Session ran {} frames", frames),
                    Err(e) => tracing::error!("Frame loop error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
        }
    }

    node.shutdown("authoring process stopped").await?;
    let summary = node.participants().summary().await;
    tracing::info!(
        "Participants: {} total, {} active, {} disconnected",
        summary.total,
        summary.active,
        summary.disconnected
    );

    server.stop();
    if let Err(e) = server_handle.await {
        tracing::warn!("Network server task failed: {}", e);
    }
    Ok(())
}

/// Join the session over TCP and render until it ends
async fn run_render(config: LockstepConfig) -> Result<()> {
    let contexts = (0..config.render.contexts)
        .map(|_| CacheSweeper::new(CACHE_MAX_AGE))
        .collect();
    let mut node: RenderNode<InitData, FrameState, CacheSweeper, CacheSweeper> =
        RenderNode::join_tcp(&config, CacheSweeper::new(CACHE_MAX_AGE), contexts).await?;
    tracing::info!("Opened \"{}\" on {} contexts", node.init().window_title, node.contexts());

    let sweep_interval = config.render.sweep_interval_frames;
    loop {
        let next = tokio::select! {
            next = node.next_frame() => Some(next?),
            _ = tokio::signal::ctrl_c() => None,
        };

        match next {
            Some(Some(_)) => {
                tokio::task::block_in_place(|| {
                    node.render_frame(|ctx| render_view(ctx, sweep_interval))
                })?
                .into_iter()
                .collect::<Result<Vec<_>>>()?;
                node.complete_frame().await?;
            }
            Some(None) => break,
            None => {
                tracing::info!("Received shutdown signal");
                node.leave().await?;
                break;
            }
        }
    }

    tracing::info!(
        "Render node {} finished; node cache swept {} times",
        node.node_id(),
        node.node_resources().sweeps()
    );
    Ok(())
}

/// Render locally with no cluster
async fn run_standalone(config: LockstepConfig) -> Result<()> {
    let mut node = StandaloneNode::new(
        FrameState::default(),
        CacheSweeper::new(CACHE_MAX_AGE),
        CacheSweeper::new(CACHE_MAX_AGE),
    );
    let max_frames = config.frame.max_frames;
    let interval = config.frame.frame_interval();
    let sweep_interval = config.render.sweep_interval_frames;

    {
        let frames = async {
            while !node.is_finished() && (max_frames == 0 || node.next_frame() < max_frames) {
                node.run_frame(FrameState::advance, |ctx| render_view(ctx, sweep_interval))?;
                if let Some(interval) = interval {
                    tokio::time::sleep(interval).await;
                }
            }
            Ok::<_, Error>(())
        };

        tokio::select! {
            result = frames => result?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
        }
    }

    tracing::info!(
        "Rendered {} frames; cache swept {} times",
        node.next_frame(),
        node.node_resources().sweeps()
    );
    Ok(())
}

/// Run an in-process cluster with simulated input
async fn run_demo(participants: usize, contexts: u32, frames: u64, seed: u64) -> Result<()> {
    if frames == 0 {
        return Err(Error::Config("demo needs at least one frame".into()));
    }

    let hub = LocalHub::new();
    let (transport, inbox) = hub.connect("authoring").await;

    let mut frame_config = LockstepConfig::new("authoring", NodeRole::Authoring).frame;
    frame_config.target_fps = 0;
    let mut author = AuthoringNode::start(
        transport,
        inbox,
        InitData::new("teapot", contexts),
        FrameState::default(),
        &frame_config,
    )
    .await?;

    let mut renderers = Vec::with_capacity(participants);
    for i in 0..participants {
        let hub = Arc::clone(&hub);
        let node_id = format!("render-{}", i + 1);
        renderers.push(tokio::spawn(async move {
            let caches = (0..contexts).map(|_| CacheSweeper::new(CACHE_MAX_AGE)).collect();
            let mut node: RenderNode<InitData, FrameState, CacheSweeper, CacheSweeper> =
                RenderNode::join_local(
                    &hub,
                    &node_id,
                    "authoring",
                    JoinOptions::default(),
                    CacheSweeper::new(CACHE_MAX_AGE),
                    caches,
                )
                .await?;

            let mut rendered = 0u64;
            while node.next_frame().await?.is_some() {
                let views = tokio::task::block_in_place(|| node.render_frame(|ctx| render_view(ctx, 1)))?;
                for view in views {
                    view?;
                }
                node.complete_frame().await?;
                rendered += 1;
            }
            Ok::<_, Error>((node_id, rendered, node.node_resources().sweeps()))
        }));
    }

    if let Err(e) = author
        .wait_for_participants(participants, Duration::from_secs(10))
        .await
    {
        // Release the render nodes that did join
        if let Err(shutdown_error) = author.shutdown(&e.to_string()).await {
            tracing::warn!("Shutdown failed: {}", shutdown_error);
        }
        return Err(e);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let last = frames - 1;
    // A failed frame has already ended the session
    let run = author
        .run(|frame, state| {
            state.advance();
            if frame == last {
                state.apply_input(&InputEvent::KeyPress('q'));
            } else if rng.gen_bool(0.2) {
                state.apply_input(&InputEvent::PointerDrag {
                    dx: rng.gen_range(-20.0..20.0),
                    dy: rng.gen_range(-5.0..5.0),
                });
            }
        })
        .await?;

    println!("Lockstep Demo");
    println!("=============");
    println!();
    println!("Frames run:       {}", run);
    println!("Final yaw:        {:.1}", author.state().camera.yaw);
    println!();
    for handle in renderers {
        let joined = handle
            .await
            .map_err(|e| Error::Internal(format!("render task failed: {}", e)))?;
        match joined {
            Ok((node_id, rendered, sweeps)) => {
                println!("{:<16}  {} frames, {} node sweeps", node_id, rendered, sweeps);
            }
            Err(e) => println!("render node failed: {}", e),
        }
    }

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String, role: NodeRole) -> Result<()> {
    let authoring = match role {
        NodeRole::Render => "authoring_address = \"127.0.0.1:7700\"",
        _ => "# authoring_address = \"10.0.0.1:7700\"",
    };

    let config_content = format!(r#"# Lockstep Configuration
# Generated configuration file

[node]
id = "{node_id}"
role = "{role}"
bind_address = "0.0.0.0:7700"
# advertise_address = "my-public-ip:7700"

[cluster]
{authoring}
expected_participants = 0
connect_timeout_ms = 5000
join_retry_ms = 250
join_attempts = 20

[frame]
max_frames = 0
target_fps = 60
barrier_timeout_ms = 2000
sync_timeout_ms = 2000

[maintenance]
owner_timeout_ms = 0

[render]
contexts = 1
sweep_interval_frames = 1

[logging]
level = "info"
format = "pretty"
"#);

    // Never write a file we could not load back
    LockstepConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the node and its session.");
    println!("Then start with: lockstep start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match LockstepConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Role: {}", config.node.role);
            println!("  Bind Address: {}", config.node.bind_address);
            if let Some(address) = &config.cluster.authoring_address {
                println!("  Authoring: {}", address);
            }
            println!("  Contexts: {}", config.render.contexts);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = LockstepConfig::from_file(&config_path)?;

    println!("Lockstep Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Role:             {}", config.node.role);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Frame Timing:");
    println!("  Target FPS:     {}", config.frame.target_fps);
    println!("  Barrier:        {}", describe(config.frame.barrier_timeout()));
    println!("  Synchronize:    {}", describe(config.frame.sync_timeout()));
    println!("  Owner Wait:     {}", describe(config.maintenance.owner_timeout()));
    println!();
    println!("Effective configuration:");
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| Error::Internal(e.to_string()))?;
    println!("{}", json);

    Ok(())
}

fn describe(limit: Option<Duration>) -> String {
    match limit {
        Some(limit) => format!("{} ms", limit.as_millis()),
        None => "unbounded".to_string(),
    }
}
