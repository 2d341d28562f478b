//! Lockstep Configuration
//!
//! This module provides configuration structures for a lockstep rendering
//! node: its role in the session, how it reaches the authoring process, and
//! the timing of frames, barriers and maintenance waits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main Lockstep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Frame loop configuration
    #[serde(default)]
    pub frame: FrameConfig,

    /// Maintenance election configuration
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Render node configuration
    #[serde(default)]
    pub render: RenderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Role a process plays in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Holds the authoritative state and drives frames
    Authoring,
    /// Mirrors state and renders
    Render,
    /// Single process, no replication
    #[default]
    Standalone,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Authoring => write!(f, "authoring"),
            NodeRole::Render => write!(f, "render"),
            NodeRole::Standalone => write!(f, "standalone"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "authoring" => Ok(NodeRole::Authoring),
            "render" => Ok(NodeRole::Render),
            "standalone" => Ok(NodeRole::Standalone),
            other => Err(crate::Error::Config(format!("unknown node role: {}", other))),
        }
    }
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Role in the session
    #[serde(default)]
    pub role: NodeRole,

    /// Address to bind for cluster communication
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address of the authoring process (render nodes only)
    #[serde(default)]
    pub authoring_address: Option<String>,

    /// Render nodes the authoring side waits for before frame 0
    #[serde(default)]
    pub expected_participants: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay between join attempts in milliseconds
    #[serde(default = "default_join_retry_ms")]
    pub join_retry_ms: u64,

    /// Maximum join attempts before giving up
    #[serde(default = "default_join_attempts")]
    pub join_attempts: u32,
}

/// Frame loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Stop after this many frames (0 = until quit is requested)
    #[serde(default)]
    pub max_frames: u64,

    /// Target frame rate on the authoring side (0 = as fast as possible)
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Barrier timeout in milliseconds (0 = wait for ack or disconnect)
    #[serde(default = "default_barrier_timeout_ms")]
    pub barrier_timeout_ms: u64,

    /// Mirror synchronize timeout in milliseconds (0 = unbounded)
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

/// Maintenance election configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MaintenanceConfig {
    /// How long followers spin for an owner in milliseconds (0 = forever)
    #[serde(default)]
    pub owner_timeout_ms: u64,
}

/// Render node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// GPU contexts hosted by this node
    #[serde(default = "default_contexts")]
    pub contexts: u32,

    /// Run the node cache sweep every N frames
    #[serde(default = "default_sweep_interval_frames")]
    pub sweep_interval_frames: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:7700".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_join_retry_ms() -> u64 {
    250
}

fn default_join_attempts() -> u32 {
    20
}

fn default_target_fps() -> u32 {
    60
}

fn default_barrier_timeout_ms() -> u64 {
    2000
}

fn default_sync_timeout_ms() -> u64 {
    2000
}

fn default_contexts() -> u32 {
    1
}

fn default_sweep_interval_frames() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            authoring_address: None,
            expected_participants: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            join_retry_ms: default_join_retry_ms(),
            join_attempts: default_join_attempts(),
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frames: 0,
            target_fps: default_target_fps(),
            barrier_timeout_ms: default_barrier_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            contexts: default_contexts(),
            sweep_interval_frames: default_sweep_interval_frames(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl FrameConfig {
    /// Barrier timeout, `None` when unbounded
    pub fn barrier_timeout(&self) -> Option<Duration> {
        millis(self.barrier_timeout_ms)
    }

    /// Synchronize timeout, `None` when unbounded
    pub fn sync_timeout(&self) -> Option<Duration> {
        millis(self.sync_timeout_ms)
    }

    /// Minimum frame duration for the target frame rate
    pub fn frame_interval(&self) -> Option<Duration> {
        (self.target_fps > 0).then(|| Duration::from_secs_f64(1.0 / self.target_fps as f64))
    }
}

impl MaintenanceConfig {
    /// Follower spin deadline, `None` when unbounded
    pub fn owner_timeout(&self) -> Option<Duration> {
        millis(self.owner_timeout_ms)
    }
}

impl LockstepConfig {
    /// Minimal configuration for a node with the given id and role
    pub fn new(id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            node: NodeConfig {
                id: id.into(),
                role,
                bind_address: default_bind_address(),
                advertise_address: None,
            },
            cluster: ClusterConfig::default(),
            frame: FrameConfig::default(),
            maintenance: MaintenanceConfig::default(),
            render: RenderConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: LockstepConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.node.role == NodeRole::Render && self.cluster.authoring_address.is_none() {
            return Err(crate::Error::Config(
                "cluster.authoring_address is required for render nodes".into(),
            ));
        }

        if self.render.contexts == 0 {
            return Err(crate::Error::Config("render.contexts must be at least 1".into()));
        }

        if self.render.sweep_interval_frames == 0 {
            return Err(crate::Error::Config(
                "render.sweep_interval_frames must be at least 1".into(),
            ));
        }

        if self.cluster.join_attempts == 0 {
            return Err(crate::Error::Config("cluster.join_attempts must be at least 1".into()));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be pretty or compact, got {}",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Get join retry delay as Duration
    pub fn join_retry(&self) -> Duration {
        Duration::from_millis(self.cluster.join_retry_ms)
    }
}
