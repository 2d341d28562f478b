//! Participant Membership
//!
//! Tracks the render nodes taking part in the frame barrier: who joined,
//! who acknowledged which frame, and who dropped out.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Departed participants kept for status output; older ones are forgotten
pub const MAX_DEPARTED: usize = 64;

/// Participant status in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    /// Connected, not yet acknowledged a frame
    Joining,
    /// Acknowledging frames
    Active,
    /// Missed the last barrier deadline
    Lagging,
    /// Gone; excluded from all later barriers
    Disconnected,
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantStatus::Joining => write!(f, "JOINING"),
            ParticipantStatus::Active => write!(f, "ACTIVE"),
            ParticipantStatus::Lagging => write!(f, "LAGGING"),
            ParticipantStatus::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// State of a single participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantState {
    /// Unique node identifier
    pub id: String,
    /// GPU contexts hosted by the node
    pub contexts: u32,
    /// Current status
    pub status: ParticipantStatus,
    /// First frame the node is expected to acknowledge
    pub first_frame: u64,
    /// Highest frame acknowledged
    pub last_acked_frame: Option<u64>,
    /// When the node joined
    pub joined_at: chrono::DateTime<chrono::Utc>,
    /// Last time we heard from it (not serialized)
    #[serde(skip)]
    pub last_seen: Option<Instant>,
    /// When it was marked disconnected (not serialized)
    #[serde(skip)]
    pub departed_at: Option<Instant>,
}

impl ParticipantState {
    /// Create a new participant state
    pub fn new(id: String, contexts: u32, first_frame: u64) -> Self {
        Self {
            id,
            contexts,
            status: ParticipantStatus::Joining,
            first_frame,
            last_acked_frame: None,
            joined_at: chrono::Utc::now(),
            last_seen: Some(Instant::now()),
            departed_at: None,
        }
    }

    /// Whether the node still takes part in barriers
    pub fn is_connected(&self) -> bool {
        self.status != ParticipantStatus::Disconnected
    }

    /// Whether the barrier of `frame` waits for this node
    pub fn owes_ack(&self, frame: u64) -> bool {
        self.is_connected() && self.first_frame <= frame && !self.has_acked(frame)
    }

    /// Whether the node acknowledged `frame`
    pub fn has_acked(&self, frame: u64) -> bool {
        self.last_acked_frame.map(|f| f >= frame).unwrap_or(false)
    }

    /// Time since we last heard from the node
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_seen.map(|t| t.elapsed())
    }

    fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
    }
}

/// Set of render nodes taking part in the session
#[derive(Default)]
pub struct ParticipantSet {
    nodes: RwLock<HashMap<String, ParticipantState>>,
}

impl ParticipantSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or re-admit a participant, owing acks from `first_frame` on
    pub async fn join(&self, id: &str, contexts: u32, first_frame: u64) {
        let previous = self.nodes.write().await.insert(
            id.to_string(),
            ParticipantState::new(id.to_string(), contexts, first_frame),
        );

        match previous {
            Some(node) if node.is_connected() => {
                tracing::warn!("Participant {} rejoined while still connected", id)
            }
            _ => tracing::info!(
                "Participant {} joined with {} contexts at frame {}",
                id,
                contexts,
                first_frame
            ),
        }
    }

    /// Record a frame acknowledgment; returns false for unknown or dropped nodes
    pub async fn record_ack(&self, id: &str, frame: u64) -> bool {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(id) else {
            tracing::warn!("Ack for frame {} from unknown participant {}", frame, id);
            return false;
        };

        if !node.is_connected() {
            tracing::debug!("Ignoring ack from disconnected participant {}", id);
            return false;
        }

        // Acks never move backwards
        if !node.has_acked(frame) {
            node.last_acked_frame = Some(frame);
        }
        node.status = ParticipantStatus::Active;
        node.touch();
        true
    }

    /// Mark a participant gone; returns true if it was connected
    pub async fn disconnect(&self, id: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(id) {
            Some(node) if node.is_connected() => {
                node.status = ParticipantStatus::Disconnected;
                node.departed_at = Some(Instant::now());
                tracing::warn!("Participant {} disconnected", id);
            }
            _ => return false,
        }

        let mut departed: Vec<(Option<Instant>, String)> = nodes
            .values()
            .filter(|n| !n.is_connected())
            .map(|n| (n.departed_at, n.id.clone()))
            .collect();
        if departed.len() > MAX_DEPARTED {
            departed.sort();
            let excess = departed.len() - MAX_DEPARTED;
            for (_, stale) in departed.into_iter().take(excess) {
                nodes.remove(&stale);
                tracing::debug!("Forgot departed participant {}", stale);
            }
        }
        true
    }

    /// Mark participants that have not acked `frame` as lagging
    pub async fn mark_lagging(&self, frame: u64) -> Vec<String> {
        let mut nodes = self.nodes.write().await;
        let mut lagging = Vec::new();
        for node in nodes.values_mut() {
            if node.owes_ack(frame) {
                node.status = ParticipantStatus::Lagging;
                lagging.push(node.id.clone());
            }
        }
        lagging
    }

    /// Connected participants that still owe an ack for `frame`
    pub async fn pending(&self, frame: u64) -> Vec<String> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.owes_ack(frame))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Connected participants
    pub async fn connected(&self) -> Vec<ParticipantState> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.is_connected())
            .cloned()
            .collect()
    }

    /// Get a participant's state
    pub async fn get(&self, id: &str) -> Option<ParticipantState> {
        self.nodes.read().await.get(id).cloned()
    }

    /// Participants tracked, counting at most `MAX_DEPARTED` departed ones
    pub async fn size(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Get session summary
    pub async fn summary(&self) -> ParticipantSummary {
        let nodes = self.nodes.read().await;
        let mut summary = ParticipantSummary {
            total: nodes.len(),
            ..Default::default()
        };

        for node in nodes.values() {
            match node.status {
                ParticipantStatus::Joining => summary.joining += 1,
                ParticipantStatus::Active => summary.active += 1,
                ParticipantStatus::Lagging => summary.lagging += 1,
                ParticipantStatus::Disconnected => summary.disconnected += 1,
            }
            summary.contexts += node.contexts as usize;
        }

        summary
    }
}

/// Session summary information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub total: usize,
    pub joining: usize,
    pub active: usize,
    pub lagging: usize,
    pub disconnected: usize,
    pub contexts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_and_ack() {
        let set = ParticipantSet::new();
        set.join("render-1", 2, 0).await;
        set.join("render-2", 1, 0).await;

        assert_eq!(set.pending(0).await.len(), 2);
        assert!(set.record_ack("render-1", 0).await);

        assert_eq!(set.pending(0).await, vec!["render-2".to_string()]);
        let node = set.get("render-1").await.unwrap();
        assert_eq!(node.status, ParticipantStatus::Active);
        assert!(node.has_acked(0));
        assert!(!node.has_acked(1));
    }

    #[tokio::test]
    async fn test_disconnected_nodes_are_excluded() {
        let set = ParticipantSet::new();
        set.join("render-1", 1, 0).await;
        set.join("render-2", 1, 0).await;

        assert!(set.disconnect("render-2").await);
        assert!(!set.disconnect("render-2").await);
        assert!(!set.record_ack("render-2", 0).await);

        assert_eq!(set.pending(0).await, vec!["render-1".to_string()]);
        assert_eq!(set.connected().await.len(), 1);

        let summary = set.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.disconnected, 1);
    }

    #[tokio::test]
    async fn test_acks_never_regress() {
        let set = ParticipantSet::new();
        set.join("render-1", 1, 0).await;
        set.record_ack("render-1", 4).await;
        set.record_ack("render-1", 2).await;
        assert_eq!(set.get("render-1").await.unwrap().last_acked_frame, Some(4));
    }

    #[tokio::test]
    async fn test_rejoin_after_disconnect() {
        let set = ParticipantSet::new();
        set.join("render-1", 1, 0).await;
        set.disconnect("render-1").await;
        set.join("render-1", 3, 6).await;

        let node = set.get("render-1").await.unwrap();
        assert_eq!(node.status, ParticipantStatus::Joining);
        assert_eq!(node.contexts, 3);
        assert_eq!(node.first_frame, 6);
        assert_eq!(node.last_acked_frame, None);
    }

    #[tokio::test]
    async fn test_late_joiner_owes_only_later_frames() {
        let set = ParticipantSet::new();
        set.join("render-1", 1, 0).await;
        set.join("render-2", 1, 4).await;

        assert_eq!(set.pending(3).await, vec!["render-1".to_string()]);
        assert_eq!(set.pending(4).await.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_lagging() {
        let set = ParticipantSet::new();
        set.join("render-1", 1, 0).await;
        set.join("render-2", 1, 0).await;
        set.record_ack("render-1", 0).await;

        let lagging = set.mark_lagging(0).await;
        assert_eq!(lagging, vec!["render-2".to_string()]);
        assert_eq!(
            set.get("render-2").await.unwrap().status,
            ParticipantStatus::Lagging
        );
    }

    #[tokio::test]
    async fn test_departed_participants_are_capped() {
        let set = ParticipantSet::new();
        set.join("render-0", 1, 0).await;
        for i in 1..=MAX_DEPARTED + 10 {
            let id = format!("render-{}", i);
            set.join(&id, 1, 0).await;
            assert!(set.disconnect(&id).await);
        }

        assert_eq!(set.size().await, MAX_DEPARTED + 1);
        let summary = set.summary().await;
        assert_eq!(summary.disconnected, MAX_DEPARTED);
        assert_eq!(summary.joining, 1);

        // The oldest departures go first
        assert!(set.get("render-1").await.is_none());
        let newest = format!("render-{}", MAX_DEPARTED + 10);
        assert!(set.get(&newest).await.is_some());
        assert!(set.get("render-0").await.is_some());
    }
}
