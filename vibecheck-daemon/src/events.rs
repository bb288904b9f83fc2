//! Per-analysis live event fan-out.
//!
//! Each analysis id maps to the set of subscribers currently listening to
//! it. Every subscriber owns a bounded FIFO queue, so events of one analysis
//! reach each subscriber in publish order. Publishing never waits: a
//! subscriber whose queue is full or closed is dropped from the set. Lost
//! events are not replayed.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use vibecheck_core::{Finding, FindingsSummary, GraphEdge, GraphNode, HealthScore, ToolCallStatus};

/// Default per-subscriber queue length.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Progress state carried by a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Running,
    Complete,
}

/// Events streamed to observers of one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AnalysisEvent {
    Status {
        agent: String,
        status: StageState,
        /// 0.0..=1.0 within the agent's own stage.
        progress: f64,
        message: String,
    },
    Finding {
        finding: Finding,
    },
    GraphNode {
        node: GraphNode,
    },
    GraphEdge {
        edge: GraphEdge,
    },
    ToolActivity {
        tool: String,
        step: String,
        status: ToolCallStatus,
        message: String,
    },
    Complete {
        health_score: HealthScore,
        findings_summary: FindingsSummary,
        /// Whole seconds.
        duration: u64,
    },
    Error {
        agent: String,
        message: String,
        recoverable: bool,
    },
}

impl AnalysisEvent {
    pub fn status(agent: &str, status: StageState, progress: f64, message: impl Into<String>) -> Self {
        AnalysisEvent::Status {
            agent: agent.to_string(),
            status,
            progress,
            message: message.into(),
        }
    }

    /// Wire tag of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisEvent::Status { .. } => "status",
            AnalysisEvent::Finding { .. } => "finding",
            AnalysisEvent::GraphNode { .. } => "graph_node",
            AnalysisEvent::GraphEdge { .. } => "graph_edge",
            AnalysisEvent::ToolActivity { .. } => "tool_activity",
            AnalysisEvent::Complete { .. } => "complete",
            AnalysisEvent::Error { .. } => "error",
        }
    }
}

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Arc<AnalysisEvent>>,
}

/// Receiving half handed to an observer.
pub struct Subscription {
    analysis_id: String,
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<AnalysisEvent>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn analysis_id(&self) -> &str {
        &self.analysis_id
    }

    /// Next event, or `None` once the subscriber has been dropped from the set.
    pub async fn recv(&mut self) -> Option<Arc<AnalysisEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<AnalysisEvent>> {
        self.rx.try_recv().ok()
    }
}

/// Concurrent map of analysis id to live subscribers.
///
/// Locking is per map shard, so publishers of different analyses rarely
/// contend.
pub struct Broadcaster {
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, analysis_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(analysis_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!("Subscriber {} joined analysis {}", id, analysis_id);
        Subscription {
            analysis_id: analysis_id.to_string(),
            id,
            rx,
        }
    }

    /// Remove one subscriber; the analysis entry goes away with its last one.
    pub fn unsubscribe(&self, analysis_id: &str, id: SubscriberId) {
        if let Some(mut subs) = self.subscribers.get_mut(analysis_id) {
            subs.retain(|s| s.id != id);
        }
        self.subscribers.remove_if(analysis_id, |_, subs| subs.is_empty());
    }

    /// Deliver `event` to every current subscriber of `analysis_id`.
    ///
    /// Returns the number of subscribers that accepted it.
    pub fn publish(&self, analysis_id: &str, event: AnalysisEvent) -> usize {
        let event = Arc::new(event);
        let delivered = match self.subscribers.get_mut(analysis_id) {
            Some(mut subs) => {
                subs.retain(|sub| match sub.tx.try_send(Arc::clone(&event)) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Dropping slow subscriber {} of analysis {} ({} event)",
                            sub.id,
                            analysis_id,
                            event.kind()
                        );
                        false
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Subscriber {} of analysis {} disconnected", sub.id, analysis_id);
                        false
                    }
                });
                subs.len()
            }
            None => 0,
        };
        if delivered == 0 {
            self.subscribers.remove_if(analysis_id, |_, subs| subs.is_empty());
        }
        delivered
    }

    pub fn subscriber_count(&self, analysis_id: &str) -> usize {
        self.subscribers
            .get(analysis_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Number of analyses with at least one subscriber.
    pub fn active_analyses(&self) -> usize {
        self.subscribers.len()
    }
}
