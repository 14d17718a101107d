//! Outward notification stream for UI or API layers.
//!
//! The queue emits [`QueueEvent`]s through an [`EventSink`]. The sink is
//! attachable after construction; until one is attached, dispatch is a no-op
//! by design and callers must re-invoke dispatch once attached.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;

use crate::classify::ErrorKind;
use crate::resolver::Verdict;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    JobAdded {
        job_id: String,
    },
    JobProgress {
        job_id: String,
        percent: f64,
        downloaded_bytes: u64,
        total_bytes: u64,
        speed: String,
        eta: String,
    },
    JobPaused {
        job_id: String,
    },
    JobCompleted {
        job_id: String,
        path: Option<PathBuf>,
        verdict: Verdict,
        message: String,
    },
    JobError {
        job_id: String,
        kind: ErrorKind,
        message: String,
    },
    JobDeleted {
        job_id: String,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> &str {
        match self {
            QueueEvent::JobAdded { job_id }
            | QueueEvent::JobProgress { job_id, .. }
            | QueueEvent::JobPaused { job_id }
            | QueueEvent::JobCompleted { job_id, .. }
            | QueueEvent::JobError { job_id, .. }
            | QueueEvent::JobDeleted { job_id } => job_id,
        }
    }
}

/// Destination for queue notifications. Implementations must tolerate being
/// called from multiple worker tasks.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: QueueEvent);
}

/// Broadcast-backed sink for library consumers; slow receivers lag rather
/// than block the queue.
pub struct BroadcastSink {
    tx: broadcast::Sender<QueueEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: QueueEvent) {
        // Send fails only when nobody is subscribed; that is fine.
        let _ = self.tx.send(event);
    }
}

/// Sink that logs events, used by the CLI.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, event: QueueEvent) {
        match &event {
            QueueEvent::JobProgress {
                job_id,
                percent,
                speed,
                eta,
                ..
            } => {
                tracing::debug!(job_id = %job_id, percent, speed = %speed, eta = %eta, "progress");
            }
            other => {
                tracing::info!(job_id = %other.job_id(), event = ?other, "queue event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        sink.emit(QueueEvent::JobAdded {
            job_id: "j1".into(),
        })
        .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), "j1");
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let sink = BroadcastSink::new(8);
        sink.emit(QueueEvent::JobDeleted {
            job_id: "gone".into(),
        })
        .await;
    }
}
