//! Service assembly: open the store, seed settings on first run, recover
//! interrupted jobs, and wire the queue manager. All dependencies are
//! constructed here and passed down explicitly.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::EventSink;
use crate::model::JobStatus;
use crate::observability::Metrics;
use crate::queue::{QueueManager, RetryPolicy};
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct Service {
    pub config: Config,
    pub queue: QueueManager,
    pub metrics: Arc<Metrics>,
}

impl Service {
    /// Build the full service graph from configuration. No sink is attached
    /// yet; callers attach one and then dispatch.
    pub async fn start(config: Config) -> Result<Self, ServiceError> {
        let store = JobStore::open(&config.paths.store)?;

        if !store.has_settings()? {
            let seeded = config.defaults.seed_settings();
            store.set_settings(&seeded).await?;
            info!(
                concurrency = seeded.concurrency_limit,
                output_dir = %seeded.output_dir.display(),
                "Seeded settings from configuration defaults"
            );
        }

        let metrics = Arc::new(Metrics::new());
        let queue = QueueManager::new(store, metrics.clone(), RetryPolicy::default());
        let recovered = recover_interrupted(&queue).await?;
        if recovered > 0 {
            info!(count = recovered, "Requeued jobs interrupted by shutdown");
        }

        Ok(Self {
            config,
            queue,
            metrics,
        })
    }

    /// Attach the sink and start dispatching recovered/pending work.
    pub async fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        self.queue.attach_sink(sink).await;
        self.queue.dispatch().await;
    }

    /// Flush the store before exit. Failure is logged, not fatal.
    pub fn shutdown(&self) {
        if let Err(err) = self.queue.store().persist() {
            warn!(error = %err, "Store flush on shutdown failed");
        }
    }
}

/// Jobs left in `Downloading` by a crash or kill have no process behind them
/// anymore; put them back at the front of the line.
async fn recover_interrupted(queue: &QueueManager) -> Result<usize, StoreError> {
    let interrupted: Vec<String> = queue
        .store()
        .list()?
        .into_iter()
        .filter(|job| job.status == JobStatus::Downloading)
        .map(|job| job.id)
        .collect();

    for id in &interrupted {
        queue
            .store()
            .update(id, |job| {
                job.status = JobStatus::Queued;
                job.reset_progress();
            })
            .await?;
        queue.requeue_front(id).await;
    }
    Ok(interrupted.len())
}
