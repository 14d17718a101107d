//! Queue manager: pending FIFO, concurrency ceiling, per-job process
//! handles, and delayed requeue for automatic retries.
//!
//! The manager is an explicit service object owning all mutable queue state;
//! it is constructed once and cloned (cheap, `Arc` inside) into worker tasks.
//! The concurrency limit is re-read from the store on every dispatch cycle,
//! so a settings change applies on the next cycle and never preempts running
//! jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventSink, QueueEvent};
use crate::model::{Job, JobStatus};
use crate::observability::Metrics;
use crate::store::{JobStore, Result as StoreResult};
use crate::worker::{self, RunOutcome, WorkerContext};

/// Automatic-retry budget and backoff schedule. The schedule is indexed by
/// the retry number (1-based) and clamps to its last entry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_auto_retries: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_auto_retries: 3,
            backoff: vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry_number: u32) -> Duration {
        let index = (retry_number.max(1) as usize - 1).min(self.backoff.len().saturating_sub(1));
        self.backoff
            .get(index)
            .copied()
            .unwrap_or(Duration::from_secs(2))
    }
}

/// Cancellation handle for one running job's process. Owned by the manager's
/// active map; invalidated (removed) when the job is paused or finishes.
struct JobHandle {
    cancel: CancellationToken,
}

struct Inner {
    store: JobStore,
    metrics: Arc<Metrics>,
    policy: RetryPolicy,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    pending: Mutex<VecDeque<String>>,
    active: Mutex<HashMap<String, JobHandle>>,
    /// Scheduled re-enqueue timers, abortable so a job deleted mid-backoff
    /// stays deleted.
    backoffs: Mutex<HashMap<String, AbortHandle>>,
}

#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    pub fn new(store: JobStore, metrics: Arc<Metrics>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                metrics,
                policy,
                sink: RwLock::new(None),
                pending: Mutex::new(VecDeque::new()),
                active: Mutex::new(HashMap::new()),
                backoffs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Attach the notification sink. Dispatch is a no-op until one is
    /// attached; callers should invoke [`dispatch`](Self::dispatch) after.
    pub async fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        *self.inner.sink.write().await = Some(sink);
    }

    async fn emit(&self, event: QueueEvent) {
        if let Some(sink) = self.inner.sink.read().await.as_ref() {
            sink.emit(event).await;
        }
    }

    /// Persist a new job and queue it for dispatch.
    pub async fn enqueue(&self, job: Job) -> StoreResult<String> {
        let id = job.id.clone();
        self.inner.store.upsert(&job).await?;
        self.inner.pending.lock().await.push_back(id.clone());
        self.inner.metrics.job_enqueued();
        info!(job_id = %id, url = %job.source_url, "Job enqueued");
        self.emit(QueueEvent::JobAdded { job_id: id.clone() }).await;
        self.dispatch().await;
        Ok(id)
    }

    /// Hand pending jobs to workers while concurrency slots are free.
    ///
    /// Boxed because finished worker tasks re-invoke dispatch, which would
    /// otherwise make the future type recursive.
    pub fn dispatch(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let sink = match self.inner.sink.read().await.as_ref() {
                Some(sink) => sink.clone(),
                None => {
                    // Documented no-op: nothing can observe job outcomes yet.
                    // Re-invoke dispatch once a sink is attached.
                    debug!("Dispatch skipped, no sink attached");
                    return;
                }
            };

            loop {
                let settings = match self.inner.store.settings() {
                    Ok(settings) => settings,
                    Err(err) => {
                        warn!(error = %err, "Cannot read settings, dispatch aborted");
                        return;
                    }
                };

                let candidate = {
                    let active = self.inner.active.lock().await;
                    if active.len() >= settings.concurrency_limit {
                        return;
                    }
                    let mut pending = self.inner.pending.lock().await;
                    match pending.pop_front() {
                        Some(id) => id,
                        None => return,
                    }
                };

                // A pending entry can go stale (paused or deleted while
                // queued).
                match self.inner.store.get(&candidate) {
                    Ok(Some(job)) if job.status == JobStatus::Queued => {}
                    _ => {
                        debug!(job_id = %candidate, "Skipping stale pending entry");
                        continue;
                    }
                }

                let cancel = CancellationToken::new();
                self.inner.active.lock().await.insert(
                    candidate.clone(),
                    JobHandle {
                        cancel: cancel.clone(),
                    },
                );

                let ctx = WorkerContext {
                    store: self.inner.store.clone(),
                    sink: sink.clone(),
                    settings,
                    cancel,
                    policy: self.inner.policy.clone(),
                };
                let manager = self.clone();
                let job_id = candidate;
                tokio::spawn(async move {
                    let outcome = worker::run_job(&ctx, &job_id).await;
                    manager.inner.active.lock().await.remove(&job_id);
                    match outcome {
                        RunOutcome::Completed => manager.inner.metrics.job_completed(),
                        RunOutcome::Failed => manager.inner.metrics.job_failed(),
                        RunOutcome::Paused => {}
                        RunOutcome::Retry { delay } => {
                            manager.inner.metrics.retry_scheduled();
                            manager.schedule_requeue(job_id.clone(), delay).await;
                        }
                    }
                    manager.dispatch().await;
                });
            }
        })
    }

    /// Delayed requeue with a cancellable handle.
    async fn schedule_requeue(&self, job_id: String, delay: Duration) {
        let manager = self.clone();
        let id = job_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.inner.backoffs.lock().await.remove(&id);
            // The job may have been paused or deleted during the backoff.
            match manager.inner.store.get(&id) {
                Ok(Some(job)) if job.status == JobStatus::Queued => {
                    manager.inner.pending.lock().await.push_back(id.clone());
                    manager.dispatch().await;
                }
                _ => debug!(job_id = %id, "Dropping backoff requeue for inactive job"),
            }
        });
        self.inner
            .backoffs
            .lock()
            .await
            .insert(job_id, task.abort_handle());
    }

    async fn cancel_backoff(&self, job_id: &str) {
        if let Some(handle) = self.inner.backoffs.lock().await.remove(job_id) {
            handle.abort();
        }
    }

    /// Forcefully stop one job. The persisted Paused status lands before the
    /// kill so the worker's exit guard sees the pause was intentional.
    pub async fn pause(&self, job_id: &str) -> StoreResult<()> {
        self.cancel_backoff(job_id).await;
        self.inner.pending.lock().await.retain(|id| id != job_id);

        let Some(job) = self.inner.store.get(job_id)? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        self.inner
            .store
            .update(job_id, |j| j.status = JobStatus::Paused)
            .await?;

        if let Some(handle) = self.inner.active.lock().await.remove(job_id) {
            handle.cancel.cancel();
        }
        info!(job_id = %job_id, "Job paused");
        self.emit(QueueEvent::JobPaused {
            job_id: job_id.to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn resume(&self, job_id: &str) -> StoreResult<()> {
        let Some(job) = self.inner.store.get(job_id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Paused {
            return Ok(());
        }
        self.inner
            .store
            .update(job_id, |j| j.status = JobStatus::Queued)
            .await?;
        self.inner
            .pending
            .lock()
            .await
            .push_back(job_id.to_string());
        self.dispatch().await;
        Ok(())
    }

    /// Explicit user retry of a terminally failed job: clears the error log
    /// and retry budget, then requeues from scratch.
    pub async fn retry(&self, job_id: &str) -> StoreResult<()> {
        let Some(job) = self.inner.store.get(job_id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Error {
            warn!(job_id = %job_id, status = ?job.status, "Retry ignored for non-failed job");
            return Ok(());
        }
        self.inner
            .store
            .update(job_id, |j| {
                j.status = JobStatus::Queued;
                j.retry_count = 0;
                j.error_log.clear();
                j.reset_progress();
            })
            .await?;
        self.inner
            .pending
            .lock()
            .await
            .push_back(job_id.to_string());
        info!(job_id = %job_id, "Job retried by user");
        self.dispatch().await;
        Ok(())
    }

    /// Stop everything: abort backoff timers, park pending jobs, and kill
    /// every active process. Jobs already mid-termination are not requeued.
    /// A store error on one job never leaves the rest of the fleet running.
    pub async fn pause_all(&self) -> StoreResult<()> {
        let backoff_ids: Vec<String> = self.inner.backoffs.lock().await.keys().cloned().collect();
        for id in backoff_ids {
            self.cancel_backoff(&id).await;
            self.mark_paused(&id).await;
        }

        let pending: Vec<String> = self.inner.pending.lock().await.drain(..).collect();
        for id in pending {
            self.mark_paused(&id).await;
        }

        let handles: Vec<(String, JobHandle)> =
            self.inner.active.lock().await.drain().collect();
        for (id, handle) in handles {
            // Persist the pause before the kill; see pause().
            self.mark_paused(&id).await;
            handle.cancel.cancel();
        }
        info!("All jobs paused");
        Ok(())
    }

    async fn mark_paused(&self, job_id: &str) {
        match self
            .inner
            .store
            .update(job_id, |j| j.status = JobStatus::Paused)
            .await
        {
            Ok(_) => {
                self.emit(QueueEvent::JobPaused {
                    job_id: job_id.to_string(),
                })
                .await;
            }
            Err(err) => warn!(job_id = %job_id, error = %err, "Could not mark job paused"),
        }
    }

    /// Requeue every paused job, oldest first, and dispatch.
    pub async fn resume_all(&self) -> StoreResult<()> {
        let paused: Vec<String> = self
            .inner
            .store
            .list()?
            .into_iter()
            .filter(|job| job.status == JobStatus::Paused)
            .map(|job| job.id)
            .collect();

        for id in &paused {
            self.inner
                .store
                .update(id, |j| j.status = JobStatus::Queued)
                .await?;
        }
        self.inner.pending.lock().await.extend(paused);
        self.dispatch().await;
        Ok(())
    }

    /// Remove a job entirely. Kills its process and aborts any pending
    /// backoff so the job cannot resurrect itself.
    pub async fn delete(&self, job_id: &str) -> StoreResult<()> {
        self.cancel_backoff(job_id).await;
        self.inner.pending.lock().await.retain(|id| id != job_id);
        if let Some(handle) = self.inner.active.lock().await.remove(job_id) {
            handle.cancel.cancel();
        }
        self.inner.store.delete(job_id).await?;
        self.emit(QueueEvent::JobDeleted {
            job_id: job_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Put a job at the head of the pending queue; used by startup recovery
    /// so interrupted work runs before newly submitted jobs.
    pub async fn requeue_front(&self, job_id: &str) {
        self.inner
            .pending
            .lock()
            .await
            .push_front(job_id.to_string());
    }

    pub async fn active_count(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastSink;
    use tempfile::TempDir;

    fn manager() -> (QueueManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("store")).unwrap();
        let manager = QueueManager::new(store, Arc::new(Metrics::new()), RetryPolicy::default());
        (manager, dir)
    }

    #[test]
    fn backoff_schedule_is_indexed_and_clamped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        // Past the schedule, clamp to the last value.
        assert_eq!(policy.delay_for(9), Duration::from_secs(8));
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn dispatch_without_sink_is_a_noop() {
        let (manager, _dir) = manager();
        let job = Job::new("https://example.com/v/1", "One");
        manager.enqueue(job).await.unwrap();

        // Still pending: nothing can observe outcomes without a sink.
        assert_eq!(manager.pending_count().await, 1);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn pause_of_pending_job_removes_it_from_the_queue() {
        let (manager, _dir) = manager();
        let job = Job::new("https://example.com/v/1", "One");
        let id = manager.enqueue(job).await.unwrap();

        manager.pause(&id).await.unwrap();
        assert_eq!(manager.pending_count().await, 0);
        let stored = manager.store().get(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Paused);

        manager.resume(&id).await.unwrap();
        let stored = manager.store().get(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn user_retry_resets_error_state() {
        let (manager, _dir) = manager();
        let mut job = Job::new("https://example.com/v/1", "One");
        job.status = JobStatus::Error;
        job.retry_count = 3;
        job.push_error(crate::classify::ErrorKind::Network, "boom", "raw");
        let id = job.id.clone();
        manager.store().upsert(&job).await.unwrap();

        manager.retry(&id).await.unwrap();

        let stored = manager.store().get(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.error_log.is_empty());
        assert_eq!(manager.pending_count().await, 1);
    }

    #[tokio::test]
    async fn retry_is_ignored_for_non_failed_jobs() {
        let (manager, _dir) = manager();
        let job = Job::new("https://example.com/v/1", "One");
        let id = manager.enqueue(job).await.unwrap();

        manager.retry(&id).await.unwrap();
        let stored = manager.store().get(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        // Still exactly one pending entry.
        assert_eq!(manager.pending_count().await, 1);
    }

    #[tokio::test]
    async fn pause_all_continues_past_missing_records() {
        let (manager, _dir) = manager();
        let a = manager
            .enqueue(Job::new("https://example.com/v/1", "One"))
            .await
            .unwrap();
        let b = manager
            .enqueue(Job::new("https://example.com/v/2", "Two"))
            .await
            .unwrap();

        // Record gone while its id still sits in the pending queue.
        manager.store().delete(&a).await.unwrap();

        manager.pause_all().await.unwrap();
        let survivor = manager.store().get(&b).unwrap().unwrap();
        assert_eq!(survivor.status, JobStatus::Paused);
        assert_eq!(manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn delete_mid_backoff_does_not_resurrect() {
        let (manager, _dir) = manager();
        manager.attach_sink(Arc::new(BroadcastSink::new(16))).await;

        let mut job = Job::new("https://example.com/v/1", "One");
        job.status = JobStatus::Queued;
        let id = job.id.clone();
        manager.store().upsert(&job).await.unwrap();

        manager
            .schedule_requeue(id.clone(), Duration::from_millis(20))
            .await;
        manager.delete(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(manager.store().get(&id).unwrap().is_none());
        assert_eq!(manager.pending_count().await, 0);
    }
}
