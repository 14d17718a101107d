use std::path::Path;
use std::sync::Arc;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::{Job, Settings};

use super::error::{Result, StoreError};
use super::keys::{SETTINGS_KEY, job_key};

/// Fjall-backed store for job records and user settings.
///
/// Individual partition operations are atomic, but workers perform
/// read-modify-write cycles on different jobs concurrently, so every mutating
/// call funnels through one async mutex. Tokio's mutex hands the lock out in
/// FIFO order, which keeps update latency fair across workers.
#[derive(Clone)]
pub struct JobStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    settings: PartitionHandle,
    write_lock: Arc<Mutex<()>>,
}

impl JobStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening job store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let settings = keyspace.open_partition("settings", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            jobs,
            settings,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        match self.jobs.get(job_key(id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All jobs, oldest first, so FIFO requeues preserve submission order.
    pub fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            jobs.push(serde_json::from_slice::<Job>(&value)?);
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    pub async fn upsert(&self, job: &Job) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.jobs
            .insert(job_key(&job.id), serde_json::to_vec(job)?)?;
        debug!(job_id = %job.id, status = ?job.status, "Upserted job");
        Ok(())
    }

    /// Read-modify-write a job under the store lock. The mutation closure
    /// runs inside the critical section so no other writer can interleave.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job),
    {
        let _guard = self.write_lock.lock().await;
        let value = self
            .jobs
            .get(job_key(id))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut job: Job = serde_json::from_slice(&value)?;
        mutate(&mut job);
        job.touch();
        self.jobs.insert(job_key(id), serde_json::to_vec(&job)?)?;
        Ok(job)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.jobs.remove(job_key(id))?;
        debug!(job_id = %id, "Deleted job");
        Ok(())
    }

    /// Whether a settings record has ever been written. Used by startup to
    /// decide if the config-file defaults should seed the store.
    pub fn has_settings(&self) -> Result<bool> {
        Ok(self.settings.get(SETTINGS_KEY)?.is_some())
    }

    /// Current settings, falling back to defaults when never written.
    pub fn settings(&self) -> Result<Settings> {
        match self.settings.get(SETTINGS_KEY)? {
            Some(value) => Ok(serde_json::from_slice::<Settings>(&value)?.normalized()),
            None => Ok(Settings::default()),
        }
    }

    pub async fn set_settings(&self, settings: &Settings) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.settings
            .insert(SETTINGS_KEY, serde_json::to_vec(settings)?)?;
        Ok(())
    }

    /// Flush pending writes to disk.
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}
