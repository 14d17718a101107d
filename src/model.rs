//! Core records persisted by the store: jobs and user settings.
//!
//! A [`Job`] is one queued request to turn a source URL into a media file on
//! disk. Jobs are mutated by exactly one owner at a time: the worker while
//! `Downloading`, the queue manager for `Paused`/`Queued` transitions. Once
//! `Completed` or terminally `Error`, a job only changes again through an
//! explicit user retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::classify::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl JobStatus {
    /// True when no further automatic transition can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// One structured failure record. The log is append-only so history
/// survives across automatic retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    pub raw_detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source_url: String,
    pub title: String,
    /// Per-job format selector override; falls back to the settings default.
    pub format_selector: Option<String>,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub downloaded_bytes: u64,
    /// 0 means the total is not yet known.
    pub total_bytes: u64,
    /// Display strings as reported by the extractor (already humanized).
    pub speed: String,
    pub eta: String,
    /// Numeric speed in bytes/sec, kept for aggregation across jobs.
    pub speed_bps: f64,
    /// Best-known final artifact location; mutable until finalized.
    pub output_path: Option<PathBuf>,
    pub thumbnail: Option<String>,
    pub retry_count: u32,
    pub error_log: Vec<ErrorEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(source_url: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_url: source_url.into(),
            title: title.into(),
            format_selector: None,
            status: JobStatus::Queued,
            progress_percent: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed: String::new(),
            eta: String::new(),
            speed_bps: 0.0,
            output_path: None,
            thumbnail: None,
            retry_count: 0,
            error_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_error(&mut self, kind: ErrorKind, message: impl Into<String>, raw: impl Into<String>) {
        self.error_log.push(ErrorEntry {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            raw_detail: raw.into(),
        });
    }

    /// Reset transient progress fields, used right before a retry attempt.
    pub fn reset_progress(&mut self) {
        self.progress_percent = 0.0;
        self.downloaded_bytes = 0;
        self.speed.clear();
        self.eta.clear();
        self.speed_bps = 0.0;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// User-facing configuration, persisted alongside jobs. Read fresh by the
/// queue on every dispatch decision, so edits apply on the next cycle and
/// never preempt running jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub concurrency_limit: usize,
    pub output_dir: PathBuf,
    pub proxy_url: Option<String>,
    /// 0 = unlimited.
    pub speed_limit_kbs: u64,
    pub default_format: String,
    /// Optional override for the extractor binary location.
    pub extractor_path: Option<PathBuf>,
    /// Optional override for the companion converter location.
    pub converter_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency_limit: 2,
            output_dir: PathBuf::from("downloads"),
            proxy_url: None,
            speed_limit_kbs: 0,
            default_format: "bestvideo*+bestaudio/best".to_string(),
            extractor_path: None,
            converter_path: None,
        }
    }
}

impl Settings {
    /// Clamp invalid values instead of failing: a zero concurrency limit
    /// would deadlock the dispatch loop.
    pub fn normalized(mut self) -> Self {
        if self.concurrency_limit == 0 {
            self.concurrency_limit = 1;
        }
        self
    }
}
