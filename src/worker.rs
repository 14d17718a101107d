//! Runs one extractor process end-to-end for a single job: pre-flight
//! checks, spawn, output streaming, record updates, and the retry/terminal
//! decision on exit.
//!
//! The worker owns its process exclusively. Cancellation arrives through the
//! job's [`CancellationToken`] and is an unconditional kill; there is no
//! cooperative shutdown protocol with the external tool. The spawned process
//! has no wall-clock timeout: long downloads are legitimate and a hung tool
//! is recoverable through pause.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classify::{ErrorKind, classify_stderr};
use crate::events::{EventSink, QueueEvent};
use crate::humanize::format_speed;
use crate::model::{Job, JobStatus, Settings};
use crate::parser::{Frame, InfoFrame, OutputParser, ProgressFrame};
use crate::queue::RetryPolicy;
use crate::resolver::{self, Verdict};
use crate::store::JobStore;

/// Free-space floor applied even for small downloads.
const MIN_REQUIRED_BYTES: u64 = 100 * 1024 * 1024;

/// Size assumed for the pre-flight check when the total is unknown.
const DEFAULT_SIZE_ESTIMATE: u64 = 500 * 1024 * 1024;

const DEFAULT_EXTRACTOR: &str = "yt-dlp";

/// JSON-lines progress template handed to the extractor so its stdout can be
/// decoded by [`OutputParser`].
const PROGRESS_TEMPLATE: &str = concat!(
    "{\"status\":\"%(progress.status)s\",",
    "\"downloaded_bytes\":%(progress.downloaded_bytes|0)s,",
    "\"total_bytes\":%(progress.total_bytes|0)s,",
    "\"total_bytes_estimate\":%(progress.total_bytes_estimate|0)s,",
    "\"speed\":%(progress.speed|0)s,",
    "\"_speed_str\":\"%(progress._speed_str)s\",",
    "\"_eta_str\":\"%(progress._eta_str)s\",",
    "\"filename\":\"%(progress.filename)s\"}",
);

/// Metadata print emitted once the artifact reaches its final location.
const METADATA_PRINT: &str = concat!(
    "after_move:{\"filepath\":\"%(filepath)s\",",
    "\"title\":\"%(title)s\",",
    "\"thumbnail\":\"%(thumbnail)s\",",
    "\"filesize\":%(filesize,filesize_approx|0)s}",
);

/// What the queue should do with the job after this run.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    /// The kill was intentional; leave the record alone.
    Paused,
    /// Terminal failure (or unrecoverable store error).
    Failed,
    /// Retryable failure; re-enqueue after the delay.
    Retry { delay: Duration },
}

/// Everything a single run needs, handed over by the queue manager.
pub struct WorkerContext {
    pub store: JobStore,
    pub sink: Arc<dyn EventSink>,
    /// Settings snapshot taken at dispatch time.
    pub settings: Settings,
    pub cancel: CancellationToken,
    pub policy: RetryPolicy,
}

pub async fn run_job(ctx: &WorkerContext, job_id: &str) -> RunOutcome {
    match run_inner(ctx, job_id).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(job_id = %job_id, error = %err, "Worker aborted on store error");
            RunOutcome::Failed
        }
    }
}

async fn run_inner(ctx: &WorkerContext, job_id: &str) -> crate::store::Result<RunOutcome> {
    let Some(job) = ctx.store.get(job_id)? else {
        warn!(job_id = %job_id, "Job vanished before dispatch");
        return Ok(RunOutcome::Failed);
    };
    // A pause can land between dispatch and this point; the queue manager
    // owns the Paused status and the worker must never overwrite it.
    if job.status != JobStatus::Queued {
        debug!(job_id = %job_id, status = ?job.status, "Job no longer queued, not starting");
        return Ok(RunOutcome::Paused);
    }

    let output_dir = ctx.settings.output_dir.clone();
    if let Err(err) = std::fs::create_dir_all(&output_dir) {
        return fail(
            ctx,
            job_id,
            ErrorKind::Storage,
            format!("Cannot create output directory: {err}"),
            err.to_string(),
        )
        .await;
    }

    // Pre-flight: refuse to spawn when the destination volume is too full.
    let estimated = if job.total_bytes > 0 {
        job.total_bytes
    } else {
        DEFAULT_SIZE_ESTIMATE
    };
    let required = ((estimated as f64 * 1.1) as u64).max(MIN_REQUIRED_BYTES);
    if let Some(free) = free_space(&output_dir) {
        if free < required {
            return fail(
                ctx,
                job_id,
                ErrorKind::Storage,
                format!("Insufficient disk space: {free} bytes free, {required} required"),
                String::new(),
            )
            .await;
        }
    }

    let mut child = match build_command(&job, &ctx.settings).spawn() {
        Ok(child) => child,
        Err(err) => {
            return fail(
                ctx,
                job_id,
                ErrorKind::SpawnFailure,
                format!("Failed to start extractor: {err}"),
                err.to_string(),
            )
            .await;
        }
    };

    // Conditional transition: only a still-Queued job may start downloading.
    // If a racing pause won, stop the process and leave the record alone.
    let current = ctx
        .store
        .update(job_id, |j| {
            if j.status == JobStatus::Queued {
                j.status = JobStatus::Downloading;
            }
        })
        .await?;
    if current.status != JobStatus::Downloading {
        debug!(job_id = %job_id, status = ?current.status, "Paused before start, stopping extractor");
        let _ = child.kill().await;
        return Ok(RunOutcome::Paused);
    }
    info!(job_id = %job_id, url = %job.source_url, "Extractor started");

    // Stderr is collected off to the side for classification on failure.
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut text = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut text).await;
        }
        text
    });

    let mut stdout = child.stdout.take();
    let mut parser = OutputParser::new();
    let mut buf = vec![0u8; 8 * 1024];
    let mut killed = false;

    if let Some(reader) = stdout.as_mut() {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled(), if !killed => {
                    debug!(job_id = %job_id, "Kill requested");
                    let _ = child.kill().await;
                    killed = true;
                }
                read = reader.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            for frame in parser.feed(&buf[..n]) {
                                apply_frame(ctx, job_id, &output_dir, frame).await?;
                            }
                        }
                        Err(err) => {
                            debug!(job_id = %job_id, error = %err, "Stdout read failed");
                            break;
                        }
                    }
                }
            }
        }
        for frame in parser.finish() {
            apply_frame(ctx, job_id, &output_dir, frame).await?;
        }
    }

    let exit = child.wait().await;
    let stderr_text = stderr_task.await.unwrap_or_default();

    // A racing pause may have killed the process between our last read and
    // its exit event; the persisted status is the source of truth.
    if let Some(current) = ctx.store.get(job_id)? {
        if current.status == JobStatus::Paused {
            debug!(job_id = %job_id, "Exit after intentional kill, leaving record paused");
            return Ok(RunOutcome::Paused);
        }
    } else {
        // Deleted while running.
        return Ok(RunOutcome::Failed);
    }

    match exit {
        Ok(status) if status.success() => finalize(ctx, job_id, &output_dir).await,
        Ok(status) => {
            let kind = classify_stderr(&stderr_text);
            let message = format!(
                "Extractor exited with {} ({})",
                status.code().map_or_else(|| "signal".to_string(), |c| c.to_string()),
                kind.label(),
            );
            fail(ctx, job_id, kind, message, stderr_text).await
        }
        Err(err) => {
            fail(
                ctx,
                job_id,
                ErrorKind::Generic,
                format!("Failed to collect extractor exit status: {err}"),
                stderr_text,
            )
            .await
        }
    }
}

/// Apply one decoded frame to the record, touching only the fields the frame
/// carries.
async fn apply_frame(
    ctx: &WorkerContext,
    job_id: &str,
    output_dir: &Path,
    frame: Frame,
) -> crate::store::Result<()> {
    match frame {
        Frame::Progress(p) => {
            let job = ctx.store.update(job_id, |j| apply_progress(j, &p, output_dir)).await?;
            ctx.sink
                .emit(QueueEvent::JobProgress {
                    job_id: job.id.clone(),
                    percent: job.progress_percent,
                    downloaded_bytes: job.downloaded_bytes,
                    total_bytes: job.total_bytes,
                    speed: job.speed.clone(),
                    eta: job.eta.clone(),
                })
                .await;
        }
        Frame::Metadata(info) | Frame::Info(info) => {
            ctx.store
                .update(job_id, |j| apply_info(j, &info, output_dir))
                .await?;
        }
    }
    Ok(())
}

fn apply_progress(job: &mut Job, p: &ProgressFrame, output_dir: &Path) {
    if let Some(percent) = p.percent {
        // Monotonic while downloading; stale frames never move it backward.
        if percent > job.progress_percent {
            job.progress_percent = percent.min(100.0);
        }
    }
    if let Some(bytes) = p.downloaded_bytes {
        job.downloaded_bytes = bytes;
    }
    if let Some(total) = p.total_bytes {
        job.total_bytes = total;
    }
    if let Some(speed) = p.speed_bps {
        job.speed_bps = speed;
        job.speed = p
            .speed_text
            .clone()
            .unwrap_or_else(|| format_speed(speed));
    } else if let Some(text) = &p.speed_text {
        job.speed = text.clone();
    }
    if let Some(eta) = &p.eta_text {
        job.eta = eta.clone();
    }
    if let Some(path) = &p.output_path {
        job.output_path = Some(absolutize(path, output_dir));
    }
}

fn apply_info(job: &mut Job, info: &InfoFrame, output_dir: &Path) {
    if let Some(path) = &info.path {
        job.output_path = Some(absolutize(path, output_dir));
    }
    if let Some(title) = &info.title {
        job.title = title.clone();
    }
    if let Some(thumbnail) = &info.thumbnail {
        job.thumbnail = Some(thumbnail.clone());
    }
    if let Some(size) = info.size {
        job.total_bytes = size;
    }
}

fn absolutize(path: &str, output_dir: &Path) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        output_dir.join(path)
    }
}

async fn finalize(
    ctx: &WorkerContext,
    job_id: &str,
    output_dir: &Path,
) -> crate::store::Result<RunOutcome> {
    let job = ctx
        .store
        .get(job_id)?
        .ok_or_else(|| crate::store::StoreError::NotFound(job_id.to_string()))?;

    let resolution = resolver::resolve(&job, output_dir);
    let message = match resolution.verdict {
        Verdict::Verified => "Download completed".to_string(),
        Verdict::SizeMismatch => {
            "Download completed, but the file size differs from the reported total".to_string()
        }
        Verdict::EmptyFile => "Download completed, but the output file is empty".to_string(),
        Verdict::FileNotFound => {
            "Download finished, but the output file could not be located".to_string()
        }
    };

    let resolved_path = resolution.path.clone();
    let updated = ctx
        .store
        .update(job_id, |j| {
            j.status = JobStatus::Completed;
            j.progress_percent = 100.0;
            if let Some(path) = &resolved_path {
                j.output_path = Some(path.clone());
            }
        })
        .await?;

    info!(job_id = %job_id, verdict = ?resolution.verdict, "Job completed");
    ctx.sink
        .emit(QueueEvent::JobCompleted {
            job_id: updated.id,
            path: resolution.path,
            verdict: resolution.verdict,
            message,
        })
        .await;
    Ok(RunOutcome::Completed)
}

/// Record a failure and decide between automatic retry and terminal error.
async fn fail(
    ctx: &WorkerContext,
    job_id: &str,
    kind: ErrorKind,
    message: String,
    raw: String,
) -> crate::store::Result<RunOutcome> {
    let Some(job) = ctx.store.get(job_id)? else {
        return Ok(RunOutcome::Failed);
    };

    if kind.is_retryable() && job.retry_count < ctx.policy.max_auto_retries {
        let updated = ctx
            .store
            .update(job_id, |j| {
                j.push_error(kind, message.clone(), raw.clone());
                j.retry_count += 1;
                j.status = JobStatus::Queued;
                j.reset_progress();
            })
            .await?;
        let delay = ctx.policy.delay_for(updated.retry_count);
        warn!(
            job_id = %job_id,
            kind = kind.label(),
            attempt = updated.retry_count,
            delay_secs = delay.as_secs_f64(),
            "Retryable failure, scheduling re-enqueue"
        );
        return Ok(RunOutcome::Retry { delay });
    }

    // Terminal. Skip entirely when already terminal so a duplicate exit
    // event cannot double-log the failure.
    if job.status == JobStatus::Error {
        return Ok(RunOutcome::Failed);
    }

    ctx.store
        .update(job_id, |j| {
            j.status = JobStatus::Error;
            j.push_error(kind, message.clone(), raw.clone());
        })
        .await?;
    warn!(job_id = %job_id, kind = kind.label(), "Job failed terminally");
    ctx.sink
        .emit(QueueEvent::JobError {
            job_id: job_id.to_string(),
            kind,
            message,
        })
        .await;
    Ok(RunOutcome::Failed)
}

fn build_command(job: &Job, settings: &Settings) -> Command {
    let bin = settings
        .extractor_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTRACTOR));
    let format = job
        .format_selector
        .as_deref()
        .unwrap_or(&settings.default_format);

    let mut cmd = Command::new(bin);
    cmd.arg("--newline")
        .arg("--no-colors")
        .arg("-f")
        .arg(format)
        .arg("-o")
        .arg(settings.output_dir.join("%(title)s.%(ext)s"))
        .arg("--progress-template")
        .arg(PROGRESS_TEMPLATE)
        .arg("--print")
        .arg(METADATA_PRINT)
        .arg("--no-simulate");

    if let Some(proxy) = &settings.proxy_url {
        cmd.arg("--proxy").arg(proxy);
    }
    if settings.speed_limit_kbs > 0 {
        cmd.arg("--limit-rate")
            .arg(format!("{}K", settings.speed_limit_kbs));
    }
    if let Some(converter) = &settings.converter_path {
        cmd.arg("--ffmpeg-location").arg(converter);
    }
    cmd.arg(&job.source_url);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

#[cfg(unix)]
fn free_space(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // Safety: c_path is a valid NUL-terminated string and stat is zeroed
    // storage of the right type.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } == 0 {
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn free_space(_path: &Path) -> Option<u64> {
    // No portable check here; the extractor will surface disk-full errors.
    None
}
