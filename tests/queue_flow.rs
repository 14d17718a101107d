//! End-to-end queue flows against a stub extractor executable.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

use mediaq::classify::ErrorKind;
use mediaq::events::{BroadcastSink, QueueEvent};
use mediaq::model::{Job, JobStatus, Settings};
use mediaq::observability::Metrics;
use mediaq::queue::{QueueManager, RetryPolicy};
use mediaq::store::JobStore;

/// Write an executable shell script standing in for the extractor.
fn write_stub(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("stub-extractor.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Millisecond backoffs so retry flows finish within the test timeout.
fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_auto_retries: 3,
        backoff: vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
        ],
    }
}

struct Harness {
    manager: QueueManager,
    events: broadcast::Receiver<QueueEvent>,
    output_dir: PathBuf,
    _dir: TempDir,
}

async fn harness(stub_body: &str, concurrency: usize) -> Harness {
    harness_with_policy(stub_body, concurrency, fast_policy()).await
}

async fn harness_with_policy(stub_body: &str, concurrency: usize, policy: RetryPolicy) -> Harness {
    let dir = TempDir::new().unwrap();
    let stub = write_stub(dir.path(), stub_body);
    let output_dir = dir.path().join("out");

    let store = JobStore::open(dir.path().join("store")).unwrap();
    let mut settings = Settings::default();
    settings.extractor_path = Some(stub);
    settings.output_dir = output_dir.clone();
    settings.concurrency_limit = concurrency;
    store.set_settings(&settings).await.unwrap();

    let manager = QueueManager::new(store, Arc::new(Metrics::new()), policy);
    let sink = Arc::new(BroadcastSink::new(256));
    let events = sink.subscribe();
    manager.attach_sink(sink).await;

    Harness {
        manager,
        events,
        output_dir,
        _dir: dir,
    }
}

/// Collect events until `stop` matches one, or panic after five seconds.
async fn drain_until(
    rx: &mut broadcast::Receiver<QueueEvent>,
    stop: impl Fn(&QueueEvent) -> bool,
) -> Vec<QueueEvent> {
    let mut seen = Vec::new();
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            let done = stop(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for queue event");
    seen
}

/// Stub emitting two progress frames and a final metadata print; the output
/// file is created so completion can be verified against the reported size.
const SUCCESS_BODY: &str = r#"
prev=""
template=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then template="$a"; fi
  prev="$a"
done
dir=$(dirname "$template")
mkdir -p "$dir"
path="$dir/Sample Clip.mp4"
printf 'abcdef' > "$path"
echo '{"status":"downloading","downloaded_bytes":2,"total_bytes":6,"_speed_str":"1.00KiB/s","_eta_str":"00:10"}'
echo '{"status":"downloading","downloaded_bytes":6,"total_bytes":6}'
echo "after_move:{\"filepath\":\"$path\",\"title\":\"Sample Clip\",\"thumbnail\":\"NA\",\"filesize\":6}"
exit 0
"#;

#[tokio::test]
async fn successful_job_completes_with_monotone_progress() {
    let mut h = harness(SUCCESS_BODY, 1).await;

    let id = h
        .manager
        .enqueue(Job::new("https://example.com/v/1", "placeholder"))
        .await
        .unwrap();

    let events = drain_until(&mut h.events, |e| {
        matches!(e, QueueEvent::JobCompleted { .. })
    })
    .await;

    let mut last = 0.0;
    for event in &events {
        if let QueueEvent::JobProgress { percent, .. } = event {
            assert!(*percent >= last, "progress went backwards");
            last = *percent;
        }
    }

    let job = h.manager.store().get(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percent, 100.0);
    assert_eq!(job.title, "Sample Clip");
    assert!(job.error_log.is_empty());
    let path = job.output_path.expect("resolved output path");
    assert_eq!(path, h.output_dir.join("Sample Clip.mp4"));
    assert!(path.exists());
}

#[tokio::test]
async fn network_failure_exhausts_retries_then_goes_terminal() {
    let body = r#"
echo "ERROR: Connection timed out while fetching manifest" >&2
exit 1
"#;
    let mut h = harness(body, 1).await;

    let id = h
        .manager
        .enqueue(Job::new("https://example.com/v/2", "flaky"))
        .await
        .unwrap();

    let events = drain_until(&mut h.events, |e| matches!(e, QueueEvent::JobError { .. })).await;
    let errors: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::JobError { .. }))
        .collect();
    assert_eq!(errors.len(), 1, "only the terminal failure is an event");

    let job = h.manager.store().get(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.retry_count, 3);
    // One entry per failed attempt: three retried, one terminal.
    assert_eq!(job.error_log.len(), 4);
    assert!(
        job.error_log
            .iter()
            .all(|entry| entry.kind == ErrorKind::Network)
    );
}

#[tokio::test]
async fn private_video_is_never_retried() {
    let body = r#"
echo "ERROR: [youtube] abc123: Private video. Sign in if you have been granted access" >&2
exit 1
"#;
    let mut h = harness(body, 1).await;

    let id = h
        .manager
        .enqueue(Job::new("https://example.com/v/3", "hidden"))
        .await
        .unwrap();

    drain_until(&mut h.events, |e| matches!(e, QueueEvent::JobError { .. })).await;

    let job = h.manager.store().get(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.error_log.len(), 1);
    assert_eq!(job.error_log[0].kind, ErrorKind::Private);
}

/// Run `jobs` sleeping stubs at the given limit and return the highest
/// concurrently active count ever sampled.
async fn observe_ceiling(limit: usize, jobs: usize) -> usize {
    // Each run holds its slot long enough for sampling to observe overlap.
    let body = r#"
sleep 0.3
exit 0
"#;
    let mut h = harness(body, limit).await;

    for n in 0..jobs {
        h.manager
            .enqueue(Job::new(format!("https://example.com/v/{n}"), "slow"))
            .await
            .unwrap();
    }

    let mut max_active = 0;
    let mut completed = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while completed < jobs {
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        max_active = max_active.max(h.manager.active_count().await);
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, QueueEvent::JobCompleted { .. }) {
                completed += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    max_active
}

#[tokio::test]
async fn concurrency_ceiling_is_respected() {
    assert_eq!(observe_ceiling(1, 3).await, 1);
}

#[tokio::test]
async fn wider_concurrency_limit_is_filled_and_respected() {
    // Both slots fill while more jobs wait, and the ceiling still holds.
    assert_eq!(observe_ceiling(2, 4).await, 2);
}

#[tokio::test]
async fn pause_kills_running_job_without_recording_an_error() {
    let body = r#"
echo '{"status":"downloading","downloaded_bytes":1,"total_bytes":100}'
sleep 30
exit 0
"#;
    let mut h = harness(body, 1).await;

    let id = h
        .manager
        .enqueue(Job::new("https://example.com/v/4", "longrunner"))
        .await
        .unwrap();

    // Wait for the first progress frame so the process is known to be up.
    drain_until(&mut h.events, |e| {
        matches!(e, QueueEvent::JobProgress { .. })
    })
    .await;

    h.manager.pause(&id).await.unwrap();
    drain_until(&mut h.events, |e| matches!(e, QueueEvent::JobPaused { .. })).await;

    // Give the worker time to observe the exit and (wrongly) report it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = h.manager.store().get(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert!(job.error_log.is_empty(), "intentional kill is not a failure");
    assert_eq!(h.manager.active_count().await, 0);

    // Resume puts it back in line.
    h.manager.resume(&id).await.unwrap();
    let job = h.manager.store().get(&id).unwrap().unwrap();
    assert_ne!(job.status, JobStatus::Paused);
}

#[tokio::test]
async fn pause_immediately_after_enqueue_is_not_lost() {
    let body = r#"
sleep 1
exit 0
"#;
    let h = harness(body, 1).await;

    let id = h
        .manager
        .enqueue(Job::new("https://example.com/v/5", "racer"))
        .await
        .unwrap();
    // Pause in the window between dispatch and the worker's first status
    // write; the worker must not overwrite it with Downloading.
    h.manager.pause(&id).await.unwrap();

    // Outlast the whole backoff schedule: a kill misread as a retryable
    // failure would requeue and finish the job inside this window.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let job = h.manager.store().get(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert_eq!(job.retry_count, 0);
    assert!(job.error_log.is_empty(), "intentional kill is not a failure");
    assert_eq!(h.manager.active_count().await, 0);
    assert_eq!(h.manager.pending_count().await, 0);
}

/// Succeeds after half a second unless the URL marks the job as flaky, in
/// which case it fails with a retryable network error.
const MIXED_BODY: &str = r#"
url=""
for a in "$@"; do url="$a"; done
case "$url" in
  *flaky*)
    echo "ERROR: Connection timed out" >&2
    exit 1
    ;;
  *)
    sleep 0.5
    exit 0
    ;;
esac
"#;

#[tokio::test]
async fn pause_all_parks_active_and_backoff_jobs_until_resume_all() {
    // Long enough backoff that the flaky job is reliably caught mid-wait.
    let policy = RetryPolicy {
        max_auto_retries: 3,
        backoff: vec![Duration::from_millis(500)],
    };
    let mut h = harness_with_policy(MIXED_BODY, 2, policy).await;

    let flaky = h
        .manager
        .enqueue(Job::new("https://example.com/v/flaky", "flaky"))
        .await
        .unwrap();
    // Let the flaky job fail once and enter its backoff window.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let s1 = h
        .manager
        .enqueue(Job::new("https://example.com/v/a", "a"))
        .await
        .unwrap();
    let s2 = h
        .manager
        .enqueue(Job::new("https://example.com/v/b", "b"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.active_count().await, 2);

    h.manager.pause_all().await.unwrap();

    for id in [&flaky, &s1, &s2] {
        let job = h.manager.store().get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Paused, "{id} must be paused");
    }
    assert_eq!(h.manager.active_count().await, 0);
    assert_eq!(h.manager.pending_count().await, 0);

    // Crossing the original backoff deadline must not requeue the flaky job.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let job = h.manager.store().get(&flaky).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Paused);

    h.manager.resume_all().await.unwrap();

    let mut completed = std::collections::HashSet::new();
    timeout(Duration::from_secs(8), async {
        while completed.len() < 2 {
            if let Ok(QueueEvent::JobCompleted { job_id, .. }) = h.events.recv().await {
                completed.insert(job_id);
            }
        }
    })
    .await
    .expect("resumed jobs did not complete");
    assert!(completed.contains(&s1));
    assert!(completed.contains(&s2));
}
