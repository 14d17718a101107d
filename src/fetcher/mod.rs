//! Mirror fetcher: acquire a binary or archive from an ordered list of
//! untrusted sources with resume, corruption detection, and multi-round
//! retry. Used only during tool bootstrap, never on the job path.

mod archive;
mod release;
mod validate;

pub use archive::{ArchiveError, InstallSpec, install_from_archive};
pub use release::resolve_primary;
pub use validate::{ArchiveFormat, PayloadKind, detect_archive, validate_leading_bytes};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use reqwest::StatusCode;
use reqwest::header::{LOCATION, RANGE};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::FetcherConfig;
use crate::observability::Metrics;

/// Partial files below this are discarded instead of resumed; a resume
/// header for a few hundred bytes buys nothing.
const MIN_RESUME_BYTES: u64 = 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("All {candidates} mirror(s) failed across {rounds} round(s); last error: {last}")]
    Exhausted {
        candidates: usize,
        rounds: u32,
        last: String,
    },

    #[error("No candidate URLs configured")]
    NoCandidates,

    #[error("HTTP client construction failed: {0}")]
    Client(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Failure of a single candidate attempt; recorded and skipped over.
#[derive(Debug, Error)]
enum AttemptError {
    #[error("HTTP {0}")]
    Status(StatusCode),

    #[error("Redirect without usable Location header")]
    BadRedirect,

    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Monotonic progress ratchet: reports only ever increase, so switching
/// mirrors never makes visible progress jump backward.
pub struct ProgressRatchet {
    best: f64,
    report: Box<dyn FnMut(f64) + Send>,
}

impl ProgressRatchet {
    pub fn new(report: impl FnMut(f64) + Send + 'static) -> Self {
        Self {
            best: 0.0,
            report: Box::new(report),
        }
    }

    /// Ratchet that drops all reports, for non-interactive callers.
    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    fn update(&mut self, percent: f64) {
        if percent > self.best {
            self.best = percent.min(100.0);
            (self.report)(self.best);
        }
    }
}

pub struct MirrorFetcher {
    client: reqwest::Client,
    rounds: u32,
    metrics: Arc<Metrics>,
}

impl MirrorFetcher {
    pub fn new(config: &FetcherConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Redirects are followed by hand so mirror-specific Location
            // targets keep the Range header decision local.
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(concat!("mediaq/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            rounds: config.rounds.max(1),
            metrics,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Try every candidate in order, for up to the configured number of
    /// rounds, stopping at the first validated success.
    pub async fn fetch(
        &self,
        candidates: &[String],
        dest: &Path,
        kind: PayloadKind,
        progress: &mut ProgressRatchet,
    ) -> Result<()> {
        if candidates.is_empty() {
            return Err(FetchError::NoCandidates);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut last_error = String::from("no attempt made");
        for round in 0..self.rounds {
            for url in candidates {
                self.metrics.mirror_attempt();
                debug!(url = %url, round, "Trying mirror");
                match self.try_candidate(url, dest, kind, progress).await {
                    Ok(()) => {
                        progress.update(100.0);
                        info!(url = %url, dest = %dest.display(), "Fetch succeeded");
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(url = %url, round, error = %err, "Mirror attempt failed");
                        last_error = format!("{url}: {err}");
                        discard_small_partial(dest).await;
                    }
                }
            }
        }
        Err(FetchError::Exhausted {
            candidates: candidates.len(),
            rounds: self.rounds,
            last: last_error,
        })
    }

    async fn try_candidate(
        &self,
        url: &str,
        dest: &Path,
        kind: PayloadKind,
        progress: &mut ProgressRatchet,
    ) -> std::result::Result<(), AttemptError> {
        // Resume from a plausible partial left by a previous attempt.
        let resume_from = match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.len() >= MIN_RESUME_BYTES => meta.len(),
            _ => 0,
        };

        let response = self.get_following_redirects(url.to_string(), resume_from).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Status(status));
        }

        let (mut file, mut written) = if status == StatusCode::PARTIAL_CONTENT && resume_from > 0 {
            let file = OpenOptions::new().append(true).open(dest).await?;
            (file, resume_from)
        } else {
            // Full response: restart even if a partial existed.
            let file = tokio::fs::File::create(dest).await?;
            (file, 0)
        };
        let total = response.content_length().map(|len| len + written);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(total) = total.filter(|t| *t > 0) {
                progress.update((written as f64 / total as f64) * 100.0);
            }
        }
        file.flush().await?;
        drop(file);

        let leading = read_leading(dest).await?;
        if let Err(reason) = validate_leading_bytes(kind, &leading) {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(AttemptError::Validation(reason));
        }
        Ok(())
    }

    /// Follow redirects by re-issuing the request against the Location
    /// target. Recursion terminates when a server answers with anything
    /// other than a redirect (or runs out of Location headers).
    fn get_following_redirects(
        &self,
        url: String,
        resume_from: u64,
    ) -> BoxFuture<'_, std::result::Result<reqwest::Response, AttemptError>> {
        Box::pin(async move {
            let mut request = self.client.get(&url);
            if resume_from > 0 {
                request = request.header(RANGE, format!("bytes={resume_from}-"));
            }
            let response = request.send().await?;

            if response.status().is_redirection() {
                let target = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or(AttemptError::BadRedirect)?;
                let next = response
                    .url()
                    .join(target)
                    .map_err(|_| AttemptError::BadRedirect)?;
                debug!(from = %url, to = %next, "Following redirect");
                return self
                    .get_following_redirects(next.to_string(), resume_from)
                    .await;
            }
            Ok(response)
        })
    }
}

/// Remove a leftover partial too small to be worth resuming.
async fn discard_small_partial(dest: &Path) {
    if let Ok(meta) = tokio::fs::metadata(dest).await {
        if meta.len() < MIN_RESUME_BYTES {
            let _ = tokio::fs::remove_file(dest).await;
        }
    }
}

async fn read_leading(path: &Path) -> io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 8];
    let n = file.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

/// Candidate list assembly: the dynamically resolved primary (when the
/// release API answers) followed by the static mirrors.
pub async fn candidate_urls(
    fetcher: &MirrorFetcher,
    release_api: Option<&str>,
    asset_name: &str,
    static_mirrors: &[String],
) -> Vec<String> {
    let mut candidates = Vec::with_capacity(static_mirrors.len() + 1);
    if let Some(api) = release_api {
        if let Some(primary) = resolve_primary(fetcher.client(), api, asset_name).await {
            candidates.push(primary);
        }
    }
    candidates.extend(static_mirrors.iter().cloned());
    candidates
}

/// Platform asset name for the extractor binary.
pub fn extractor_asset_name() -> &'static str {
    if cfg!(windows) { "yt-dlp.exe" } else { "yt-dlp" }
}

/// Install the extractor binary into `install_dir`, returning its path.
pub async fn install_extractor(
    fetcher: &MirrorFetcher,
    config: &FetcherConfig,
    install_dir: &Path,
    progress: &mut ProgressRatchet,
) -> Result<PathBuf> {
    let candidates = candidate_urls(
        fetcher,
        config.release_api.as_deref(),
        extractor_asset_name(),
        &config.extractor_mirrors,
    )
    .await;
    let dest = install_dir.join(extractor_asset_name());
    fetcher
        .fetch(&candidates, &dest, PayloadKind::Executable, progress)
        .await?;
    set_executable(&dest)?;
    Ok(dest)
}

/// Fetch the converter bundle and install ffmpeg/ffprobe from it.
pub async fn install_converter(
    fetcher: &MirrorFetcher,
    config: &FetcherConfig,
    install_dir: &Path,
    progress: &mut ProgressRatchet,
) -> Result<PathBuf> {
    let dest = install_dir.join("converter-bundle");
    fetcher
        .fetch(&config.converter_mirrors, &dest, PayloadKind::Archive, progress)
        .await?;

    let spec = InstallSpec {
        primary: "ffmpeg".to_string(),
        companion: Some("ffprobe".to_string()),
        floor: config.archive_floor,
    };
    let install_dir = install_dir.to_path_buf();
    let installed = tokio::task::spawn_blocking(move || {
        install_from_archive(&dest, &install_dir, &spec)
    })
    .await
    .map_err(|err| io::Error::other(err))?
    .map_err(|err| io::Error::other(err))?;

    installed
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::Io(io::Error::other("archive produced no binaries")))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
