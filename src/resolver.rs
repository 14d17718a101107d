//! Resolve the final artifact location for a finished job and grade its
//! integrity against the expected size.
//!
//! The extractor reports paths mid-stream, but post-processing can move the
//! file, prefix it differently, or change its extension; resolution tries a
//! sequence of increasingly fuzzy strategies against the output directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::Job;

/// How many leading title characters the fuzzy fallback matches on.
const TITLE_PREFIX_LEN: usize = 20;

/// Allowed deviation between expected and actual size before we call it a
/// mismatch, as a fraction of the expected size.
const SIZE_TOLERANCE: f64 = 0.05;

const DEFAULT_EXT: &str = "mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No expected size, or a plausible non-empty file.
    Verified,
    /// Actual size deviates more than 5% from the expected total.
    SizeMismatch,
    /// A candidate exists but is zero bytes.
    EmptyFile,
    /// No candidate found by any strategy.
    FileNotFound,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub path: Option<PathBuf>,
    pub verdict: Verdict,
}

/// Resolve the true artifact path for `job`, then compute an integrity
/// verdict. The verdict is advisory: it changes notification wording, never
/// whether the job counts as completed.
pub fn resolve(job: &Job, output_dir: &Path) -> Resolution {
    let Some(path) = locate(job, output_dir) else {
        return Resolution {
            path: None,
            verdict: Verdict::FileNotFound,
        };
    };

    let actual = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    let verdict = grade(actual, job.total_bytes);
    debug!(job_id = %job.id, path = %path.display(), actual, expected = job.total_bytes, ?verdict, "Resolved artifact");
    Resolution {
        path: Some(path),
        verdict,
    }
}

fn locate(job: &Job, output_dir: &Path) -> Option<PathBuf> {
    // 1. The recorded path, as-is.
    if let Some(recorded) = &job.output_path {
        if recorded.is_file() {
            return Some(recorded.clone());
        }
        // 2. Recorded basename re-joined with the output directory; covers
        //    prefix mismatches between the tool's cwd and ours.
        if let Some(name) = recorded.file_name() {
            let rejoined = output_dir.join(name);
            if rejoined.is_file() {
                return Some(rejoined);
            }
        }
    }

    // 3. Exact `{title}.{ext}` in the output directory.
    if !job.title.is_empty() {
        let ext = job
            .output_path
            .as_deref()
            .and_then(Path::extension)
            .and_then(|e| e.to_str())
            .unwrap_or(DEFAULT_EXT);
        let exact = output_dir.join(format!("{}.{}", job.title, ext));
        if exact.is_file() {
            return Some(exact);
        }

        // 4. First entry containing a long prefix of the title. Which entry
        //    wins when several match depends on directory enumeration order.
        let prefix: String = job.title.chars().take(TITLE_PREFIX_LEN).collect();
        if !prefix.is_empty() {
            let entries = std::fs::read_dir(output_dir).ok()?;
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().contains(&prefix)
                    && entry.file_type().map(|t| t.is_file()).unwrap_or(false)
                {
                    return Some(entry.path());
                }
            }
        }
    }

    None
}

fn grade(actual: u64, expected: u64) -> Verdict {
    if actual == 0 {
        return Verdict::EmptyFile;
    }
    if expected == 0 {
        return Verdict::Verified;
    }
    let deviation = (actual as f64 - expected as f64).abs() / expected as f64;
    if deviation > SIZE_TOLERANCE {
        Verdict::SizeMismatch
    } else {
        Verdict::Verified
    }
}
