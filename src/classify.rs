//! Classify extractor stderr text into error kinds for retry decisions.
//!
//! The taxonomy is a data-driven ordered rule table (substring pattern →
//! kind) so it can be tested and extended without touching the worker.
//! First match wins; anything unmatched is `Generic`, which is retryable.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Content exists but cannot be served (taken down, upload removed).
    Unavailable,
    /// Requires an account or sign-in.
    Private,
    /// Deleted by the uploader or the platform.
    Deleted,
    /// Blocked in the client's region.
    GeoRestricted,
    /// Requires age confirmation.
    AgeRestricted,
    /// Scheduled premiere or live event that has not started.
    NotYetLive,
    /// The requested format selector matched nothing.
    FormatUnavailable,
    /// Transport-level failure; worth retrying.
    Network,
    /// The extractor binary could not be started at all.
    SpawnFailure,
    /// Pre-flight free-space check failed.
    Storage,
    /// Unclassified tool failure; retried on the assumption it is transient.
    Generic,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Generic)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Private => "private",
            ErrorKind::Deleted => "deleted",
            ErrorKind::GeoRestricted => "geo-restricted",
            ErrorKind::AgeRestricted => "age-restricted",
            ErrorKind::NotYetLive => "not-yet-live",
            ErrorKind::FormatUnavailable => "format-unavailable",
            ErrorKind::Network => "network",
            ErrorKind::SpawnFailure => "spawn-failure",
            ErrorKind::Storage => "storage",
            ErrorKind::Generic => "generic",
        }
    }
}

/// Ordered rule table matched against lowercased stderr. Content-availability
/// rules come first so a flaky network message later in the stream cannot
/// mask a definitive "video unavailable".
const RULES: &[(&str, ErrorKind)] = &[
    ("video unavailable", ErrorKind::Unavailable),
    ("content isn't available", ErrorKind::Unavailable),
    ("no longer available", ErrorKind::Unavailable),
    ("private video", ErrorKind::Private),
    ("sign in to confirm", ErrorKind::Private),
    ("login required", ErrorKind::Private),
    ("members-only", ErrorKind::Private),
    ("has been removed", ErrorKind::Deleted),
    ("account associated with this video has been terminated", ErrorKind::Deleted),
    ("not available in your country", ErrorKind::GeoRestricted),
    ("geo restriction", ErrorKind::GeoRestricted),
    ("blocked it in your country", ErrorKind::GeoRestricted),
    ("age-restricted", ErrorKind::AgeRestricted),
    ("confirm your age", ErrorKind::AgeRestricted),
    ("premieres in", ErrorKind::NotYetLive),
    ("this live event will begin", ErrorKind::NotYetLive),
    ("requested format is not available", ErrorKind::FormatUnavailable),
    ("no video formats found", ErrorKind::FormatUnavailable),
    ("unable to download webpage", ErrorKind::Network),
    ("connection reset", ErrorKind::Network),
    ("connection refused", ErrorKind::Network),
    ("timed out", ErrorKind::Network),
    ("temporary failure in name resolution", ErrorKind::Network),
    ("getaddrinfo failed", ErrorKind::Network),
    ("network is unreachable", ErrorKind::Network),
    ("http error 5", ErrorKind::Network),
];

/// Classify captured stderr text. The whole capture is scanned, not just the
/// last line, because the extractor interleaves warnings with the fatal line.
pub fn classify_stderr(stderr: &str) -> ErrorKind {
    let haystack = stderr.to_lowercase();
    for (pattern, kind) in RULES {
        if haystack.contains(pattern) {
            return *kind;
        }
    }
    ErrorKind::Generic
}
