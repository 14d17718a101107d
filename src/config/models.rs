use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::humanize::ByteSize;
use crate::model::Settings;

/// Top-level bootstrap configuration. Runtime-tunable settings (concurrency,
/// output directory, proxy) live in the store; this file seeds them on first
/// run and configures everything that is fixed for the process lifetime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            defaults: DefaultsConfig::default(),
            fetcher: FetcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_store_path")]
    pub store: PathBuf,
    /// Where fetched tool binaries are installed.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            store: default_store_path(),
            install_dir: default_install_dir(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/store")
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("data/tools")
}

/// Seed values for the persisted [`Settings`] record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub speed_limit_kbs: u64,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency(),
            output_dir: default_output_dir(),
            proxy_url: None,
            speed_limit_kbs: 0,
            format: default_format(),
        }
    }
}

impl DefaultsConfig {
    pub fn seed_settings(&self) -> Settings {
        Settings {
            concurrency_limit: self.concurrency_limit,
            output_dir: self.output_dir.clone(),
            proxy_url: self.proxy_url.clone(),
            speed_limit_kbs: self.speed_limit_kbs,
            default_format: self.format.clone(),
            extractor_path: None,
            converter_path: None,
        }
        .normalized()
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_format() -> String {
    "bestvideo*+bestaudio/best".to_string()
}

/// Tuning for the mirror fetcher used during tool bootstrap.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetcherConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Full passes over the candidate list before giving up.
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    /// Archives smaller than this are treated as corrupt and deleted.
    #[serde(default = "default_archive_floor")]
    pub archive_floor: ByteSize,
    /// Release API endpoint used to resolve a dynamic primary URL; `None`
    /// skips resolution and uses the static mirrors only.
    pub release_api: Option<String>,
    /// Static fallback mirrors for the extractor, tried in order.
    #[serde(default)]
    pub extractor_mirrors: Vec<String>,
    /// Static fallback mirrors for the converter archive.
    #[serde(default)]
    pub converter_mirrors: Vec<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            rounds: default_rounds(),
            archive_floor: default_archive_floor(),
            release_api: Some(
                "https://api.github.com/repos/yt-dlp/yt-dlp/releases/latest".to_string(),
            ),
            extractor_mirrors: vec![
                "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp".to_string(),
                "https://downloads.sourceforge.net/project/yt-dlp/yt-dlp".to_string(),
            ],
            converter_mirrors: vec![
                "https://github.com/yt-dlp/FFmpeg-Builds/releases/latest/download/ffmpeg-master-latest-linux64-gpl.tar.xz".to_string(),
                "https://www.johnvansickle.com/ffmpeg/releases/ffmpeg-release-amd64-static.tar.xz".to_string(),
            ],
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

fn default_rounds() -> u32 {
    3
}

fn default_archive_floor() -> ByteSize {
    ByteSize(5 * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.defaults.concurrency_limit >= 1);
        assert_eq!(config.fetcher.rounds, 3);
        assert_eq!(config.fetcher.archive_floor.as_u64(), 5 * 1024 * 1024);
        assert!(!config.fetcher.extractor_mirrors.is_empty());
    }

    #[test]
    fn seed_settings_carries_defaults() {
        let mut defaults = DefaultsConfig::default();
        defaults.concurrency_limit = 0; // must be clamped
        defaults.speed_limit_kbs = 250;
        let settings = defaults.seed_settings();
        assert_eq!(settings.concurrency_limit, 1);
        assert_eq!(settings.speed_limit_kbs, 250);
    }
}
