//! Optional dynamic primary-URL resolution via a release API.
//!
//! When configured, the fetcher asks the project's release endpoint for the
//! latest asset matching the platform name and prepends that URL to the
//! static mirror list. Any failure here is soft: the static mirrors still
//! stand.

use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// Resolve the download URL of the named asset from the latest release.
/// Returns `None` on any failure so callers fall back to static mirrors.
pub async fn resolve_primary(
    client: &reqwest::Client,
    api_url: &str,
    asset_name: &str,
) -> Option<String> {
    let response = match client
        .get(api_url)
        .header("Accept", "application/vnd.github.v3+json")
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!(api_url, error = %err, "Release lookup failed");
            return None;
        }
    };

    if !response.status().is_success() {
        warn!(api_url, status = %response.status(), "Release lookup rejected");
        return None;
    }

    let release: Release = match response.json().await {
        Ok(release) => release,
        Err(err) => {
            warn!(api_url, error = %err, "Release response did not parse");
            return None;
        }
    };

    let url = release
        .assets
        .iter()
        .find(|asset| asset.name == asset_name)
        .map(|asset| asset.browser_download_url.clone());
    match &url {
        Some(url) => {
            debug!(tag = %release.tag_name, url = %url, "Resolved primary download URL")
        }
        None => warn!(
            asset_name,
            tag = %release.tag_name,
            "Latest release has no matching asset"
        ),
    }
    url
}
