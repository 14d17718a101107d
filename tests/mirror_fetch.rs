//! Mirror fetcher behavior against a local mock HTTP server.

use std::sync::Arc;

use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mediaq::config::FetcherConfig;
use mediaq::fetcher::{FetchError, MirrorFetcher, PayloadKind, ProgressRatchet};
use mediaq::observability::Metrics;

fn config_with_mirrors(mirrors: Vec<String>, rounds: u32) -> FetcherConfig {
    let mut config = FetcherConfig::default();
    config.release_api = None;
    config.extractor_mirrors = mirrors;
    config.rounds = rounds;
    config
}

fn fetcher(config: &FetcherConfig) -> MirrorFetcher {
    MirrorFetcher::new(config, Arc::new(Metrics::new())).unwrap()
}

/// A payload that passes the executable magic check.
fn elf_payload(len: usize) -> Vec<u8> {
    let mut body = b"\x7fELF\x02\x01\x01\x00".to_vec();
    body.resize(len, 0xAB);
    body
}

#[tokio::test]
async fn html_error_page_is_rejected_and_next_mirror_wins() {
    let server = MockServer::start().await;
    let payload = elf_payload(4096);

    Mock::given(method("GET"))
        .and(path("/bad/tool"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>rate limited</html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/good/tool"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let config = config_with_mirrors(
        vec![
            format!("{}/bad/tool", server.uri()),
            format!("{}/good/tool", server.uri()),
        ],
        3,
    );
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("tool");

    fetcher(&config)
        .fetch(
            &config.extractor_mirrors,
            &dest,
            PayloadKind::Executable,
            &mut ProgressRatchet::silent(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[tokio::test]
async fn exhaustion_reports_last_error_and_leaves_no_stub_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down/tool"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/html/tool"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<!DOCTYPE html>"))
        .mount(&server)
        .await;

    let config = config_with_mirrors(
        vec![
            format!("{}/down/tool", server.uri()),
            format!("{}/html/tool", server.uri()),
        ],
        2,
    );
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("tool");

    let err = fetcher(&config)
        .fetch(
            &config.extractor_mirrors,
            &dest,
            PayloadKind::Executable,
            &mut ProgressRatchet::silent(),
        )
        .await
        .unwrap_err();

    match err {
        FetchError::Exhausted {
            candidates, rounds, ..
        } => {
            assert_eq!(candidates, 2);
            assert_eq!(rounds, 2);
        }
        other => panic!("expected exhaustion, got {other}"),
    }
    // The rejected HTML body must not survive as a bogus partial.
    assert!(!dest.exists());
}

#[tokio::test]
async fn existing_partial_is_resumed_with_a_range_request() {
    let server = MockServer::start().await;
    let payload = elf_payload(8192);
    let resume_at = 2048usize;

    Mock::given(method("GET"))
        .and(path("/tool"))
        .and(header("Range", format!("bytes={resume_at}-")))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(payload[resume_at..].to_vec()))
        .mount(&server)
        .await;

    let config = config_with_mirrors(vec![format!("{}/tool", server.uri())], 1);
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("tool");
    std::fs::write(&dest, &payload[..resume_at]).unwrap();

    fetcher(&config)
        .fetch(
            &config.extractor_mirrors,
            &dest,
            PayloadKind::Executable,
            &mut ProgressRatchet::silent(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[tokio::test]
async fn full_response_to_a_resume_request_restarts_from_scratch() {
    let server = MockServer::start().await;
    let payload = elf_payload(4096);

    // Server ignores Range and replies 200 with the whole body.
    Mock::given(method("GET"))
        .and(path("/tool"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let config = config_with_mirrors(vec![format!("{}/tool", server.uri())], 1);
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("tool");
    std::fs::write(&dest, elf_payload(2048)).unwrap();

    fetcher(&config)
        .fetch(
            &config.extractor_mirrors,
            &dest,
            PayloadKind::Executable,
            &mut ProgressRatchet::silent(),
        )
        .await
        .unwrap();

    // Byte-exact, not the partial plus a full copy appended.
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[tokio::test]
async fn redirects_are_followed_to_the_real_payload() {
    let server = MockServer::start().await;
    let payload = elf_payload(4096);

    Mock::given(method("GET"))
        .and(path("/redirect/tool"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/real/tool"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/real/tool"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let config = config_with_mirrors(vec![format!("{}/redirect/tool", server.uri())], 1);
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("tool");

    let metrics = Arc::new(Metrics::new());
    let fetcher = MirrorFetcher::new(&config, metrics.clone()).unwrap();
    fetcher
        .fetch(
            &config.extractor_mirrors,
            &dest,
            PayloadKind::Executable,
            &mut ProgressRatchet::silent(),
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    // One candidate, one attempt; redirect hops are not separate attempts.
    assert_eq!(metrics.snapshot().mirror_attempts, 1);
}
