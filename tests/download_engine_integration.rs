//! Integration tests for the download engine.
//!
//! These drive `DownloadEngine::download` end to end against a wiremock
//! server that understands `Range` requests, covering segmented reassembly,
//! mirror fallback, retry bounds, cancellation, validation cleanup and
//! checkpoint resume.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use reqwest::header::{CACHE_CONTROL, ETAG, HeaderMap, HeaderValue};
use resumable_fetch::download::{
    AttemptError, CachePolicy, Checkpoint, CheckpointStore, ChecksumValidator, DownloadError,
    HashAlgorithm, MemoryCheckpointStore, MetadataErrorKind, NoopValidator, ResourceMetadata,
    Segment, StatusController, ValidationError,
};
use resumable_fetch::{
    Database, DownloadEngine, DownloadOptions, DownloadRequest, FetchError, ProgressAggregate,
    RetryPolicy, SqliteCheckpointStore,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{any, header, method, path};
use wiremock::{Mock, Request, Respond, ResponseTemplate};

mod support;
use support::socket_guard::{
    should_skip_socket_bound_test, socket_skip_return, start_mock_server_or_skip,
};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return socket_skip_return();
        };
        mock_server
    }};
}

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ==================== Helper Functions ====================

/// Deterministic, non-repeating-looking payload so misplaced bytes show up.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    format!("{:x}", Sha1::digest(data))
}

/// Engine with small segments and a fast retry schedule.
fn engine_with(store: Arc<dyn CheckpointStore>) -> Result<DownloadEngine, resumable_fetch::EngineError> {
    Ok(DownloadEngine::new(DownloadOptions {
        segment_threshold: 1024,
        concurrency: 4,
        retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::ZERO),
        header_timeout: Duration::from_millis(300),
        ..DownloadOptions::default()
    })?
    .with_checkpoint_store(store))
}

fn engine() -> Result<DownloadEngine, resumable_fetch::EngineError> {
    engine_with(Arc::new(MemoryCheckpointStore::new()))
}

/// Parses `bytes=a-b` / `bytes=a-` into a half-open range clamped to `total`.
fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let ranges = value.strip_prefix("bytes=")?;
    let (start, end) = ranges.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => total,
        inclusive => inclusive.parse::<usize>().ok()? + 1,
    };
    (start < total).then_some((start, end.min(total)))
}

/// Serves `body`, slicing it for `Range` requests, and records every GET.
struct RangeResponder {
    body: Vec<u8>,
    etag: Option<&'static str>,
    requests: Arc<Mutex<Vec<Option<String>>>>,
}

impl RangeResponder {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            etag: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_etag(mut self, etag: &'static str) -> Self {
        self.etag = Some(etag);
        self
    }

    fn log(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        Arc::clone(&self.requests)
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(range.clone());

        let total = self.body.len();
        let template = match range.as_deref().and_then(|r| parse_range(r, total)) {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header(
                    "content-range",
                    format!("bytes {start}-{}/{total}", end - 1).as_str(),
                )
                .set_body_bytes(self.body[start..end].to_vec()),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        match self.etag {
            Some(etag) => template.insert_header("etag", etag),
            None => template,
        }
    }
}

/// HEAD reply advertising ranges for `body`.
fn ranged_head(body: &[u8]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("accept-ranges", "bytes")
        .set_body_bytes(body.to_vec())
}

fn range_starts(log: &Arc<Mutex<Vec<Option<String>>>>) -> Vec<Option<u64>> {
    let mut starts: Vec<Option<u64>> = log
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .iter()
        .map(|range| {
            range.as_deref().and_then(|r| {
                r.strip_prefix("bytes=")
                    .and_then(|s| s.split('-').next())
                    .and_then(|s| s.parse().ok())
            })
        })
        .collect();
    starts.sort_unstable();
    starts
}

fn fresh_policy(url: &str, etag: Option<&str>, length: u64) -> CachePolicy {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=3600"));
    if let Some(etag) = etag
        && let Ok(value) = HeaderValue::from_str(etag)
    {
        headers.insert(ETAG, value);
    }
    let mut policy = CachePolicy::from_response(url, &headers, SystemTime::now());
    policy.content_length = Some(length);
    policy
}

fn stale_policy(url: &str, etag: &str, length: u64) -> CachePolicy {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(ETAG, HeaderValue::from_str(etag).unwrap_or(HeaderValue::from_static("\"x\"")));
    let mut policy = CachePolicy::from_response(url, &headers, SystemTime::now());
    policy.content_length = Some(length);
    policy
}

/// Writes a half-finished destination: the first `done` bytes of `body`,
/// then garbage up to the full length.
fn write_partial(destination: &Path, body: &[u8], done: usize) -> std::io::Result<()> {
    let mut partial = body[..done].to_vec();
    partial.resize(body.len(), b'X');
    std::fs::write(destination, partial)
}

// ==================== Segmented Transfer Tests ====================

#[tokio::test]
async fn test_segmented_download_reassembles_byte_exact() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(10_000);
    let responder = RangeResponder::new(body.clone());
    let log = responder.log();

    Mock::given(method("HEAD"))
        .and(path("/client.jar"))
        .respond_with(ranged_head(&body))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/client.jar"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("versions/1.20/client.jar");
    let progress = Arc::new(ProgressAggregate::new());

    engine()?
        .download(
            DownloadRequest::new([format!("{}/client.jar", mock_server.uri())], &destination)
                .status(progress.clone()),
        )
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert_eq!(
        range_starts(&log),
        vec![Some(0), Some(2500), Some(5000), Some(7500)]
    );
    assert_eq!(progress.total(), 10_000);
    assert_eq!(progress.progress(), 10_000);
    Ok(())
}

#[tokio::test]
async fn test_small_file_uses_single_plain_get() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(600);
    let responder = RangeResponder::new(body.clone());
    let log = responder.log();

    Mock::given(method("HEAD"))
        .respond_with(ranged_head(&body))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("asset.bin");
    engine()?
        .download(DownloadRequest::new(
            [format!("{}/asset.bin", mock_server.uri())],
            &destination,
        ))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert_eq!(range_starts(&log), vec![None]);
    Ok(())
}

#[tokio::test]
async fn test_existing_longer_file_is_truncated_to_new_length() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(300);

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("index.json");
    std::fs::write(&destination, vec![b'Z'; 5_000])?;

    engine()?
        .download(DownloadRequest::new(
            [format!("{}/index.json", mock_server.uri())],
            &destination,
        ))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    Ok(())
}

#[tokio::test]
async fn test_head_405_falls_back_to_get_probe() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(2_000);

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("lib.jar");
    engine()?
        .download(DownloadRequest::new(
            [format!("{}/lib.jar", mock_server.uri())],
            &destination,
        ))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    Ok(())
}

#[tokio::test]
async fn test_full_body_reply_to_mid_file_range_fails_url() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(8_000);

    Mock::given(method("HEAD"))
        .respond_with(ranged_head(&body))
        .mount(&mock_server)
        .await;
    // Claims range support but always sends the whole entity.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let error = engine()?
        .download(DownloadRequest::new(
            [format!("{}/broken.jar", mock_server.uri())],
            dir.path().join("broken.jar"),
        ))
        .await
        .unwrap_err();

    let FetchError::AllSourcesFailed(aggregate) = error else {
        panic!("expected aggregate error, got {error:?}");
    };
    assert!(matches!(
        aggregate.last(),
        Some(AttemptError::Transfer(DownloadError::RangeNotHonored { .. }))
    ));
    Ok(())
}

// ==================== Mirror Fallback Tests ====================

#[tokio::test]
async fn test_not_found_primary_falls_through_to_mirror() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(500);

    Mock::given(path("/primary/lib.jar"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(path("/mirror/lib.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("lib.jar");
    engine()?
        .download(DownloadRequest::new(
            [
                format!("{}/primary/lib.jar", mock_server.uri()),
                format!("{}/mirror/lib.jar", mock_server.uri()),
            ],
            &destination,
        ))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    Ok(())
}

#[tokio::test]
async fn test_mirror_success_clears_checkpoint_of_abandoned_primary() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(6_000);
    let responder = RangeResponder::new(body.clone());

    Mock::given(method("HEAD"))
        .and(path("/primary/big.jar"))
        .respond_with(ranged_head(&body))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/primary/big.jar"))
        .respond_with(FirstSegmentOnly { body: body.clone() })
        .mount(&mock_server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/mirror/big.jar"))
        .respond_with(ranged_head(&body))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mirror/big.jar"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("big.jar");
    let store = Arc::new(MemoryCheckpointStore::new());
    engine_with(store.clone())?
        .download(DownloadRequest::new(
            [
                format!("{}/primary/big.jar", mock_server.uri()),
                format!("{}/mirror/big.jar", mock_server.uri()),
            ],
            &destination,
        ))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert!(store.is_empty(), "primary checkpoint outlived overall success");
    Ok(())
}

#[tokio::test]
async fn test_not_found_only_url_reports_metadata_error() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(any())
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let url = format!("{}/gone.jar", mock_server.uri());
    let error = engine()?
        .download(DownloadRequest::new([url.clone()], dir.path().join("gone.jar")))
        .await
        .unwrap_err();

    let FetchError::AllSourcesFailed(aggregate) = error else {
        panic!("expected aggregate error, got {error:?}");
    };
    assert_eq!(aggregate.failures.len(), 1);
    assert_eq!(aggregate.failures[0].url, url);
    match &aggregate.failures[0].error {
        AttemptError::Metadata(error) => {
            assert_eq!(error.status, 404);
            assert_eq!(error.kind, MetadataErrorKind::NotFound);
        }
        other => panic!("expected metadata error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_every_failed_url_is_reported_in_order() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(path("/a.jar"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;
    Mock::given(path("/b.jar"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let urls = [
        format!("{}/a.jar", mock_server.uri()),
        format!("{}/b.jar", mock_server.uri()),
    ];
    let error = engine()?
        .download(DownloadRequest::new(urls.clone(), dir.path().join("x.jar")))
        .await
        .unwrap_err();

    let FetchError::AllSourcesFailed(aggregate) = error else {
        panic!("expected aggregate error, got {error:?}");
    };
    let reported: Vec<&str> = aggregate.failures.iter().map(|f| f.url.as_str()).collect();
    assert_eq!(reported, vec![urls[0].as_str(), urls[1].as_str()]);
    assert!(matches!(
        &aggregate.failures[1].error,
        AttemptError::Metadata(e) if e.kind == MetadataErrorKind::ServerUnavailable
    ));
    Ok(())
}

// ==================== Retry Tests ====================

/// Stalls the first `stall` GETs past the header timeout.
struct StallingResponder {
    calls: Arc<AtomicUsize>,
    stall: usize,
    body: Vec<u8>,
}

impl Respond for StallingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let template = ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        if call < self.stall {
            template.set_delay(Duration::from_secs(2))
        } else {
            template
        }
    }
}

#[tokio::test]
async fn test_two_timeouts_then_success_takes_three_attempts() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(700);
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(StallingResponder {
            calls: Arc::clone(&calls),
            stall: 2,
            body: body.clone(),
        })
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("flaky.jar");
    engine()?
        .download(DownloadRequest::new(
            [format!("{}/flaky.jar", mock_server.uri())],
            &destination,
        ))
        .await?;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(std::fs::read(&destination)?, body);
    Ok(())
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(700);
    let calls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(StallingResponder {
            calls: Arc::clone(&calls),
            stall: usize::MAX,
            body,
        })
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let error = engine()?
        .download(DownloadRequest::new(
            [format!("{}/dead.jar", mock_server.uri())],
            dir.path().join("dead.jar"),
        ))
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let FetchError::AllSourcesFailed(aggregate) = error else {
        panic!("expected aggregate error, got {error:?}");
    };
    assert!(matches!(
        aggregate.last(),
        Some(AttemptError::Transfer(DownloadError::Timeout { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn test_http_error_on_segment_is_not_retried() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(400);

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let error = engine()?
        .download(DownloadRequest::new(
            [format!("{}/denied.jar", mock_server.uri())],
            dir.path().join("denied.jar"),
        ))
        .await
        .unwrap_err();

    let FetchError::AllSourcesFailed(aggregate) = error else {
        panic!("expected aggregate error, got {error:?}");
    };
    assert!(matches!(
        aggregate.last(),
        Some(AttemptError::Transfer(DownloadError::HttpStatus { status: 403, .. }))
    ));
    Ok(())
}

// ==================== Cancellation Tests ====================

#[tokio::test]
async fn test_cancel_mid_transfer_aborts_without_fallback() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(8_000);

    Mock::given(method("HEAD"))
        .and(path("/slow.jar"))
        .respond_with(ranged_head(&body))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow.jar"))
        .respond_with(ResponseTemplate::new(206).set_delay(Duration::from_millis(250)).set_body_bytes(body.clone()))
        .mount(&mock_server)
        .await;
    Mock::given(path("/mirror.jar"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = DownloadEngine::new(DownloadOptions {
        segment_threshold: 1024,
        retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::ZERO),
        header_timeout: Duration::from_secs(10),
        ..DownloadOptions::default()
    })?
    .with_checkpoint_store(store.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let dir = TempDir::new()?;
    let started = Instant::now();
    let error = engine
        .download(
            DownloadRequest::new(
                [
                    format!("{}/slow.jar", mock_server.uri()),
                    format!("{}/mirror.jar", mock_server.uri()),
                ],
                dir.path().join("slow.jar"),
            )
            .cancellation(cancel),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, FetchError::Aborted { .. }), "got {error:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(store.is_empty(), "cancellation must not persist a checkpoint");
    Ok(())
}

// ==================== Validation Tests ====================

#[tokio::test]
async fn test_checksum_mismatch_deletes_destination() -> TestResult {
    let mock_server = require_mock_server!();
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("signed.jar");
    let error = engine()?
        .download(
            DownloadRequest::new([format!("{}/signed.jar", mock_server.uri())], &destination)
                .validator(Arc::new(ChecksumValidator::new(
                    HashAlgorithm::Sha1,
                    sha1_hex(b"original"),
                ))),
        )
        .await
        .unwrap_err();

    let FetchError::AllSourcesFailed(aggregate) = error else {
        panic!("expected aggregate error, got {error:?}");
    };
    assert_eq!(aggregate.failures.len(), 1);
    match aggregate.last() {
        Some(AttemptError::Validation(ValidationError::ChecksumNotMatch {
            expected, actual, ..
        })) => {
            assert_eq!(expected, &sha1_hex(b"original"));
            assert_eq!(actual, &sha1_hex(b"tampered"));
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    assert!(!destination.exists());
    Ok(())
}

#[tokio::test]
async fn test_second_download_of_valid_file_makes_no_requests() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(3_000);
    Mock::given(method("HEAD"))
        .respond_with(ranged_head(&body))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("assets/ab/abcdef");
    let url = format!("{}/abcdef", mock_server.uri());
    let engine = engine()?;
    let request = || {
        DownloadRequest::new([url.clone()], &destination).validator(Arc::new(
            ChecksumValidator::new(HashAlgorithm::Sha1, sha1_hex(&body)),
        ))
    };

    engine.download(request()).await?;
    assert_eq!(std::fs::read(&destination)?, body);

    mock_server.reset().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&mock_server)
        .await;

    engine.download(request()).await?;
    assert_eq!(std::fs::read(&destination)?, body);
    Ok(())
}

#[tokio::test]
async fn test_outstanding_checkpoint_bypasses_existing_file_check() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(4_000);
    let responder = RangeResponder::new(body.clone());
    let log = responder.log();

    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("half.jar");
    write_partial(&destination, &body, 2_500)?;

    let url = format!("{}/half.jar", mock_server.uri());
    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .put(
            &url,
            &destination,
            &Checkpoint {
                segments: vec![Segment::new(2_000, 2_000), Segment::new(2_500, 4_000)],
                url: url.clone(),
                content_length: 4_000,
                cache_policy: fresh_policy(&url, None, 4_000),
            },
        )
        .await?;

    // Accepts anything, so only the checkpoint keeps the stale tail from
    // being reported as finished.
    engine_with(store.clone())?
        .download(DownloadRequest::new([url], &destination).validator(Arc::new(NoopValidator)))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert_eq!(range_starts(&log), vec![Some(2_500)]);
    assert!(store.is_empty());
    Ok(())
}

// ==================== Checkpoint Tests ====================

#[tokio::test]
async fn test_fresh_checkpoint_resumes_without_probe() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(4_000);
    let responder = RangeResponder::new(body.clone());
    let log = responder.log();

    Mock::given(method("HEAD"))
        .respond_with(ranged_head(&body))
        .expect(0)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("resume.jar");
    write_partial(&destination, &body, 2_500)?;

    let url = format!("{}/resume.jar", mock_server.uri());
    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .put(
            &url,
            &destination,
            &Checkpoint {
                segments: vec![Segment::new(2_000, 2_000), Segment::new(2_500, 4_000)],
                url: url.clone(),
                content_length: 4_000,
                cache_policy: fresh_policy(&url, None, 4_000),
            },
        )
        .await?;

    let progress = Arc::new(ProgressAggregate::new());
    engine_with(store.clone())?
        .download(DownloadRequest::new([url.clone()], &destination).status(progress.clone()))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert_eq!(range_starts(&log), vec![Some(2_500)]);
    assert_eq!(progress.progress(), 4_000);
    assert!(store.is_empty(), "checkpoint must be deleted on success");
    Ok(())
}

#[tokio::test]
async fn test_stale_checkpoint_revalidated_with_304() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(4_000);
    let responder = RangeResponder::new(body.clone()).with_etag("\"v1\"");
    let log = responder.log();

    Mock::given(method("HEAD"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("revalidate.jar");
    write_partial(&destination, &body, 1_000)?;

    let url = format!("{}/revalidate.jar", mock_server.uri());
    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .put(
            &url,
            &destination,
            &Checkpoint {
                segments: vec![Segment::new(1_000, 4_000)],
                url: url.clone(),
                content_length: 4_000,
                cache_policy: stale_policy(&url, "\"v1\"", 4_000),
            },
        )
        .await?;

    engine_with(store.clone())?
        .download(DownloadRequest::new([url], &destination))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert_eq!(range_starts(&log), vec![Some(1_000)]);
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_changed_etag_discards_checkpoint_and_replans() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(900);
    let responder = RangeResponder::new(body.clone()).with_etag("\"v2\"");
    let log = responder.log();

    Mock::given(method("HEAD"))
        .respond_with(ranged_head(&body).insert_header("etag", "\"v2\""))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("changed.jar");
    // Old representation was the same length; only the ETag differs.
    write_partial(&destination, &[b'O'; 900], 450)?;

    let url = format!("{}/changed.jar", mock_server.uri());
    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .put(
            &url,
            &destination,
            &Checkpoint {
                segments: vec![Segment::new(450, 900)],
                url: url.clone(),
                content_length: 900,
                cache_policy: stale_policy(&url, "\"v1\"", 900),
            },
        )
        .await?;

    engine_with(store.clone())?
        .download(DownloadRequest::new([url], &destination))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert_eq!(range_starts(&log), vec![None]);
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stale_checkpoint_without_validators_replans() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(4_000);
    let responder = RangeResponder::new(body.clone());
    let log = responder.log();

    Mock::given(method("HEAD"))
        .respond_with(ranged_head(&body))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("novalidators.jar");
    write_partial(&destination, &[b'O'; 4_000], 1_000)?;

    let url = format!("{}/novalidators.jar", mock_server.uri());
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let mut policy = CachePolicy::from_response(&url, &headers, SystemTime::now());
    policy.content_length = Some(4_000);

    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .put(
            &url,
            &destination,
            &Checkpoint {
                segments: vec![Segment::new(1_000, 4_000)],
                url: url.clone(),
                content_length: 4_000,
                cache_policy: policy,
            },
        )
        .await?;

    engine_with(store.clone())?
        .download(DownloadRequest::new([url], &destination))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert!(range_starts(&log).contains(&Some(0)), "old bytes were trusted");
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_length_mismatch_with_disk_is_ignored() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(800);

    Mock::given(method("HEAD"))
        .respond_with(ranged_head(&body))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("short.jar");
    std::fs::write(&destination, b"truncated by someone else")?;

    let url = format!("{}/short.jar", mock_server.uri());
    let store = Arc::new(MemoryCheckpointStore::new());
    store
        .put(
            &url,
            &destination,
            &Checkpoint {
                segments: vec![Segment::new(400, 800)],
                url: url.clone(),
                content_length: 800,
                cache_policy: fresh_policy(&url, None, 800),
            },
        )
        .await?;

    engine_with(store.clone())?
        .download(DownloadRequest::new([url], &destination))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert!(store.is_empty());
    Ok(())
}

/// Serves `body` for ranges starting at 0 and fails every other range.
struct FirstSegmentOnly {
    body: Vec<u8>,
}

impl Respond for FirstSegmentOnly {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_range(value, total));
        match range {
            Some((0, end)) => ResponseTemplate::new(206)
                .insert_header("etag", "\"stable\"")
                .set_body_bytes(self.body[..end].to_vec()),
            _ => ResponseTemplate::new(500),
        }
    }
}

#[tokio::test]
async fn test_failed_attempt_persists_checkpoint_across_restart() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(6_000);

    let head = || ranged_head(&body).insert_header("etag", "\"stable\"");
    Mock::given(method("HEAD"))
        .respond_with(head())
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(FirstSegmentOnly { body: body.clone() })
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let db_path = dir.path().join("checkpoints.db");
    let destination = dir.path().join("big.jar");
    let url = format!("{}/big.jar", mock_server.uri());

    {
        let store = Arc::new(SqliteCheckpointStore::new(Database::new(&db_path).await?));
        let result = engine_with(store.clone())?
            .download(DownloadRequest::new([url.clone()], &destination))
            .await;
        assert!(matches!(result, Err(FetchError::AllSourcesFailed(_))));
        assert_eq!(store.count().await?, 1);

        let checkpoint = store
            .find(&url, &destination)
            .await?
            .ok_or("checkpoint missing")?;
        assert_eq!(checkpoint.content_length, 6_000);
        assert!(checkpoint.segments[0].is_complete());
        assert!(checkpoint.segments[1..].iter().all(|s| !s.is_complete()));
    }

    // A new process: fresh database handle, healthy server.
    mock_server.reset().await;
    let responder = RangeResponder::new(body.clone()).with_etag("\"stable\"");
    let log = responder.log();
    Mock::given(method("HEAD"))
        .respond_with(head())
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let store = Arc::new(SqliteCheckpointStore::new(Database::new(&db_path).await?));
    engine_with(store.clone())?
        .download(DownloadRequest::new([url], &destination))
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert!(!range_starts(&log).contains(&Some(0)), "completed segment refetched");
    assert_eq!(store.count().await?, 0);
    Ok(())
}

// ==================== Explicit Resume Tests ====================

#[tokio::test]
async fn test_explicit_resume_skips_probe() -> TestResult {
    let mock_server = require_mock_server!();
    let body = payload(3_000);
    let responder = RangeResponder::new(body.clone());
    let log = responder.log();

    Mock::given(method("HEAD"))
        .respond_with(ranged_head(&body))
        .expect(0)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(responder)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new()?;
    let destination = dir.path().join("explicit.jar");
    write_partial(&destination, &body, 1_200)?;

    let url = format!("{}/explicit.jar", mock_server.uri());
    let metadata = ResourceMetadata {
        accept_ranges: true,
        content_length: Some(3_000),
        ..ResourceMetadata::new(url.clone())
    };

    engine()?
        .download(
            DownloadRequest::new([url], &destination)
                .resume_from(metadata, Some(vec![Segment::new(1_200, 3_000)])),
        )
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert_eq!(range_starts(&log), vec![Some(1_200)]);
    Ok(())
}

// ==================== Raw Socket Tests ====================

/// Builds a reply from the request method and how many requests with that
/// method came before it.
type RawReply = Box<dyn Fn(&str, usize) -> Vec<u8> + Send + Sync>;

/// Bare HTTP/1.1 server for replies wiremock cannot produce: bodies without
/// `Content-Length`, and bodies cut off mid-stream. Every reply closes the
/// connection. Returns the base URL and the methods seen, in order.
async fn raw_server(reply: RawReply) -> std::io::Result<(String, Arc<Mutex<Vec<String>>>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let methods = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&methods);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let method = String::from_utf8_lossy(&head)
                .split(' ')
                .next()
                .unwrap_or_default()
                .to_string();
            let index = {
                let mut seen = log.lock().unwrap_or_else(PoisonError::into_inner);
                let index = seen.iter().filter(|m| **m == method).count();
                seen.push(method.clone());
                index
            };
            let _ = socket.write_all(&reply(&method, index)).await;
            let _ = socket.shutdown().await;
        }
    });

    Ok((base, methods))
}

fn raw_ok(headers: &str, body: &[u8]) -> Vec<u8> {
    let mut reply = format!("HTTP/1.1 200 OK\r\nConnection: close\r\n{headers}\r\n").into_bytes();
    reply.extend_from_slice(body);
    reply
}

fn count_gets(methods: &Arc<Mutex<Vec<String>>>) -> usize {
    methods
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|m| *m == "GET")
        .count()
}

#[tokio::test]
async fn test_unknown_length_body_is_read_to_close_and_truncated() -> TestResult {
    if should_skip_socket_bound_test() {
        return socket_skip_return();
    }
    let body = payload(5_000);
    let served = body.clone();
    let (base, methods) = raw_server(Box::new(move |method: &str, _: usize| match method {
        "HEAD" => raw_ok("", &[]),
        _ => raw_ok("", &served),
    }))
    .await?;

    let dir = TempDir::new()?;
    let destination = dir.path().join("stream.bin");
    std::fs::write(&destination, vec![b'X'; 9_000])?;

    let progress = Arc::new(ProgressAggregate::new());
    engine()?
        .download(
            DownloadRequest::new([format!("{base}/stream.bin")], &destination)
                .status(progress.clone()),
        )
        .await?;

    assert_eq!(std::fs::read(&destination)?, body, "stale tail must be cut off");
    assert_eq!(count_gets(&methods), 1);
    assert_eq!(progress.total(), 0);
    assert_eq!(progress.progress(), 5_000);
    Ok(())
}

/// Records every `reset` and the highest progress reported before each.
#[derive(Default)]
struct ResetRecorder {
    aggregate: ProgressAggregate,
    resets: Mutex<Vec<(u64, u64)>>,
    peak_before_reset: Mutex<Vec<u64>>,
    peak: Mutex<u64>,
}

impl StatusController for ResetRecorder {
    fn reset(&self, progress: u64, total: u64) {
        let mut peak = self.peak.lock().unwrap_or_else(PoisonError::into_inner);
        self.peak_before_reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*peak);
        *peak = progress;
        self.resets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((progress, total));
        self.aggregate.reset(progress, total);
    }

    fn on_progress(&self, url: &str, chunk_size: u64, progress: u64) {
        let mut peak = self.peak.lock().unwrap_or_else(PoisonError::into_inner);
        *peak = (*peak).max(progress);
        self.aggregate.on_progress(url, chunk_size, progress);
    }
}

#[tokio::test]
async fn test_cut_off_plain_get_restarts_from_zero() -> TestResult {
    if should_skip_socket_bound_test() {
        return socket_skip_return();
    }
    let body = payload(5_000);
    let served = body.clone();
    let (base, methods) = raw_server(Box::new(move |method: &str, index: usize| match (method, index) {
        ("HEAD", _) => raw_ok("Content-Length: 5000\r\n", &[]),
        (_, 0) => raw_ok("Content-Length: 5000\r\n", &served[..2_000]),
        _ => raw_ok("Content-Length: 5000\r\n", &served),
    }))
    .await?;

    let dir = TempDir::new()?;
    let destination = dir.path().join("plain.bin");
    let recorder = Arc::new(ResetRecorder::default());
    engine()?
        .download(
            DownloadRequest::new([format!("{base}/plain.bin")], &destination)
                .status(recorder.clone()),
        )
        .await?;

    assert_eq!(std::fs::read(&destination)?, body);
    assert_eq!(count_gets(&methods), 2);

    let resets = recorder.resets.lock().unwrap_or_else(PoisonError::into_inner).clone();
    assert_eq!(resets, vec![(0, 5_000), (0, 5_000)]);
    let peaks = recorder
        .peak_before_reset
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    assert!(peaks[1] > 0, "first GET should have written bytes before the restart");
    assert_eq!(recorder.aggregate.progress(), 5_000);
    assert_eq!(recorder.aggregate.total(), 5_000);
    Ok(())
}
