//! Integration tests for chute-dl
//!
//! These tests use wiremock to simulate HTTP origins and exercise real
//! download scenarios: parallel chunks, pause/resume across a simulated
//! restart, range-ignoring servers, checksum failures and storage errors.

use chute_dl::{
    ChecksumAlgorithm, CheckpointStore, ChunkState, DownloadDestination, DownloadEngine,
    DownloadEvent, DownloadRequest, DownloadStatus, EngineConfig, ErrorKind, PausedSnapshot,
    StorageConfig, StorageResolution,
};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic pseudo-random payload
fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

/// Engine writing into `<root>/out` with state under `<root>/state`
fn test_config(root: &Path) -> EngineConfig {
    EngineConfig::new()
        .state_dir(root.join("state"))
        .retry(3, 50, 2.0)
        .storage(StorageConfig {
            destinations: vec![DownloadDestination::Custom(root.join("out"))],
            overwrite_existing: true,
            validate_free_space: false,
            ..Default::default()
        })
}

/// Responder that honors `Range: bytes=a-b` with proper 206 replies
struct RangeResponder {
    body: Vec<u8>,
    delay: Option<Duration>,
}

impl RangeResponder {
    fn new(body: Vec<u8>) -> Self {
        Self { body, delay: None }
    }

    /// Delay each response, leaving a window for pause/stop mid-download
    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn finish(&self, template: ResponseTemplate) -> ResponseTemplate {
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range_header);

        let template = match range {
            Some((start, end)) => {
                let end = end.unwrap_or(total - 1).min(total - 1);
                if start > end {
                    return self.finish(ResponseTemplate::new(416));
                }
                ResponseTemplate::new(206)
                    .insert_header(
                        "Content-Range",
                        format!("bytes {}-{}/{}", start, end, total).as_str(),
                    )
                    .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        self.finish(template)
    }
}

/// Responder that ignores Range headers entirely and streams the whole
/// payload with 200
struct IgnoresRangeResponder {
    body: Vec<u8>,
}

impl Respond for IgnoresRangeResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_bytes(self.body.clone())
    }
}

fn parse_range_header(value: &str) -> Option<(u64, Option<u64>)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    let start = start.parse::<u64>().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse::<u64>().ok()?)
    };
    Some((start, end))
}

async fn mount_head(server: &MockServer, url_path: &str, len: usize) {
    Mock::given(method("HEAD"))
        .and(path(url_path.to_string()))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", len.to_string().as_str())
                .insert_header("Accept-Ranges", "bytes"),
        )
        .mount(server)
        .await;
}

/// Wait for an event matching `predicate`, failing the test on timeout
async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    predicate: F,
    timeout_duration: Duration,
) -> Option<DownloadEvent>
where
    F: Fn(&DownloadEvent) -> bool,
{
    timeout(timeout_duration, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

fn is_terminal(event: &DownloadEvent) -> bool {
    matches!(
        event,
        DownloadEvent::Completed { .. }
            | DownloadEvent::Failed { .. }
            | DownloadEvent::Cancelled { .. }
    )
}

/// Drain events for one handle until its terminal event arrives
async fn collect_lifecycle(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    id: &str,
    timeout_duration: Duration,
) -> Vec<DownloadEvent> {
    let mut events = Vec::new();
    let _ = timeout(timeout_duration, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.handle().id != id {
                        continue;
                    }
                    let terminal = is_terminal(&event);
                    events.push(event);
                    if terminal {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
    .await;
    events
}

// =============================================================================
// Happy-path downloads
// =============================================================================

#[tokio::test]
async fn single_chunk_download_completes() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(1024 * 1024);

    mount_head(&server, "/a.bin", body.len()).await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let engine = DownloadEngine::new(test_config(root.path()).chunking(1, 65536, true)).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/a.bin", server.uri()), "a.bin");
    let id = request.id.clone();
    engine.enqueue(request).await.expect("enqueue failed");

    let lifecycle = collect_lifecycle(&mut events, &id, Duration::from_secs(10)).await;

    assert!(matches!(lifecycle.first(), Some(DownloadEvent::Queued { .. })));
    assert!(lifecycle.iter().any(|e| matches!(e, DownloadEvent::Started { .. })));
    assert!(
        lifecycle.iter().any(|e| matches!(e, DownloadEvent::Progress { .. })),
        "expected at least one progress event"
    );
    assert!(matches!(lifecycle.last(), Some(DownloadEvent::Completed { .. })));

    let file = root.path().join("out/a.bin");
    assert_eq!(tokio::fs::read(&file).await.unwrap(), body);
    assert!(matches!(
        engine.status(&id),
        Some(DownloadStatus::Completed { .. })
    ));

    // No stale checkpoint may survive completion
    let paused_dir = root.path().join("state/downloads-state/paused_states");
    let leftovers = std::fs::read_dir(&paused_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn parallel_chunks_partition_the_payload() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(6_000_000);

    mount_head(&server, "/b.bin", body.len()).await;
    Mock::given(method("GET"))
        .and(path("/b.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let engine = DownloadEngine::new(test_config(root.path()).chunking(3, 65536, true)).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/b.bin", server.uri()), "b.bin");
    let id = request.id.clone();
    engine.enqueue(request).await.unwrap();

    let completed = wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Completed { handle } if handle.id == id),
        Duration::from_secs(20),
    )
    .await;
    assert!(completed.is_some(), "download should complete");

    assert_eq!(
        tokio::fs::read(root.path().join("out/b.bin")).await.unwrap(),
        body
    );

    // The origin must have seen the three planned slices
    let requests = server.received_requests().await.unwrap();
    let mut ranges: Vec<String> = requests
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .filter_map(|r| r.headers.get("range"))
        .filter_map(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .collect();
    ranges.sort();
    assert_eq!(
        ranges,
        vec![
            "bytes=0-1999999".to_string(),
            "bytes=2000000-3999999".to_string(),
            "bytes=4000000-5999999".to_string(),
        ]
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn unknown_length_download_uses_single_stream() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(300_000);

    // Origin does not implement HEAD
    Mock::given(method("HEAD"))
        .and(path("/c.bin"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/c.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let engine = DownloadEngine::new(test_config(root.path()).chunking(4, 65536, true)).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/c.bin", server.uri()), "c.bin");
    let id = request.id.clone();
    engine.enqueue(request).await.unwrap();

    let completed = wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Completed { handle } if handle.id == id),
        Duration::from_secs(10),
    )
    .await;
    assert!(completed.is_some());

    assert_eq!(
        tokio::fs::read(root.path().join("out/c.bin")).await.unwrap(),
        body
    );

    // Unknown length at planning time: the GET must be unranged
    let requests = server.received_requests().await.unwrap();
    let ranged_gets = requests
        .iter()
        .filter(|r| r.method.as_str() == "GET" && r.headers.get("range").is_some())
        .count();
    assert_eq!(ranged_gets, 0);

    engine.shutdown().await;
}

// =============================================================================
// Range-ignoring origins
// =============================================================================

#[tokio::test]
async fn origin_ignoring_range_still_partitions_correctly() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(600_000);

    mount_head(&server, "/d.bin", body.len()).await;
    Mock::given(method("GET"))
        .and(path("/d.bin"))
        .respond_with(IgnoresRangeResponder { body: body.clone() })
        .mount(&server)
        .await;

    let engine = DownloadEngine::new(test_config(root.path()).chunking(3, 65536, true)).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/d.bin", server.uri()), "d.bin");
    let id = request.id.clone();
    engine.enqueue(request).await.unwrap();

    let lifecycle = collect_lifecycle(&mut events, &id, Duration::from_secs(15)).await;
    assert!(
        matches!(lifecycle.last(), Some(DownloadEvent::Completed { .. })),
        "got {:?}",
        lifecycle.last()
    );

    // Every chunk restarted from its slice start against the full stream,
    // wrote only its slice, and the final file still partitions cleanly
    assert_eq!(
        tokio::fs::read(root.path().join("out/d.bin")).await.unwrap(),
        body
    );

    engine.shutdown().await;
}

// =============================================================================
// Pause / resume
// =============================================================================

#[tokio::test]
async fn pause_persists_snapshot_and_resume_finishes() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(200_000);

    mount_head(&server, "/e.bin", body.len()).await;
    Mock::given(method("GET"))
        .and(path("/e.bin"))
        .respond_with(RangeResponder::new(body.clone()).with_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;

    let engine = DownloadEngine::new(test_config(root.path()).chunking(2, 65536, true)).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/e.bin", server.uri()), "e.bin");
    let id = request.id.clone();
    engine.enqueue(request).await.unwrap();

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Started { handle } if handle.id == id),
        Duration::from_secs(5),
    )
    .await
    .expect("download should start");

    // Let the fetchers reach their (delayed) GETs, then pause
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.pause(&id).await.expect("pause failed");

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Paused { handle } if handle.id == id),
        Duration::from_secs(5),
    )
    .await
    .expect("paused event");

    assert_eq!(engine.status(&id), Some(DownloadStatus::Paused));

    // Snapshot is on disk before resume
    let store = CheckpointStore::new(&root.path().join("state"));
    let snapshot = store.load_paused_snapshot(&id).expect("snapshot persisted");
    assert_eq!(snapshot.handle_id, id);
    assert!(!snapshot.chunk_states.is_empty());

    engine.resume(&id).await.expect("resume failed");

    let lifecycle = collect_lifecycle(&mut events, &id, Duration::from_secs(15)).await;
    assert!(lifecycle.iter().any(|e| matches!(e, DownloadEvent::Resumed { .. })));
    assert!(matches!(lifecycle.last(), Some(DownloadEvent::Completed { .. })));

    assert_eq!(
        tokio::fs::read(root.path().join("out/e.bin")).await.unwrap(),
        body
    );
    assert!(store.load_paused_snapshot(&id).is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn resume_after_restart_refetches_only_missing_ranges() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(100_000);

    mount_head(&server, "/f.bin", body.len()).await;
    Mock::given(method("GET"))
        .and(path("/f.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    // Simulate a previous process: a partial file (chunk 0 at 30000,
    // chunk 1 at 80000) plus its snapshot on disk.
    let out_dir = root.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    let file = out_dir.join("f.bin");
    let mut partial = vec![0u8; 80_000];
    partial[..30_000].copy_from_slice(&body[..30_000]);
    partial[50_000..80_000].copy_from_slice(&body[50_000..80_000]);
    std::fs::write(&file, &partial).unwrap();

    let request = DownloadRequest::new(format!("{}/f.bin", server.uri()), "f.bin")
        .with_id("restart-handle");
    let snapshot = PausedSnapshot {
        handle_id: "restart-handle".to_string(),
        request: request.clone(),
        resolution: StorageResolution {
            directory: out_dir.clone(),
            file: file.clone(),
            overwrote_existing: false,
        },
        completed_bytes: 60_000,
        chunk_states: vec![
            ChunkState::new(0, 0, Some(49_999), 30_000),
            ChunkState::new(1, 50_000, Some(99_999), 80_000),
        ],
    };
    let store = CheckpointStore::new(&root.path().join("state"));
    store.save_paused_snapshot(&snapshot);

    // "Restarted" process: fresh engine over the same state directory
    let engine = DownloadEngine::new(test_config(root.path()).chunking(2, 65536, true)).unwrap();
    let mut events = engine.subscribe();

    engine.resume("restart-handle").await.expect("resume failed");

    let completed = wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Completed { handle } if handle.id == "restart-handle"),
        Duration::from_secs(10),
    )
    .await;
    assert!(completed.is_some());

    assert_eq!(tokio::fs::read(&file).await.unwrap(), body);

    // Only the outstanding tails were fetched
    let requests = server.received_requests().await.unwrap();
    let mut ranges: Vec<String> = requests
        .iter()
        .filter_map(|r| r.headers.get("range"))
        .filter_map(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .collect();
    ranges.sort();
    assert_eq!(
        ranges,
        vec!["bytes=30000-49999".to_string(), "bytes=80000-99999".to_string()]
    );

    assert!(store.load_paused_snapshot("restart-handle").is_none());

    engine.shutdown().await;
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn checksum_mismatch_retries_from_zero_then_fails() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(50_000);

    mount_head(&server, "/g.bin", body.len()).await;
    Mock::given(method("GET"))
        .and(path("/g.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let config = test_config(root.path()).chunking(1, 65536, true).retry(2, 50, 2.0);
    let engine = DownloadEngine::new(config).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/g.bin", server.uri()), "g.bin")
        .with_checksum(ChecksumAlgorithm::Sha256, "11".repeat(32));
    let id = request.id.clone();
    engine.enqueue(request).await.unwrap();

    let lifecycle = collect_lifecycle(&mut events, &id, Duration::from_secs(15)).await;

    assert!(
        lifecycle
            .iter()
            .any(|e| matches!(e, DownloadEvent::Retry { attempt: 1, .. })),
        "first integrity failure should trigger a retry"
    );

    match lifecycle.last() {
        Some(DownloadEvent::Failed { error, .. }) => {
            assert_eq!(error.kind, ErrorKind::Integrity);
            assert_eq!(error.failures, vec!["Checksum mismatch (SHA256)".to_string()]);
        }
        other => panic!("expected integrity failure, got {:?}", other),
    }

    // Restart-from-zero deleted the rejected artifact
    assert!(!root.path().join("out/g.bin").exists());

    engine.shutdown().await;
}

#[tokio::test]
async fn transient_server_error_resumes_and_completes() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(100_000);

    mount_head(&server, "/h.bin", body.len()).await;
    // First GET fails with 503; everything after succeeds
    Mock::given(method("GET"))
        .and(path("/h.bin"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/h.bin"))
        .respond_with(RangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let engine = DownloadEngine::new(test_config(root.path()).chunking(1, 65536, true)).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/h.bin", server.uri()), "h.bin");
    let id = request.id.clone();
    engine.enqueue(request).await.unwrap();

    let lifecycle = collect_lifecycle(&mut events, &id, Duration::from_secs(15)).await;
    assert!(lifecycle.iter().any(|e| matches!(e, DownloadEvent::Retry { .. })));
    assert!(matches!(lifecycle.last(), Some(DownloadEvent::Completed { .. })));

    assert_eq!(
        tokio::fs::read(root.path().join("out/h.bin")).await.unwrap(),
        body
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn not_found_is_permanent_without_retries() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/i.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/i.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let engine = DownloadEngine::new(test_config(root.path())).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/i.bin", server.uri()), "i.bin");
    let id = request.id.clone();
    engine.enqueue(request).await.unwrap();

    let lifecycle = collect_lifecycle(&mut events, &id, Duration::from_secs(10)).await;
    assert!(
        !lifecycle.iter().any(|e| matches!(e, DownloadEvent::Retry { .. })),
        "permanent failures must not retry"
    );
    match lifecycle.last() {
        Some(DownloadEvent::Failed { error, .. }) => {
            assert_eq!(error.kind, ErrorKind::Permanent);
        }
        other => panic!("expected permanent failure, got {:?}", other),
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn insufficient_space_fails_before_any_network_io() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;

    let mut config = test_config(root.path());
    config.storage.validate_free_space = true;
    config.storage.min_free_space_bytes = u64::MAX;

    let engine = DownloadEngine::new(config).unwrap();

    // Platforms without mount information skip the free-space check; there
    // is nothing to assert in that case.
    let probe = DownloadRequest::new(format!("{}/j.bin", server.uri()), "probe.bin");
    if engine.preview_destination(&probe).is_ok() {
        engine.shutdown().await;
        return;
    }

    let mut events = engine.subscribe();
    let request = DownloadRequest::new(format!("{}/j.bin", server.uri()), "j.bin");
    let id = request.id.clone();

    let err = engine.enqueue(request).await.unwrap_err();
    assert_eq!(ErrorKind::Storage, err.kind());
    assert!(engine.status(&id).is_none(), "no session may be registered");

    assert!(matches!(events.try_recv().unwrap(), DownloadEvent::Queued { .. }));
    match events.try_recv().unwrap() {
        DownloadEvent::Failed { error, .. } => assert_eq!(error.kind, ErrorKind::Storage),
        other => panic!("expected failure event, got {:?}", other),
    }

    // The origin never saw a request, and no state was persisted
    assert!(server.received_requests().await.unwrap().is_empty());
    let store = CheckpointStore::new(&root.path().join("state"));
    assert!(store.load_paused_snapshot(&id).is_none());

    engine.shutdown().await;
}

// =============================================================================
// Stop and preview
// =============================================================================

#[tokio::test]
async fn stop_cancels_and_deletes_the_snapshot() {
    let root = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let body = test_body(200_000);

    mount_head(&server, "/k.bin", body.len()).await;
    Mock::given(method("GET"))
        .and(path("/k.bin"))
        .respond_with(RangeResponder::new(body.clone()).with_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;

    let engine = DownloadEngine::new(test_config(root.path()).chunking(2, 65536, true)).unwrap();
    let mut events = engine.subscribe();

    let request = DownloadRequest::new(format!("{}/k.bin", server.uri()), "k.bin");
    let id = request.id.clone();
    engine.enqueue(request).await.unwrap();

    wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Started { handle } if handle.id == id),
        Duration::from_secs(5),
    )
    .await
    .expect("download should start");
    tokio::time::sleep(Duration::from_millis(100)).await;

    engine.stop(&id).await.expect("stop failed");

    let cancelled = wait_for_event(
        &mut events,
        |e| matches!(e, DownloadEvent::Cancelled { handle } if handle.id == id),
        Duration::from_secs(5),
    )
    .await;
    assert!(cancelled.is_some());
    assert_eq!(engine.status(&id), Some(DownloadStatus::Cancelled));

    let store = CheckpointStore::new(&root.path().join("state"));
    assert!(store.load_paused_snapshot(&id).is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn preview_destination_is_side_effect_free() {
    let root = TempDir::new().unwrap();
    let engine = DownloadEngine::new(test_config(root.path())).unwrap();

    let request = DownloadRequest::new("https://example.com/x.bin", "x.bin");
    let resolution = engine.preview_destination(&request).unwrap();

    assert_eq!(resolution.file, root.path().join("out/x.bin"));
    assert!(!resolution.file.exists(), "dry-run must not create the file");

    engine.shutdown().await;
}
