//! Parallel range fetching
//!
//! One task per planned chunk, gated by a per-session semaphore. Each task
//! streams its byte range and writes at absolute offsets through a shared
//! read-write file handle; chunks never overlap, so writers never contend
//! for the same byte. Progress deltas go to the aggregator and every write
//! advances the chunk's in-memory checkpoint.

use bytes::{Buf, Bytes};
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::StatusCode;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::ChunkingConfig;
use crate::error::{DownloadError, Result};
use crate::planner::{plan_chunks, ChunkPlan};
use crate::progress::ProgressAggregator;
use crate::transport::{parse_content_range, Transport};
use crate::types::{ChunkState, DownloadProgress, DownloadRequest, StorageResolution};

/// Live per-chunk checkpoint table.
///
/// Single writer per index: only the fetcher of chunk `i` updates slot `i`.
/// Readers (checkpoint flusher, pause handler) take per-slot consistent
/// snapshots.
#[derive(Debug, Default)]
pub struct ChunkStateTable {
    slots: RwLock<BTreeMap<u32, ChunkState>>,
}

impl ChunkStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with the initial states of an attempt's plans
    pub fn seed(&self, plans: &[ChunkPlan]) {
        let mut slots = self.slots.write();
        slots.clear();
        for plan in plans {
            slots.insert(plan.index, plan.to_state());
        }
    }

    /// Replace the table with explicit states (used when nothing is left
    /// to fetch but the snapshot must stay truthful)
    pub fn seed_states(&self, states: &[ChunkState]) {
        let mut slots = self.slots.write();
        slots.clear();
        for state in states {
            slots.insert(state.index, *state);
        }
    }

    pub fn update(&self, state: ChunkState) {
        self.slots.write().insert(state.index, state);
    }

    /// Current states in ascending index order
    pub fn snapshot(&self) -> Vec<ChunkState> {
        self.slots.read().values().copied().collect()
    }

    /// Bytes completed across all chunks (see [`ChunkState::total_completed`])
    pub fn completed_bytes(&self) -> u64 {
        ChunkState::total_completed(&self.snapshot())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

/// What one attempt learned about the payload
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub total_bytes: Option<u64>,
    pub content_type: Option<String>,
}

/// Everything one attempt needs, owned by the retry driver
pub(crate) struct FetchContext {
    pub transport: Arc<Transport>,
    pub request: DownloadRequest,
    pub resolution: StorageResolution,
    pub chunking: ChunkingConfig,
    pub states: Arc<ChunkStateTable>,
    pub aggregator: Arc<ProgressAggregator>,
    pub cancel: CancellationToken,
    /// Wakes the coalescing checkpoint flusher
    pub checkpoint_dirty: Arc<Notify>,
    pub on_progress: Arc<dyn Fn(DownloadProgress) + Send + Sync>,
}

/// State shared by every chunk task of one attempt
struct ChunkShared {
    transport: Arc<Transport>,
    request: DownloadRequest,
    file: Arc<std::fs::File>,
    file_path: PathBuf,
    states: Arc<ChunkStateTable>,
    aggregator: Arc<ProgressAggregator>,
    cancel: CancellationToken,
    dirty: Arc<Notify>,
    on_progress: Arc<dyn Fn(DownloadProgress) + Send + Sync>,
    content_type: OnceLock<String>,
}

/// Run one fetch attempt: probe, plan, then fetch all outstanding chunks.
pub(crate) async fn run(
    ctx: FetchContext,
    start_offset: u64,
    prior_states: &[ChunkState],
) -> Result<FetchOutcome> {
    // Length probe. 405/501 come back as "unknown length"; hard failures
    // are network errors and retryable.
    let probe = tokio::select! {
        result = ctx.transport.head(&ctx.request.url, &ctx.request.headers) => result?,
        _ = ctx.cancel.cancelled() => return Err(DownloadError::Cancelled),
    };

    let total = probe.total_bytes.or_else(|| derived_total(prior_states));
    if let Some(total) = total {
        ctx.aggregator.set_total_bytes(total);
    }

    let plans = plan_chunks(total, &ctx.chunking, start_offset, prior_states);

    if plans.is_empty() {
        // Every chunk is already complete; keep the checkpoint truthful
        // and let verification decide.
        ctx.states.seed_states(prior_states);
        return Ok(FetchOutcome {
            total_bytes: ctx.aggregator.total_bytes(),
            content_type: probe.content_type,
        });
    }

    ctx.states.seed(&plans);
    ctx.checkpoint_dirty.notify_one();

    let file = open_target(&ctx.resolution.file).await?;

    let parallel = ctx.chunking.prefer_parallel && plans.len() > 1;
    let permits = if parallel {
        (ctx.chunking.chunk_count as usize).min(plans.len())
    } else {
        1
    };
    let semaphore = Arc::new(Semaphore::new(permits));

    let shared = Arc::new(ChunkShared {
        transport: Arc::clone(&ctx.transport),
        request: ctx.request.clone(),
        file,
        file_path: ctx.resolution.file.clone(),
        states: Arc::clone(&ctx.states),
        aggregator: Arc::clone(&ctx.aggregator),
        cancel: ctx.cancel.clone(),
        dirty: Arc::clone(&ctx.checkpoint_dirty),
        on_progress: Arc::clone(&ctx.on_progress),
        content_type: OnceLock::new(),
    });

    let mut handles = Vec::with_capacity(plans.len());
    for plan in plans {
        let shared = Arc::clone(&shared);
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| DownloadError::Cancelled)?;
            fetch_chunk(&shared, plan).await
        }));
    }

    let mut failure: Option<DownloadError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => merge_failure(&mut failure, e),
            Err(e) => merge_failure(
                &mut failure,
                DownloadError::network(format!("chunk task failed: {}", e)),
            ),
        }
    }

    if ctx.cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }
    if let Some(error) = failure {
        return Err(error);
    }

    // Make the written ranges durable before verification runs
    {
        let file = Arc::clone(&shared.file);
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|e| DownloadError::storage(&ctx.resolution.file, format!("sync failed: {}", e)))?
            .map_err(|e| DownloadError::storage(&ctx.resolution.file, format!("sync failed: {}", e)))?;
    }

    (ctx.on_progress)(ctx.aggregator.snapshot(0));

    Ok(FetchOutcome {
        total_bytes: ctx.aggregator.total_bytes(),
        content_type: shared
            .content_type
            .get()
            .cloned()
            .or(probe.content_type),
    })
}

/// Total length implied by a fully bounded set of prior chunk states
fn derived_total(states: &[ChunkState]) -> Option<u64> {
    if states.is_empty() || states.iter().any(|s| s.end_inclusive.is_none()) {
        return None;
    }
    states.iter().filter_map(|s| s.end_inclusive).max().map(|end| end + 1)
}

async fn open_target(path: &std::path::Path) -> Result<Arc<std::fs::File>> {
    let open_path = path.to_path_buf();
    let file = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&open_path)
    })
    .await
    .map_err(|e| DownloadError::storage(path, format!("failed to open target file: {}", e)))?
    .map_err(|e| DownloadError::storage(path, format!("failed to open target file: {}", e)))?;
    Ok(Arc::new(file))
}

/// Fetch a single chunk: one GET, streamed to disk at absolute offsets.
async fn fetch_chunk(shared: &ChunkShared, plan: ChunkPlan) -> Result<()> {
    if shared.cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let range = match plan.end_inclusive {
        Some(end) => Some((plan.resume_offset, Some(end))),
        None if plan.resume_offset > 0 => Some((plan.resume_offset, None)),
        None => None,
    };
    let ranged = range.is_some();

    let response = tokio::select! {
        result = shared.transport.get(&shared.request.url, &shared.request.headers, range) => result?,
        _ = shared.cancel.cancelled() => return Err(DownloadError::Cancelled),
    };

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::from_status(
            status.as_u16(),
            &format!("chunk {} request", plan.index),
        ));
    }

    if let Some(ct) = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
    {
        let _ = shared.content_type.set(ct.to_string());
    }

    let mut position = plan.resume_offset;
    // Body bytes to discard before the slice begins (only when the origin
    // ignored our Range and streamed the payload from byte zero)
    let mut skip: u64 = 0;

    if ranged && status == StatusCode::PARTIAL_CONTENT {
        let content_range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        if let Some((range_start, _, range_total)) = content_range {
            if range_start != plan.resume_offset {
                return Err(DownloadError::network(format!(
                    "chunk {}: Content-Range starts at {} instead of {}",
                    plan.index, range_start, plan.resume_offset
                )));
            }
            if let Some(total) = range_total {
                shared.aggregator.set_total_bytes(total);
            }
        }
    } else if ranged {
        // 200 to a ranged request: the origin ignored the range and is
        // sending the whole payload. Restart this chunk at its slice start
        // and drop everything before it.
        position = plan.start;
        skip = plan.start;
        shared.states.update(ChunkState::new(
            plan.index,
            plan.start,
            plan.end_inclusive,
            plan.start,
        ));
        shared.dirty.notify_one();
        if let Some(len) = response.content_length() {
            shared.aggregator.set_total_bytes(len);
        }
    } else if plan.start == 0 {
        if let Some(len) = response.content_length() {
            shared.aggregator.set_total_bytes(len);
        }
    }

    let limit = plan.end_inclusive.map(|end| end + 1);
    let mut stream = response.bytes_stream();

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = shared.cancel.cancelled() => return Err(DownloadError::Cancelled),
        };
        let Some(item) = item else { break };

        let mut chunk: Bytes = item.map_err(|e| {
            DownloadError::network(format!("chunk {} stream error: {}", plan.index, e))
        })?;

        if skip > 0 {
            let discard = skip.min(chunk.len() as u64) as usize;
            chunk.advance(discard);
            skip -= discard as u64;
            if chunk.is_empty() {
                continue;
            }
        }

        if let Some(limit) = limit {
            let room = limit.saturating_sub(position);
            if room == 0 {
                break;
            }
            if chunk.len() as u64 > room {
                chunk.truncate(room as usize);
            }
        }

        let written = chunk.len() as u64;
        write_all_at(&shared.file, position, chunk).await.map_err(|e| {
            DownloadError::storage(
                &shared.file_path,
                format!("write at offset {} failed: {}", position, e),
            )
        })?;
        position += written;

        shared.states.update(ChunkState::new(
            plan.index,
            plan.start,
            plan.end_inclusive,
            position,
        ));
        shared.dirty.notify_one();

        if let Some(progress) = shared.aggregator.record(plan.index, written) {
            (shared.on_progress)(progress);
        }

        if limit == Some(position) {
            // Slice complete; any remaining body (ignored-range case) is
            // dropped with the response.
            break;
        }
    }

    if let Some(limit) = limit {
        if position < limit {
            return Err(DownloadError::network(format!(
                "chunk {}: stream ended at offset {} before {}",
                plan.index, position, limit
            )));
        }
    }

    Ok(())
}

/// Keep the most decisive error: terminal kinds beat retryable ones,
/// cancellation loses to everything (the token records it anyway).
fn merge_failure(current: &mut Option<DownloadError>, candidate: DownloadError) {
    fn severity(e: &DownloadError) -> u8 {
        match e {
            DownloadError::Cancelled => 0,
            DownloadError::Network { .. } => 1,
            DownloadError::Integrity { .. } => 2,
            DownloadError::Storage { .. } | DownloadError::NotFound(_) => 3,
            DownloadError::Permanent { .. } => 4,
        }
    }
    match current {
        Some(existing) if severity(existing) >= severity(&candidate) => {}
        _ => *current = Some(candidate),
    }
}

/// Positional write through the shared handle; never touches the file
/// cursor, so concurrent chunk writers cannot interleave.
async fn write_all_at(file: &Arc<std::fs::File>, offset: u64, data: Bytes) -> std::io::Result<()> {
    let file = Arc::clone(file);
    tokio::task::spawn_blocking(move || write_all_at_sync(&file, offset, &data))
        .await
        .map_err(|e| std::io::Error::other(e))?
}

#[cfg(unix)]
fn write_all_at_sync(file: &std::fs::File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at_sync(file: &std::fs::File, mut offset: u64, mut data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let written = file.seek_write(data, offset)?;
        offset += written as u64;
        data = &data[written..];
    }
    Ok(())
}
