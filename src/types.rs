//! Core types for chute-dl
//!
//! This module contains the fundamental data types used throughout the
//! download engine: requests, handles, chunk bookkeeping, persisted
//! snapshots, progress reports and lifecycle events.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{DownloadError, ErrorKind};

/// Where a download should be written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "path", rename_all = "lowercase")]
pub enum DownloadDestination {
    /// Platform downloads directory, falling back to documents, then an
    /// app-internal `downloads` folder
    Auto,
    /// Exact directory, absolute path
    Custom(PathBuf),
    /// Relative path under the app-writable base directory
    Scoped(PathBuf),
}

/// Digest algorithm for checksum verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    #[default]
    Sha256,
    Sha512,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Md5 => write!(f, "MD5"),
            Self::Sha256 => write!(f, "SHA256"),
            Self::Sha512 => write!(f, "SHA512"),
        }
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(format!("Unsupported checksum algorithm: {}", s)),
        }
    }
}

/// An immutable download request. The `id` is the handle key through the
/// whole system, stable across pause/resume and process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub id: String,
    pub url: String,
    pub file_name: String,
    /// Overrides the engine's configured destination list when set; `None`
    /// resolves through `StorageConfig.destinations` in order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<DownloadDestination>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Expected hex digest of the finished file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_checksum: Option<String>,
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
}

impl DownloadRequest {
    /// Create a request with a random UUID id, resolved through the
    /// engine's configured destinations
    pub fn new(url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            file_name: file_name.into(),
            destination: None,
            headers: HashMap::new(),
            expected_checksum: None,
            checksum_algorithm: ChecksumAlgorithm::default(),
        }
    }

    /// Use a caller-supplied id instead of a random UUID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Route this request to a specific destination instead of the
    /// engine's configured list
    pub fn with_destination(mut self, destination: DownloadDestination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_checksum(mut self, algorithm: ChecksumAlgorithm, hex_digest: impl Into<String>) -> Self {
        self.checksum_algorithm = algorithm;
        self.expected_checksum = Some(hex_digest.into());
        self
    }
}

/// Opaque reference callers use to pause/resume/stop a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadHandle {
    pub id: String,
    pub source_url: String,
}

impl DownloadHandle {
    pub fn new(request: &DownloadRequest) -> Self {
        Self {
            id: request.id.clone(),
            source_url: request.url.clone(),
        }
    }
}

impl std::fmt::Display for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Resolved storage target for a download, produced by the storage resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResolution {
    /// Directory the file lives in
    pub directory: PathBuf,
    /// Absolute path of the target file
    pub file: PathBuf,
    /// Whether an existing file was (or would be, in dry-run) replaced
    pub overwrote_existing: bool,
}

/// Durable per-chunk progress record.
///
/// Invariant: `start <= next_offset <= end_inclusive + 1` for bounded
/// chunks. `next_offset == end_inclusive + 1` means the chunk is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkState {
    pub index: u32,
    pub start: u64,
    /// `None` for the single unbounded chunk of an unknown-length download
    pub end_inclusive: Option<u64>,
    /// Next byte to fetch; the minimum byte to refetch on resume
    pub next_offset: u64,
}

impl ChunkState {
    pub fn new(index: u32, start: u64, end_inclusive: Option<u64>, next_offset: u64) -> Self {
        Self {
            index,
            start,
            end_inclusive,
            next_offset,
        }
    }

    /// Whether every byte of this chunk has been written
    pub fn is_complete(&self) -> bool {
        match self.end_inclusive {
            Some(end) => self.next_offset >= end + 1,
            None => false,
        }
    }

    /// Bytes already written for this chunk
    pub fn completed_bytes(&self) -> u64 {
        self.next_offset.saturating_sub(self.start)
    }

    /// Bytes still outstanding, when bounded
    pub fn remaining(&self) -> Option<u64> {
        self.end_inclusive
            .map(|end| (end + 1).saturating_sub(self.next_offset))
    }

    /// Total completed bytes across a set of chunk states. A single
    /// unbounded chunk reports its absolute offset; bounded chunks report
    /// `next_offset - start` each.
    pub fn total_completed(states: &[ChunkState]) -> u64 {
        if states.len() == 1 && states[0].end_inclusive.is_none() {
            return states[0].next_offset;
        }
        states.iter().map(|s| s.completed_bytes()).sum()
    }
}

/// Snapshot persisted on pause (and periodically while running) so a
/// download survives process restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedSnapshot {
    pub handle_id: String,
    pub request: DownloadRequest,
    pub resolution: StorageResolution,
    pub completed_bytes: u64,
    pub chunk_states: Vec<ChunkState>,
}

/// Derived progress report delivered to listeners
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    /// Bytes written so far, across all chunks
    pub bytes_downloaded: u64,
    /// Total payload size, once known
    pub total_bytes: Option<u64>,
    /// Chunk whose byte delta triggered this report
    pub chunk_index: u32,
    /// Smoothed transfer rate
    pub bytes_per_second: Option<u64>,
    pub remaining_bytes: Option<u64>,
    /// 0.0 - 100.0, only when the total is known
    pub percent: Option<f64>,
}

/// Externally observable state of a download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Accepted, storage not yet resolved or task not yet running
    Queued,
    /// Actively transferring
    Running { progress: DownloadProgress },
    /// Locally torn down with a snapshot on disk, waiting for resume
    Paused,
    /// Finished and verified
    Completed { file: PathBuf },
    /// Terminal failure
    Failed { error: FailureInfo },
    /// Stopped by the user
    Cancelled,
}

impl DownloadStatus {
    /// Whether the download may still make progress without a resume call
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Failure payload carried by `Failed` events and statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Individual failed-check descriptions for integrity failures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl From<&DownloadError> for FailureInfo {
    fn from(err: &DownloadError) -> Self {
        let failures = match err {
            DownloadError::Integrity { failures } => failures.clone(),
            _ => Vec::new(),
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            failures,
        }
    }
}

/// Lifecycle events emitted by the download engine.
///
/// For a single handle the stream is: exactly one `Queued`, at most one
/// `Started`, any number of `Progress`/`Retry`, balanced `Paused`/`Resumed`
/// pairs, then exactly one of `Completed`, `Failed` or `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadEvent {
    Queued { handle: DownloadHandle },
    Started { handle: DownloadHandle },
    Progress {
        handle: DownloadHandle,
        progress: DownloadProgress,
    },
    Paused { handle: DownloadHandle },
    Resumed { handle: DownloadHandle },
    Retry { handle: DownloadHandle, attempt: u32 },
    Completed { handle: DownloadHandle },
    Failed {
        handle: DownloadHandle,
        error: FailureInfo,
    },
    Cancelled { handle: DownloadHandle },
}

impl DownloadEvent {
    /// Handle this event belongs to
    pub fn handle(&self) -> &DownloadHandle {
        match self {
            Self::Queued { handle }
            | Self::Started { handle }
            | Self::Progress { handle, .. }
            | Self::Paused { handle }
            | Self::Resumed { handle }
            | Self::Retry { handle, .. }
            | Self::Completed { handle }
            | Self::Failed { handle, .. }
            | Self::Cancelled { handle } => handle,
        }
    }
}

/// Lifecycle callback surface. Implement any subset; every method has a
/// no-op default. Callbacks must not block: they run on the engine's event
/// path.
pub trait DownloadListener: Send + Sync {
    fn on_queued(&self, _handle: &DownloadHandle) {}
    fn on_started(&self, _handle: &DownloadHandle) {}
    fn on_progress(&self, _handle: &DownloadHandle, _progress: &DownloadProgress) {}
    fn on_paused(&self, _handle: &DownloadHandle) {}
    fn on_resumed(&self, _handle: &DownloadHandle) {}
    fn on_retry(&self, _handle: &DownloadHandle, _attempt: u32) {}
    fn on_completed(&self, _handle: &DownloadHandle) {}
    fn on_failed(&self, _handle: &DownloadHandle, _error: &FailureInfo) {}
    fn on_cancelled(&self, _handle: &DownloadHandle) {}
}
