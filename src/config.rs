//! Engine configuration
//!
//! Plain immutable records with builder-style construction. Defaults apply
//! whenever a field is omitted; out-of-range values are clamped at
//! construction rather than rejected.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::integrity::SignatureVerifier;
use crate::types::{DownloadDestination, DownloadListener};

/// Lower bound for the chunk size, 64 KiB
pub const MIN_CHUNK_SIZE_FLOOR: u64 = 64 * 1024;

/// How a payload is split into parallel byte ranges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingConfig {
    /// Maximum number of chunks (and parallel fetchers)
    pub chunk_count: u32,
    /// Never split below this size; clamped to at least 64 KiB
    pub min_chunk_size_bytes: u64,
    /// Fetch chunks in parallel when the plan has more than one
    pub prefer_parallel: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_count: 3,
            min_chunk_size_bytes: 512 * 1024,
            prefer_parallel: true,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_count: u32, min_chunk_size_bytes: u64, prefer_parallel: bool) -> Self {
        Self {
            chunk_count: chunk_count.max(1),
            min_chunk_size_bytes: min_chunk_size_bytes.max(MIN_CHUNK_SIZE_FLOOR),
            prefer_parallel,
        }
    }
}

/// Retry driver parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Multiplier applied after every retry; clamped to at least 1.0
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms,
            backoff_multiplier: backoff_multiplier.max(1.0),
        }
    }

    /// Next delay after a failed attempt. Never drops below one second.
    pub fn next_delay_ms(&self, current_ms: u64) -> u64 {
        ((current_ms as f64 * self.backoff_multiplier) as u64).max(1000)
    }
}

/// Destination selection and target-file policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Candidate destinations, expanded and tried in order during storage
    /// resolution. A request carrying its own destination narrows the
    /// search to that entry.
    pub destinations: Vec<DownloadDestination>,
    /// Replace an existing file with the same name
    pub overwrite_existing: bool,
    /// Check filesystem free space before downloading
    pub validate_free_space: bool,
    /// Minimum free bytes required when validation is enabled
    pub min_free_space_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            destinations: vec![DownloadDestination::Auto],
            overwrite_existing: false,
            validate_free_space: true,
            min_free_space_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Which post-download checks run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityConfig {
    pub verify_file_size: bool,
    pub verify_checksum: bool,
    pub verify_archive_structure: bool,
    pub verify_content_type: bool,
    pub verify_signature: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            verify_file_size: true,
            verify_checksum: true,
            verify_archive_structure: true,
            verify_content_type: false,
            verify_signature: false,
        }
    }
}

/// Main configuration for the download engine
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub integrity: IntegrityConfig,

    /// Directory holding `downloads-state/`; defaults to the platform data
    /// dir under `chute-dl`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Connect timeout for the shared HTTP client, seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-read timeout for response bodies, seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Lifecycle listeners; process-local, never persisted
    #[serde(skip)]
    pub listeners: Vec<Arc<dyn DownloadListener>>,

    /// Host-provided payload signature verifier; process-local
    #[serde(skip)]
    pub signature_verifier: Option<Arc<dyn SignatureVerifier>>,
}

fn default_user_agent() -> String {
    format!("chute-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            retry: RetryPolicy::default(),
            storage: StorageConfig::default(),
            integrity: IntegrityConfig::default(),
            state_dir: None,
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            listeners: Vec::new(),
            signature_verifier: None,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("chunking", &self.chunking)
            .field("retry", &self.retry)
            .field("storage", &self.storage)
            .field("integrity", &self.integrity)
            .field("state_dir", &self.state_dir)
            .field("user_agent", &self.user_agent)
            .field("listeners", &self.listeners.len())
            .field("signature_verifier", &self.signature_verifier.is_some())
            .finish()
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunking parameters (count clamped to >= 1, min size to >= 64 KiB)
    pub fn chunking(mut self, chunk_count: u32, min_chunk_size_bytes: u64, prefer_parallel: bool) -> Self {
        self.chunking = ChunkingConfig::new(chunk_count, min_chunk_size_bytes, prefer_parallel);
        self
    }

    /// Set the retry policy (attempts clamped to >= 1, multiplier to >= 1.0)
    pub fn retry(mut self, max_attempts: u32, initial_delay_ms: u64, backoff_multiplier: f64) -> Self {
        self.retry = RetryPolicy::new(max_attempts, initial_delay_ms, backoff_multiplier);
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn integrity(mut self, integrity: IntegrityConfig) -> Self {
        self.integrity = integrity;
        self
    }

    pub fn state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(path.into());
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Register a lifecycle listener
    pub fn listener(mut self, listener: Arc<dyn DownloadListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn signature_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.signature_verifier = Some(verifier);
        self
    }

    /// Effective state directory (`<base>/downloads-state` lives under this)
    pub fn effective_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chute-dl")
        })
    }
}
