//! # chute-dl
//!
//! A resumable, chunked HTTP download engine with persistent session state.
//!
//! ## Features
//!
//! - **Parallel range fetches**: payloads split into byte-range chunks,
//!   each streamed by its own task through positional writes
//! - **Byte-accurate resume**: per-chunk checkpoints persisted as JSON;
//!   paused downloads survive process restarts
//! - **Retry with classification**: network faults resume from checkpoints,
//!   integrity faults restart from byte zero with exponential backoff
//! - **Integrity verification**: size, MD5/SHA-256/SHA-512 digest,
//!   content-type and archive-shape checks before a download completes
//! - **Lifecycle events**: a listener surface plus a broadcast channel
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use chute_dl::{DownloadEngine, DownloadRequest, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = DownloadEngine::new(EngineConfig::default())?;
//!
//!     let request = DownloadRequest::new("https://example.com/file.zip", "file.zip");
//!     let handle = engine.enqueue(request).await?;
//!
//!     let mut events = engine.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}: {:?}", handle.id, event);
//!     }
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod integrity;
pub mod planner;
pub mod progress;
pub mod resolver;
pub mod scheduler;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use checkpoint::CheckpointStore;
pub use config::{ChunkingConfig, EngineConfig, IntegrityConfig, RetryPolicy, StorageConfig};
pub use engine::DownloadEngine;
pub use error::{DownloadError, ErrorKind, Result};
pub use fetcher::ChunkStateTable;
pub use integrity::{IntegrityReport, IntegrityVerifier, SignatureVerifier};
pub use planner::{plan_chunks, ChunkPlan};
pub use progress::ProgressAggregator;
pub use resolver::StorageResolver;
pub use scheduler::Scheduler;
pub use transport::Transport;
pub use types::{
    ChecksumAlgorithm, ChunkState, DownloadDestination, DownloadEvent, DownloadHandle,
    DownloadListener, DownloadProgress, DownloadRequest, DownloadStatus, FailureInfo,
    PausedSnapshot, StorageResolution,
};
