//! Durable checkpoint store
//!
//! Persists the engine configuration and per-handle paused snapshots as
//! JSON files under a dedicated state directory:
//!
//! ```text
//! downloads-state/
//!   config.json
//!   paused_states/
//!     <handleId>.json
//! ```
//!
//! Writes are best-effort: an I/O failure degrades to "not saved" and is
//! logged, never propagated. Corrupt files read back as `None`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::types::PausedSnapshot;

/// Directory name under the app-writable state base
const STATE_DIR_NAME: &str = "downloads-state";
const CONFIG_FILE: &str = "config.json";
const PAUSED_DIR: &str = "paused_states";

/// File-backed store for config and paused-download snapshots
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at `<base>/downloads-state`
    pub fn new(base: &Path) -> Self {
        Self {
            root: base.join(STATE_DIR_NAME),
        }
    }

    /// The `downloads-state` directory itself
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    fn paused_dir(&self) -> PathBuf {
        self.root.join(PAUSED_DIR)
    }

    fn snapshot_path(&self, handle_id: &str) -> PathBuf {
        self.paused_dir().join(format!("{}.json", sanitize_id(handle_id)))
    }

    /// Persist the configuration (listeners are process-local and skipped
    /// by serialization). Best-effort.
    pub fn save_config(&self, config: &EngineConfig) {
        match serde_json::to_vec_pretty(config) {
            Ok(bytes) => write_atomic(&self.config_path(), &bytes),
            Err(e) => tracing::warn!("Failed to serialize config: {}", e),
        }
    }

    /// Load the persisted configuration, `None` on absent or corrupt
    pub fn load_config(&self) -> Option<EngineConfig> {
        read_json(&self.config_path())
    }

    /// Persist a paused snapshot for its handle. Best-effort.
    pub fn save_paused_snapshot(&self, snapshot: &PausedSnapshot) {
        match serde_json::to_vec_pretty(snapshot) {
            Ok(bytes) => write_atomic(&self.snapshot_path(&snapshot.handle_id), &bytes),
            Err(e) => {
                tracing::warn!(
                    "Failed to serialize snapshot for {}: {}",
                    snapshot.handle_id,
                    e
                );
            }
        }
    }

    /// Load one handle's snapshot, `None` on absent or corrupt
    pub fn load_paused_snapshot(&self, handle_id: &str) -> Option<PausedSnapshot> {
        read_json(&self.snapshot_path(handle_id))
    }

    /// Load every readable snapshot; corrupt files are skipped
    pub fn load_all_paused_snapshots(&self) -> Vec<PausedSnapshot> {
        let entries = match fs::read_dir(self.paused_dir()) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| read_json(&e.path()))
            .collect()
    }

    /// Delete a handle's snapshot. Best-effort; missing files are fine.
    pub fn remove_paused_snapshot(&self, handle_id: &str) {
        let path = self.snapshot_path(handle_id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("Failed to remove snapshot {:?}: {}", path, e);
            }
        }
    }
}

/// Handle ids are caller-supplied strings; keep them out of path syntax
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write via a temp file and rename so readers never observe a torn file
fn write_atomic(path: &Path, bytes: &[u8]) {
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        tracing::warn!("Checkpoint write to {:?} failed: {}", path, e);
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Ignoring corrupt state file {:?}: {}", path, e);
            None
        }
    }
}
