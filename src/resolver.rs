//! Storage resolution
//!
//! Picks the directory and target file for a download before any network
//! I/O happens: walks the configured destination candidates in order,
//! applies the overwrite policy, validates free space, and (outside
//! dry-run) prepares the empty target file.

use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

use crate::config::StorageConfig;
use crate::error::{DownloadError, Result};
use crate::types::{DownloadDestination, DownloadRequest, StorageResolution};

/// Resolves a writable target for each request
#[derive(Debug, Clone)]
pub struct StorageResolver {
    storage: StorageConfig,
    /// App-writable base for `Scoped` destinations and the Auto fallback
    data_dir: PathBuf,
}

impl StorageResolver {
    pub fn new(storage: StorageConfig, data_dir: PathBuf) -> Self {
        Self { storage, data_dir }
    }

    /// Resolve storage for a request.
    ///
    /// Dry-run performs every check but skips the destructive steps:
    /// nothing is created or deleted, `overwrote_existing` reports what a
    /// real run would do.
    pub fn resolve(&self, request: &DownloadRequest, dry_run: bool) -> Result<StorageResolution> {
        let directory = self.pick_directory(request, dry_run)?;
        let file = directory.join(&request.file_name);

        let mut overwrote_existing = false;
        if file.exists() {
            if !self.storage.overwrite_existing {
                return Err(DownloadError::storage(
                    &file,
                    "target file exists and overwrite is disabled",
                ));
            }
            overwrote_existing = true;
            if !dry_run {
                fs::remove_file(&file).map_err(|e| {
                    DownloadError::storage(&file, format!("failed to remove existing file: {}", e))
                })?;
            }
        }

        if self.storage.validate_free_space {
            self.check_free_space(&directory)?;
        }

        if !dry_run {
            fs::File::create(&file).map_err(|e| {
                DownloadError::storage(&file, format!("failed to create target file: {}", e))
            })?;
        }

        Ok(StorageResolution {
            directory,
            file,
            overwrote_existing,
        })
    }

    /// First usable directory across the destination list. The configured
    /// destinations are expanded in order; a request carrying its own
    /// destination narrows the list to that single entry.
    fn pick_directory(&self, request: &DownloadRequest, dry_run: bool) -> Result<PathBuf> {
        let destinations: &[DownloadDestination] = match &request.destination {
            Some(destination) => std::slice::from_ref(destination),
            None => &self.storage.destinations,
        };

        let mut candidates = Vec::new();
        for destination in destinations {
            candidates.extend(self.candidate_dirs(destination));
        }

        for candidate in &candidates {
            if dir_usable(candidate, dry_run) {
                return Ok(candidate.clone());
            }
        }
        Err(DownloadError::storage(
            candidates.first().cloned().unwrap_or_default(),
            "no writable directory among destination candidates",
        ))
    }

    fn candidate_dirs(&self, destination: &DownloadDestination) -> Vec<PathBuf> {
        match destination {
            DownloadDestination::Auto => {
                let mut candidates = Vec::new();
                if let Some(dir) = dirs::download_dir() {
                    candidates.push(dir);
                }
                if let Some(dir) = dirs::document_dir() {
                    candidates.push(dir);
                }
                candidates.push(self.data_dir.join("downloads"));
                candidates
            }
            DownloadDestination::Custom(path) => vec![path.clone()],
            DownloadDestination::Scoped(rel) => vec![self.data_dir.join(rel)],
        }
    }

    fn check_free_space(&self, directory: &Path) -> Result<()> {
        match available_disk_space(directory) {
            Some(available) if available < self.storage.min_free_space_bytes => {
                Err(DownloadError::storage(
                    directory,
                    format!(
                        "insufficient space: {} bytes available, {} required",
                        available, self.storage.min_free_space_bytes
                    ),
                ))
            }
            Some(_) => Ok(()),
            None => {
                // No mount point matched; skip the check rather than fail
                tracing::debug!("Free space for {:?} could not be determined", directory);
                Ok(())
            }
        }
    }
}

/// A directory qualifies when it exists and is writable, or can be created.
/// In dry-run nothing is created; creatability is judged from the nearest
/// existing ancestor.
fn dir_usable(dir: &Path, dry_run: bool) -> bool {
    if dir.is_dir() {
        return is_writable(dir);
    }
    if dry_run {
        let ancestor = nearest_existing_path(dir);
        return ancestor.is_dir() && is_writable(&ancestor);
    }
    fs::create_dir_all(dir).is_ok()
}

fn is_writable(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

/// Available bytes on the filesystem holding `path`, from the longest
/// matching mount point
fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }

    best.map(|(_, available)| available)
}
