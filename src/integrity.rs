//! Post-download integrity verification
//!
//! Runs the enabled checks in a fixed order against the finished file:
//! size, digest, content type, archive shape, and a host-delegated
//! signature check. Each failed check contributes one description to the
//! report; the engine turns a non-empty report into an integrity error and
//! restarts from byte zero.

use md5::{Digest, Md5};
use sha2::{Sha256, Sha512};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::config::IntegrityConfig;
use crate::error::{DownloadError, Result};
use crate::transport::primary_media_type;
use crate::types::{ChecksumAlgorithm, DownloadRequest};

/// File extensions subject to the archive-shape check
const ARCHIVE_EXTENSIONS: [&str; 2] = ["apk", "apks"];

/// Android archive manifest entry
const MANIFEST_ENTRY: &str = "META-INF/MANIFEST.MF";

/// Host-provided payload signature verifier. The engine never interprets
/// signatures itself; with `verify_signature` enabled and no verifier
/// configured, verification fails.
pub trait SignatureVerifier: Send + Sync {
    /// Return `Err` with a human-readable reason when the signature is bad
    fn verify(&self, file: &Path, request: &DownloadRequest) -> std::result::Result<(), String>;
}

/// Outcome of a verification pass
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Failed-check descriptions, in check order
    pub failures: Vec<String>,
    /// Non-fatal observations (e.g. a missing archive manifest)
    pub warnings: Vec<String>,
}

impl IntegrityReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the configured checks against a finished download
pub struct IntegrityVerifier {
    config: IntegrityConfig,
    signature_verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl IntegrityVerifier {
    pub fn new(config: IntegrityConfig, signature_verifier: Option<Arc<dyn SignatureVerifier>>) -> Self {
        Self {
            config,
            signature_verifier,
        }
    }

    /// Verify `file` against the request and the observed response
    /// metadata. Disabled checks are skipped, enabled checks run in order
    /// and all contribute to the report.
    pub async fn verify(
        &self,
        file: &Path,
        request: &DownloadRequest,
        expected_size: Option<u64>,
        content_type: Option<&str>,
    ) -> IntegrityReport {
        let mut report = IntegrityReport::default();

        if self.config.verify_file_size {
            self.check_size(file, expected_size, &mut report).await;
        }

        if self.config.verify_checksum {
            if let Some(expected) = &request.expected_checksum {
                self.check_digest(file, request.checksum_algorithm, expected, &mut report)
                    .await;
            }
        }

        if self.config.verify_content_type {
            check_content_type(file, content_type, &mut report);
        }

        if self.config.verify_archive_structure && is_archive_file(file) {
            check_archive_shape(file, &mut report).await;
        }

        if self.config.verify_signature {
            match &self.signature_verifier {
                Some(verifier) => {
                    if let Err(reason) = verifier.verify(file, request) {
                        report.failures.push(format!("Signature verification failed: {}", reason));
                    }
                }
                None => {
                    report
                        .failures
                        .push("Signature verification enabled but no verifier configured".to_string());
                }
            }
        }

        report
    }

    async fn check_size(&self, file: &Path, expected_size: Option<u64>, report: &mut IntegrityReport) {
        let Some(expected) = expected_size else {
            return; // length never became known; nothing to compare
        };
        match tokio::fs::metadata(file).await {
            Ok(metadata) if metadata.len() == expected => {}
            Ok(metadata) => {
                report.failures.push(format!(
                    "File size mismatch: expected {} bytes, found {}",
                    expected,
                    metadata.len()
                ));
            }
            Err(e) => {
                report
                    .failures
                    .push(format!("File size check failed: {}", e));
            }
        }
    }

    async fn check_digest(
        &self,
        file: &Path,
        algorithm: ChecksumAlgorithm,
        expected: &str,
        report: &mut IntegrityReport,
    ) {
        match compute_checksum(file, algorithm).await {
            Ok(actual) => {
                if !actual.eq_ignore_ascii_case(expected.trim()) {
                    report.failures.push(format!("Checksum mismatch ({})", algorithm));
                }
            }
            Err(e) => {
                report.failures.push(format!("Checksum computation failed: {}", e));
            }
        }
    }
}

/// Compute the hex digest of a file with the given algorithm
pub async fn compute_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    match algorithm {
        ChecksumAlgorithm::Md5 => digest_file::<Md5>(path).await,
        ChecksumAlgorithm::Sha256 => digest_file::<Sha256>(path).await,
        ChecksumAlgorithm::Sha512 => digest_file::<Sha512>(path).await,
    }
}

async fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let mut file = File::open(path).await.map_err(|e| {
        DownloadError::storage(path, format!("failed to open file for checksum: {}", e))
    })?;

    let mut hasher = D::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await.map_err(|e| {
            DownloadError::storage(path, format!("failed to read file for checksum: {}", e))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn is_archive_file(file: &Path) -> bool {
    file.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ARCHIVE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expected media type derived from the file extension; only archive-style
/// families participate in the content-type check.
fn expected_media_type(file: &Path) -> Option<&'static str> {
    match file.extension().and_then(|e| e.to_str())?.to_ascii_lowercase().as_str() {
        "apk" | "apks" => Some("application/vnd.android.package-archive"),
        "zip" => Some("application/zip"),
        _ => None,
    }
}

fn check_content_type(file: &Path, content_type: Option<&str>, report: &mut IntegrityReport) {
    let (Some(expected), Some(received)) = (expected_media_type(file), content_type) else {
        return;
    };
    let received = primary_media_type(received);
    if received != expected {
        report.failures.push(format!(
            "Content type mismatch: expected {}, received {}",
            expected, received
        ));
    }
}

/// Magic-byte plus central-directory sanity check for apk/apks files
async fn check_archive_shape(path: &Path, report: &mut IntegrityReport) {
    // Leading local-file-header signature
    let mut magic = [0u8; 2];
    match File::open(path).await {
        Ok(mut file) => match file.read_exact(&mut magic).await {
            Ok(_) if &magic == b"PK" => {}
            Ok(_) => {
                report
                    .failures
                    .push("Archive check failed: missing PK signature".to_string());
                return;
            }
            Err(e) => {
                report
                    .failures
                    .push(format!("Archive check failed: {}", e));
                return;
            }
        },
        Err(e) => {
            report.failures.push(format!("Archive check failed: {}", e));
            return;
        }
    }

    // Central directory enumeration happens on the blocking pool
    let path: PathBuf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> std::result::Result<bool, String> {
        let file = std::fs::File::open(&path).map_err(|e| e.to_string())?;
        let archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
        if archive.len() == 0 {
            return Err("archive has no entries".to_string());
        }
        let has_manifest = archive.file_names().any(|name| name == MANIFEST_ENTRY);
        Ok(has_manifest)
    })
    .await;

    match result {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            report
                .warnings
                .push(format!("Archive is missing {}", MANIFEST_ENTRY));
        }
        Ok(Err(reason)) => {
            report
                .failures
                .push(format!("Archive check failed: {}", reason));
        }
        Err(e) => {
            report
                .failures
                .push(format!("Archive check failed: {}", e));
        }
    }
}
