//! Progress aggregation
//!
//! Merges per-chunk byte deltas into a single smoothed rate, percentage and
//! remaining-bytes view, throttling emissions so listeners are not flooded
//! by every socket read.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::types::DownloadProgress;

/// Minimum wall-clock gap between throttled emissions
const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Byte step that forces an emission regardless of elapsed time
const MIN_EMIT_BYTES_STEP: u64 = 32 * 1024;

/// Smoothing factor for the rate estimate
const RATE_EWMA_ALPHA: f64 = 0.6;

struct RateState {
    last_emit: Instant,
    last_emit_bytes: u64,
    last_rate_at: Instant,
    last_rate_bytes: u64,
    smoothed_rate: Option<f64>,
}

/// Shared accumulator for one download attempt.
///
/// The byte counter is a single atomic; the rate/emission state sits behind
/// a mutex taken only on the throttled emission path.
pub struct ProgressAggregator {
    downloaded: AtomicU64,
    total: OnceLock<u64>,
    rate: Mutex<RateState>,
}

impl ProgressAggregator {
    /// Seed with the bytes already on disk before this attempt
    pub fn new(start_offset: u64) -> Self {
        let now = Instant::now();
        Self {
            downloaded: AtomicU64::new(start_offset),
            total: OnceLock::new(),
            rate: Mutex::new(RateState {
                last_emit: now,
                last_emit_bytes: start_offset,
                last_rate_at: now,
                last_rate_bytes: start_offset,
                smoothed_rate: None,
            }),
        }
    }

    /// Publish the payload length. Only the first value wins; later calls
    /// are ignored and return `false`.
    pub fn set_total_bytes(&self, total: u64) -> bool {
        self.total.set(total).is_ok()
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total.get().copied()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Record a byte delta from a chunk. Returns a progress report when an
    /// emission is due: enough time passed, enough bytes accumulated, the
    /// download just hit 100%, or the total is still unknown (every delta
    /// emits then).
    pub fn record(&self, chunk_index: u32, delta: u64) -> Option<DownloadProgress> {
        let downloaded = self.downloaded.fetch_add(delta, Ordering::Relaxed) + delta;
        let total = self.total_bytes();

        let now = Instant::now();
        let mut rate = self.rate.lock();

        let complete = total.is_some_and(|t| downloaded >= t);
        let due = total.is_none()
            || complete
            || now.duration_since(rate.last_emit) >= MIN_EMIT_INTERVAL
            || downloaded.saturating_sub(rate.last_emit_bytes) >= MIN_EMIT_BYTES_STEP;

        if !due {
            return None;
        }

        let speed = Self::update_rate(&mut rate, now, downloaded);
        rate.last_emit = now;
        rate.last_emit_bytes = downloaded;

        Some(Self::build(downloaded, total, chunk_index, speed))
    }

    /// Unthrottled report of the current state (used for the final emission)
    pub fn snapshot(&self, chunk_index: u32) -> DownloadProgress {
        let downloaded = self.bytes_downloaded();
        let speed = self.rate.lock().smoothed_rate.map(|r| r as u64);
        Self::build(downloaded, self.total_bytes(), chunk_index, speed)
    }

    /// EWMA over the raw rate since the previous sample. The first sample
    /// seeds the average directly.
    fn update_rate(rate: &mut RateState, now: Instant, downloaded: u64) -> Option<u64> {
        let elapsed = now.duration_since(rate.last_rate_at).as_secs_f64();
        if elapsed > 0.0 {
            let raw = downloaded.saturating_sub(rate.last_rate_bytes) as f64 / elapsed;
            rate.smoothed_rate = Some(match rate.smoothed_rate {
                Some(prev) => RATE_EWMA_ALPHA * raw + (1.0 - RATE_EWMA_ALPHA) * prev,
                None => raw,
            });
            rate.last_rate_at = now;
            rate.last_rate_bytes = downloaded;
        }
        rate.smoothed_rate.map(|r| r as u64)
    }

    fn build(
        downloaded: u64,
        total: Option<u64>,
        chunk_index: u32,
        speed: Option<u64>,
    ) -> DownloadProgress {
        let remaining = total.map(|t| t.saturating_sub(downloaded));
        let percent = total.filter(|&t| t > 0).map(|t| {
            ((downloaded as f64 / t as f64) * 100.0).clamp(0.0, 100.0)
        });
        DownloadProgress {
            bytes_downloaded: downloaded,
            total_bytes: total,
            chunk_index,
            bytes_per_second: speed,
            remaining_bytes: remaining,
            percent,
        }
    }
}
