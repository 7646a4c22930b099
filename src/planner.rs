//! Chunk planning
//!
//! Translates a total length plus any prior progress into the set of range
//! jobs for one download attempt. Plans partition the outstanding bytes:
//! ascending index order, no overlaps, no gaps.

use crate::config::ChunkingConfig;
use crate::types::ChunkState;

/// One range job for a fetcher task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub index: u32,
    /// First byte of the chunk's slice
    pub start: u64,
    /// Last byte of the slice, `None` when the payload length is unknown
    pub end_inclusive: Option<u64>,
    /// First byte this attempt actually fetches (>= start after resume)
    pub resume_offset: u64,
}

impl ChunkPlan {
    /// Initial chunk state for this plan
    pub fn to_state(self) -> ChunkState {
        ChunkState::new(self.index, self.start, self.end_inclusive, self.resume_offset)
    }
}

/// Derive the range jobs for an attempt.
///
/// With an unknown (or zero) total this is a single unbounded plan. With a
/// known total the payload is sliced by `chunking`, then each slice's
/// resume offset comes from `prior_states` (preferred) or `start_offset`.
/// Slices that are already complete are dropped.
pub fn plan_chunks(
    total_bytes: Option<u64>,
    chunking: &ChunkingConfig,
    start_offset: u64,
    prior_states: &[ChunkState],
) -> Vec<ChunkPlan> {
    let total = match total_bytes {
        Some(t) if t > 0 => t,
        _ => return vec![unbounded_plan(start_offset, prior_states)],
    };

    let ranges = slice_ranges(total, chunking);

    if !prior_states.is_empty() {
        return resume_from_states(&ranges, prior_states);
    }

    if start_offset > 0 {
        return resume_from_offset(&ranges, start_offset, total);
    }

    ranges
        .iter()
        .enumerate()
        .map(|(i, &(start, end))| ChunkPlan {
            index: i as u32,
            start,
            end_inclusive: Some(end),
            resume_offset: start,
        })
        .collect()
}

/// Single open-ended plan for unknown-length payloads
fn unbounded_plan(start_offset: u64, prior_states: &[ChunkState]) -> ChunkPlan {
    // A prior unbounded state may be further along than the recorded
    // completed-bytes offset; the checkpoint is the source of truth.
    let resume = prior_states
        .iter()
        .find(|s| s.end_inclusive.is_none())
        .map(|s| s.next_offset.max(start_offset))
        .unwrap_or(start_offset);
    ChunkPlan {
        index: 0,
        start: resume,
        end_inclusive: None,
        resume_offset: resume,
    }
}

/// Split `[0, total)` into contiguous half-open slices; the last slice
/// absorbs the division remainder.
fn slice_ranges(total: u64, chunking: &ChunkingConfig) -> Vec<(u64, u64)> {
    let effective = (total / chunking.chunk_count as u64).max(chunking.min_chunk_size_bytes);
    let count = total
        .div_ceil(effective)
        .clamp(1, chunking.chunk_count as u64);

    let slice = total / count;
    (0..count)
        .map(|i| {
            let start = i * slice;
            let end = if i == count - 1 { total - 1 } else { (i + 1) * slice - 1 };
            (start, end)
        })
        .collect()
}

fn resume_from_states(ranges: &[(u64, u64)], prior_states: &[ChunkState]) -> Vec<ChunkPlan> {
    ranges
        .iter()
        .enumerate()
        .filter_map(|(i, &(start, end))| {
            let resume = prior_states
                .iter()
                .find(|s| s.index == i as u32)
                .map(|s| s.next_offset.clamp(start, end + 1))
                .unwrap_or(start);
            if resume >= end + 1 {
                return None; // chunk already complete
            }
            Some(ChunkPlan {
                index: i as u32,
                start,
                end_inclusive: Some(end),
                resume_offset: resume,
            })
        })
        .collect()
}

fn resume_from_offset(ranges: &[(u64, u64)], start_offset: u64, total: u64) -> Vec<ChunkPlan> {
    let plans: Vec<ChunkPlan> = ranges
        .iter()
        .enumerate()
        .filter(|&(_, &(_, end))| start_offset <= end)
        .map(|(i, &(start, end))| ChunkPlan {
            index: i as u32,
            start,
            end_inclusive: Some(end),
            resume_offset: if start_offset >= start { start_offset } else { start },
        })
        .collect();

    if plans.is_empty() {
        // Offset at or past the end: re-fetch the tail so the attempt still
        // has something to verify against.
        let start = start_offset.min(total - 1);
        return vec![ChunkPlan {
            index: 0,
            start,
            end_inclusive: Some(total - 1),
            resume_offset: start,
        }];
    }

    plans
}
