//! Slice model, layout planning and index reconciliation.
//!
//! A slice is a half-open byte interval `[begin, end)` owned by a single
//! worker. Slices are pairwise disjoint and, when the total size is known,
//! cover `[0, total)` exactly. When the total is unknown a single open-ended
//! slice (`end = None`) carries the whole transfer.

use std::time::Instant;

use crate::config::{SlicePolicy, UncompletedSliceSavePolicy};
use crate::index::{IndexRecord, SliceRecord};

/// Auto policy: resources at or below this size get a single slice.
const AUTO_SINGLE_SLICE_LIMIT: i64 = 1024 * 1024;

/// Auto policy: target bytes per slice.
const AUTO_TARGET_SLICE_SIZE: i64 = 10 * 1024 * 1024;

/// Auto policy: at most this many slices per configured thread.
const AUTO_SLICES_PER_THREAD: i64 = 2;

/// Lifecycle of a slice within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStatus {
    /// Waiting for a worker (possibly behind a retry backoff deadline).
    Pending,
    /// A worker is transferring it.
    Active,
    /// All bytes durable in the data file.
    Completed,
    /// Failed permanently or exhausted its retry budget.
    Failed,
}

/// One contiguous byte range of the resource.
#[derive(Debug, Clone)]
pub struct Slice {
    /// First byte of the slice.
    pub begin: i64,
    /// One past the last byte; `None` while the end is unknown.
    pub end: Option<i64>,
    /// Bytes already flushed to the data file. Monotone within a run.
    pub downloaded: i64,
    pub status: SliceStatus,
    /// Transient failures so far.
    pub retries: u32,
    /// Earliest time the slice may be claimed again after a failure.
    pub not_before: Option<Instant>,
}

impl Slice {
    /// A fresh pending slice over `[begin, end)`.
    pub fn new(begin: i64, end: Option<i64>) -> Self {
        Self {
            begin,
            end,
            downloaded: 0,
            status: SliceStatus::Pending,
            retries: 0,
            not_before: None,
        }
    }

    /// Total length, when the end is known.
    pub fn len(&self) -> Option<i64> {
        self.end.map(|end| end - self.begin)
    }

    /// Bytes not yet durable, when the end is known.
    pub fn remaining(&self) -> Option<i64> {
        self.len().map(|len| len - self.downloaded)
    }

    /// Next byte offset to request from the transport.
    pub fn current_offset(&self) -> i64 {
        self.begin + self.downloaded
    }

    /// Whether every byte of a bounded slice is durable.
    pub fn is_complete(&self) -> bool {
        matches!(self.remaining(), Some(0))
    }

    pub(crate) fn to_record(&self) -> SliceRecord {
        SliceRecord {
            begin: self.begin,
            end: self.end.unwrap_or(-1),
            downloaded: self.downloaded,
        }
    }

    pub(crate) fn from_record(record: &SliceRecord) -> Self {
        let end = (record.end >= 0).then_some(record.end);
        let mut slice = Self::new(record.begin, end);
        slice.downloaded = record.downloaded;
        if slice.is_complete() {
            slice.status = SliceStatus::Completed;
        }
        slice
    }
}

/// A single slice covering the whole resource; open-ended when the total
/// size is unknown. Used when the server refuses byte ranges.
pub fn single_slice(total: Option<i64>) -> Vec<Slice> {
    vec![Slice::new(0, total)]
}

/// Compute the initial slice layout for a resource of known size.
pub fn plan_slices(total: i64, policy: SlicePolicy, thread_num: u32) -> Vec<Slice> {
    if total <= 0 {
        return single_slice(Some(total.max(0)));
    }

    match policy {
        SlicePolicy::FixedNum(num) => {
            let num = num.clamp(1, total);
            let base = total / num;
            (0..num)
                .map(|i| {
                    let end = if i == num - 1 { total } else { (i + 1) * base };
                    Slice::new(i * base, Some(end))
                })
                .collect()
        }
        _ => chunk_range(0, total, slice_size_for(total, policy, thread_num)),
    }
}

/// Byte length per slice implied by the policy for a resource of `total`
/// bytes.
fn slice_size_for(total: i64, policy: SlicePolicy, thread_num: u32) -> i64 {
    match policy {
        SlicePolicy::FixedSize(size) => size.max(1),
        SlicePolicy::FixedNum(num) => {
            let num = num.clamp(1, total.max(1));
            // Floor division: the remainder lands on the last slice.
            (total / num).max(1)
        }
        SlicePolicy::Auto => {
            if total <= AUTO_SINGLE_SLICE_LIMIT {
                return total;
            }
            let max_slices = (thread_num as i64 * AUTO_SLICES_PER_THREAD).max(1);
            let wanted = (total + AUTO_TARGET_SLICE_SIZE - 1) / AUTO_TARGET_SLICE_SIZE;
            let count = wanted.clamp(1, max_slices);
            (total + count - 1) / count
        }
    }
}

/// Split `[begin, end)` into pending slices of `slice_size` bytes; the last
/// slice carries the (shorter) remainder.
fn chunk_range(begin: i64, end: i64, slice_size: i64) -> Vec<Slice> {
    debug_assert!(slice_size > 0);
    let mut slices = Vec::new();
    let mut cursor = begin;
    while cursor < end {
        let slice_end = (cursor + slice_size).min(end);
        slices.push(Slice::new(cursor, Some(slice_end)));
        cursor = slice_end;
    }
    if slices.is_empty() {
        slices.push(Slice::new(begin, Some(end)));
    }
    slices
}

/// Reconcile a loaded index with the current policy parameters.
///
/// A persisted layout consistent with the current policy is adopted
/// verbatim, preserving per-slice progress. Otherwise completed ranges are
/// always kept; partially-downloaded ranges are kept only under
/// `SaveExceptFailed`; the uncovered gaps are re-sliced by the current
/// policy.
pub fn reconcile(
    record: &IndexRecord,
    policy: SlicePolicy,
    save_policy: UncompletedSliceSavePolicy,
    thread_num: u32,
) -> Vec<Slice> {
    // Open-ended history: a single open slice is the only valid layout.
    if record.total_size < 0 {
        if let [only] = record.slices.as_slice() {
            if only.begin == 0 && only.end < 0 {
                return vec![Slice::from_record(only)];
            }
        }
        return single_slice(None);
    }

    let total = record.total_size;

    if layout_matches(record, policy, thread_num) {
        return record.slices.iter().map(Slice::from_record).collect();
    }

    // Keep durable ranges, then re-slice the gaps.
    let mut kept: Vec<Slice> = Vec::new();
    for r in &record.slices {
        let len = r.end - r.begin;
        if r.downloaded >= len {
            kept.push(Slice::from_record(r));
        } else if r.downloaded > 0
            && save_policy == UncompletedSliceSavePolicy::SaveExceptFailed
        {
            let mut partial = Slice::new(r.begin, Some(r.begin + r.downloaded));
            partial.downloaded = r.downloaded;
            partial.status = SliceStatus::Completed;
            kept.push(partial);
        }
    }
    kept.sort_by_key(|s| s.begin);

    let slice_size = slice_size_for(total, policy, thread_num);
    let mut slices: Vec<Slice> = Vec::new();
    let mut cursor = 0i64;
    for keep in kept {
        if keep.begin > cursor {
            slices.extend(chunk_range(cursor, keep.begin, slice_size));
        }
        cursor = keep.end.unwrap_or(cursor);
        slices.push(keep);
    }
    if cursor < total {
        slices.extend(chunk_range(cursor, total, slice_size));
    }
    if slices.is_empty() {
        slices.push(Slice::new(0, Some(total)));
    }
    slices
}

/// Whether the persisted slice boundaries equal the layout the current
/// policy would produce.
fn layout_matches(record: &IndexRecord, policy: SlicePolicy, thread_num: u32) -> bool {
    let planned = plan_slices(record.total_size, policy, thread_num);
    planned.len() == record.slices.len()
        && planned
            .iter()
            .zip(&record.slices)
            .all(|(p, r)| p.begin == r.begin && p.end == Some(r.end))
}

/// Sum of durable bytes across slices.
pub fn total_downloaded(slices: &[Slice]) -> i64 {
    slices.iter().map(|s| s.downloaded).sum()
}

/// Whether every slice has completed.
pub fn all_completed(slices: &[Slice]) -> bool {
    slices.iter().all(|s| s.status == SliceStatus::Completed)
}
