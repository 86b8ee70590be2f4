//! Range planner: coalesces missing byte ranges into HTTP request batches
//!
//! Coalescing trades extra downloaded bytes for fewer HTTP transactions:
//! two ranges separated by at most the threshold are fetched as one. Each
//! request carries at most [`MAX_RANGES_PER_REQUEST`] ranges to keep the
//! `Range` header within common server limits.

use crate::store::ByteRange;

/// Upper bound of ranges per HTTP request
pub const MAX_RANGES_PER_REQUEST: usize = 20;

/// Merge sorted ranges whose gap is at most `threshold` bytes.
///
/// A threshold of 0 disables coalescing entirely (block-aligned missing
/// ranges are never directly adjacent).
pub fn coalesce_ranges(ranges: &[ByteRange], threshold: u64) -> Vec<ByteRange> {
    let mut out: Vec<ByteRange> = Vec::with_capacity(ranges.len());

    for &range in ranges {
        if let Some(last) = out.last_mut() {
            if range.start - last.end <= threshold {
                last.end = range.end;
                continue;
            }
        }
        out.push(range);
    }

    if out.len() < ranges.len() {
        tracing::debug!(
            before = ranges.len(),
            after = out.len(),
            threshold,
            "Coalesced byte ranges"
        );
    }
    out
}

/// Coalesce and split into per-request batches
pub fn plan_requests(ranges: &[ByteRange], threshold: u64) -> Vec<Vec<ByteRange>> {
    let coalesced = if threshold > 0 {
        coalesce_ranges(ranges, threshold)
    } else {
        ranges.to_vec()
    };

    coalesced
        .chunks(MAX_RANGES_PER_REQUEST)
        .map(|chunk| chunk.to_vec())
        .collect()
}
