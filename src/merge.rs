//! Series merge engine
//!
//! Combines a cached window with a newly fetched increment into a
//! deduplicated, date-ordered, bounded series:
//!
//! 1. Concatenate existing points with increment points
//! 2. Stable sort by date ascending
//! 3. Deduplicate by date, keeping the last occurrence - increments
//!    override stale cached values at overlapping dates
//! 4. Retain only the trailing `window_size` entries
//!
//! The operation is idempotent: re-applying the same increment produces an
//! identical result.

use crate::types::PricePoint;

/// Merge an increment into an existing point window
///
/// Pass an empty `existing` slice to normalize a freshly fetched full
/// window through the same sort/dedup/truncate path.
pub fn merge_points(
    existing: &[PricePoint],
    increment: &[PricePoint],
    window_size: usize,
) -> Vec<PricePoint> {
    let mut combined: Vec<PricePoint> = Vec::with_capacity(existing.len() + increment.len());
    combined.extend_from_slice(existing);
    combined.extend_from_slice(increment);

    // Stable sort keeps increment points after existing points at equal
    // dates, so keep-last resolves overlaps in favor of the increment.
    combined.sort_by_key(|point| point.date);

    let mut merged: Vec<PricePoint> = Vec::with_capacity(combined.len());
    for point in combined {
        if merged.last().is_some_and(|last| last.date == point.date) {
            if let Some(slot) = merged.last_mut() {
                *slot = point;
            }
        } else {
            merged.push(point);
        }
    }

    if merged.len() > window_size {
        merged.drain(..merged.len() - window_size);
    }
    merged
}

/// Check the merge output invariants: strictly increasing unique dates and
/// bounded length
pub fn is_well_formed(points: &[PricePoint], window_size: usize) -> bool {
    points.len() <= window_size && points.windows(2).all(|pair| pair[0].date < pair[1].date)
}
