//! Ranking between two recordings of the same date.
//!
//! The order is evaluated key by key until a tie breaks:
//! 1. soundboard sources outrank audience sources
//! 2. higher average rating
//! 3. more reviews
//! 4. more downloads
//!
//! Candidates that tie on every key compare `Equal`, so a stable sort keeps
//! their input order.

use std::cmp::Ordering;

use crate::types::CandidateRecording;

/// Compare two candidates; `Ordering::Less` means `a` is the better recording
///
/// Intended for `sort_by`, which then puts the best candidate first.
pub fn compare(a: &CandidateRecording, b: &CandidateRecording) -> Ordering {
    b.soundboard
        .cmp(&a.soundboard)
        .then_with(|| b.avg_rating.total_cmp(&a.avg_rating))
        .then_with(|| b.num_reviews.cmp(&a.num_reviews))
        .then_with(|| b.downloads.cmp(&a.downloads))
}

/// `a` is strictly better than `b`
pub fn outranks(a: &CandidateRecording, b: &CandidateRecording) -> bool {
    compare(a, b) == Ordering::Less
}
