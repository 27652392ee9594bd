//! Best-version selection: one winning recording per performance date.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::quality;
use crate::types::CandidateRecording;

static DATE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^\s*(\d{4}-\d{2}-\d{2})").expect("date prefix pattern is valid")
});

/// Outcome of selecting winners from a candidate list
#[derive(Clone, Debug, Default)]
pub struct Selection {
    /// One winner per distinct date, ordered by date
    pub winners: Vec<CandidateRecording>,
    /// Candidates considered
    pub candidates_seen: usize,
    /// Candidates excluded because their date could not be parsed
    pub undated: usize,
}

impl Selection {
    /// Winning identifiers in date order
    pub fn identifiers(&self) -> Vec<String> {
        self.winners.iter().map(|c| c.identifier.clone()).collect()
    }
}

/// Calendar date (`YYYY-MM-DD`) of a candidate, if its date field has one
pub fn performance_date(candidate: &CandidateRecording) -> Option<String> {
    let raw = candidate.date.as_ref()?.first()?;
    DATE_PREFIX
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Group candidates by date and keep the best of each group
///
/// Undated candidates are dropped from selection and counted in
/// [`Selection::undated`].
pub fn select_best_versions(candidates: &[CandidateRecording]) -> Selection {
    let mut by_date: BTreeMap<String, Vec<&CandidateRecording>> = BTreeMap::new();
    let mut undated = 0usize;

    for candidate in candidates {
        match performance_date(candidate) {
            Some(date) => by_date.entry(date).or_default().push(candidate),
            None => {
                undated += 1;
                tracing::debug!(
                    identifier = %candidate.identifier,
                    "Skipping candidate without a parseable date"
                );
            }
        }
    }

    let winners = by_date
        .into_values()
        .filter_map(|mut group| {
            // sort_by is stable: full ties keep search order
            group.sort_by(|a, b| quality::compare(a, b));
            group.first().map(|best| (*best).clone())
        })
        .collect();

    Selection {
        winners,
        candidates_seen: candidates.len(),
        undated,
    }
}
