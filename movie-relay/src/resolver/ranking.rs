//! Candidate scoring and ordering.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::domain::{MirrorCandidate, MirrorHit, SearchFilters, normalize_title};

fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Match score of `candidate` against `requested`, with an exact-match flag.
///
/// Identical normalized titles score 1.0; everything else gets the Dice
/// coefficient over character bigrams.
pub fn title_confidence(requested: &str, candidate: &str) -> (f32, bool) {
    let a = normalize_title(requested);
    let b = normalize_title(candidate);
    if a.is_empty() || b.is_empty() {
        return (0.0, false);
    }
    if a == b {
        return (1.0, true);
    }

    let left = bigrams(&a);
    let mut right = bigrams(&b);
    if left.is_empty() || right.is_empty() {
        return (0.0, false);
    }
    let total = left.len() + right.len();
    let mut shared = 0usize;
    for pair in &left {
        if let Some(pos) = right.iter().position(|p| p == pair) {
            right.swap_remove(pos);
            shared += 1;
        }
    }
    // Never let a fuzzy match tie an exact one.
    let score = (2.0 * shared as f32 / total as f32).min(0.99);
    (score, false)
}

/// Score a raw hit. Returns `None` when it cannot satisfy the dub filter.
pub fn score_hit(
    source: &str,
    requested_title: &str,
    hit: MirrorHit,
    filters: &SearchFilters,
) -> Option<MirrorCandidate> {
    let available_dubs: BTreeSet<String> = hit
        .dubs
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();

    // Hits that list dubs must include the requested one; hits listing none
    // are kept, the extractor decides.
    if let Some(dub) = filters.dub.as_deref()
        && !available_dubs.is_empty()
        && !available_dubs.iter().any(|d| d.eq_ignore_ascii_case(dub))
    {
        return None;
    }

    let (confidence, exact_match) = title_confidence(requested_title, &hit.title);
    Some(MirrorCandidate {
        source: source.to_string(),
        source_url: hit.url,
        title: hit.title,
        confidence,
        exact_match,
        available_dubs,
    })
}

/// Total order: confidence desc, exact before fuzzy, more dubs first, then URL.
pub fn compare_candidates(a: &MirrorCandidate, b: &MirrorCandidate) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(b.exact_match.cmp(&a.exact_match))
        .then(b.available_dubs.len().cmp(&a.available_dubs.len()))
        .then_with(|| a.source_url.cmp(&b.source_url))
}

/// Sort and drop repeated URLs, keeping the best-ranked copy.
pub fn rank(mut candidates: Vec<MirrorCandidate>) -> Vec<MirrorCandidate> {
    candidates.sort_by(compare_candidates);
    let mut seen = BTreeSet::new();
    candidates.retain(|c| seen.insert(crate::domain::normalize_source_url(&c.source_url)));
    candidates
}
