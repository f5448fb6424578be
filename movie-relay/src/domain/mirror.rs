//! Mirror search value objects.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A source location that may host the requested content.
///
/// Transient: produced per search and dropped once a job has consumed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorCandidate {
    /// Name of the mirror source that returned this hit.
    pub source: String,
    pub source_url: String,
    pub title: String,
    /// Match score against the requested title, 0.0-1.0.
    pub confidence: f32,
    /// Normalized titles are identical.
    pub exact_match: bool,
    pub available_dubs: BTreeSet<String>,
}

impl MirrorCandidate {
    pub fn has_dub(&self, dub: &str) -> bool {
        self.available_dubs
            .iter()
            .any(|d| d.eq_ignore_ascii_case(dub))
    }
}

/// Raw hit from a mirror source, before scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorHit {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub dubs: Vec<String>,
}

/// Filters applied to a mirror search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub lang: Option<String>,
    /// Only candidates offering this dub are returned.
    pub dub: Option<String>,
    /// Restrict the search to one named source.
    pub source: Option<String>,
}

impl SearchFilters {
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    pub fn with_dub(mut self, dub: Option<String>) -> Self {
        self.dub = dub;
        self
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }
}
